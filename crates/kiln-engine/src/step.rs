//! Build step graph model.
//!
//! A [`BuildStep`] is a reference-counted node. Prerequisites and spawned
//! children are strong references; the structural parent is a weak reference
//! assigned at most once.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, join_all};
use kiln_storage::{ObjectId, ObjectUrl};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandStep};
use crate::context::ExecuteContext;
use crate::dynamic::DynamicStep;
use crate::error::{BuildError, StepError};
use crate::list::ListStep;
use crate::log::{LogLevel, LogMessage, StepLog};
use crate::status::ResultStatus;

/// Priority that is served before every other.
pub const HIGHEST_PRIORITY: i32 = i32::MIN;

/// Priority used when neither a step nor any of its ancestors sets one.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Host-defined step work.
#[async_trait]
pub trait StepWork: Send + Sync {
  async fn execute(&self, ctx: &ExecuteContext) -> Result<ResultStatus, StepError>;
}

pub enum StepKind {
  /// Runs its children in order and aggregates their statuses.
  List(ListStep),
  /// Runs a cacheable command.
  Command(CommandStep),
  /// Pulls steps from a provider at runtime.
  Dynamic(DynamicStep),
  /// Barrier inside a list.
  Wait,
  Custom(Box<dyn StepWork>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
  Pending,
  Done(ResultStatus),
  /// Work ended without a status. Waiters observe `NotProcessed`.
  Aborted,
}

/// An output registered into a container step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputObject {
  pub object_id: ObjectId,
  pub tags: BTreeSet<String>,
}

/// Output objects produced by the subtree of a container step.
#[derive(Debug, Default)]
pub struct OutputGroup {
  objects: RwLock<HashMap<ObjectUrl, OutputObject>>,
}

impl OutputGroup {
  pub fn get(&self, url: &ObjectUrl) -> Option<ObjectId> {
    let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
    objects
      .get(url)
      .map(|o| o.object_id)
      .filter(|id| !id.is_empty())
  }

  /// Record an output. Returns the previous hash if a different one was registered.
  pub(crate) fn insert(&self, url: ObjectUrl, id: ObjectId) -> Option<ObjectId> {
    let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
    let object = objects.entry(url).or_insert_with(|| OutputObject {
      object_id: id,
      tags: BTreeSet::new(),
    });
    let previous = object.object_id;
    object.object_id = id;
    (!previous.is_empty() && previous != id).then_some(previous)
  }

  pub(crate) fn add_tag(&self, url: &ObjectUrl, tag: &str) {
    let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
    objects
      .entry(url.clone())
      .or_insert_with(|| OutputObject {
        object_id: ObjectId::EMPTY,
        tags: BTreeSet::new(),
      })
      .tags
      .insert(tag.to_string());
  }

  /// All outputs, ordered by url.
  pub fn snapshot(&self) -> Vec<(ObjectUrl, OutputObject)> {
    let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
    let mut snapshot: Vec<_> = objects
      .iter()
      .map(|(url, object)| (url.clone(), object.clone()))
      .collect();
    snapshot.sort_by(|a, b| a.0.cmp(&b.0));
    snapshot
  }

  pub fn len(&self) -> usize {
    self.objects.read().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// A node in the build graph.
pub struct BuildStep {
  title: String,
  priority: Option<i32>,
  kind: StepKind,
  execution_id: AtomicU64,
  parent: OnceLock<Weak<BuildStep>>,
  prerequisites: Mutex<Vec<Arc<BuildStep>>>,
  spawned: Mutex<Vec<Arc<BuildStep>>>,
  completion: watch::Sender<Completion>,
  outputs: Option<OutputGroup>,
  log: StepLog,
  tag: OnceLock<Arc<dyn Any + Send + Sync>>,
}

impl BuildStep {
  fn new(title: String, kind: StepKind) -> Self {
    let outputs = matches!(kind, StepKind::List(_) | StepKind::Dynamic(_)).then(OutputGroup::default);
    let priority = matches!(kind, StepKind::Dynamic(_)).then_some(HIGHEST_PRIORITY);

    Self {
      title,
      priority,
      kind,
      execution_id: AtomicU64::new(0),
      parent: OnceLock::new(),
      prerequisites: Mutex::new(Vec::new()),
      spawned: Mutex::new(Vec::new()),
      completion: watch::Sender::new(Completion::Pending),
      outputs,
      log: StepLog::default(),
      tag: OnceLock::new(),
    }
  }

  pub fn list(title: impl Into<String>) -> Self {
    Self::new(title.into(), StepKind::List(ListStep::default()))
  }

  pub fn command(command: Arc<dyn Command>) -> Self {
    let title = command.title();
    Self::new(title, StepKind::Command(CommandStep::new(command)))
  }

  /// A dynamic work pool. Runs at [`HIGHEST_PRIORITY`] unless overridden.
  pub fn dynamic(title: impl Into<String>, dynamic: DynamicStep) -> Self {
    Self::new(title.into(), StepKind::Dynamic(dynamic))
  }

  pub fn wait() -> Self {
    Self::new("Wait".to_string(), StepKind::Wait)
  }

  pub fn custom(title: impl Into<String>, work: impl StepWork + 'static) -> Self {
    Self::new(title.into(), StepKind::Custom(Box::new(work)))
  }

  pub fn with_priority(mut self, priority: i32) -> Self {
    self.priority = Some(priority);
    self
  }

  /// Attach a host-defined payload.
  pub fn with_tag<T: Any + Send + Sync>(self, tag: T) -> Self {
    let _ = self.tag.set(Arc::new(tag));
    self
  }

  pub fn title(&self) -> &str {
    &self.title
  }

  pub fn kind(&self) -> &StepKind {
    &self.kind
  }

  pub fn as_list(&self) -> Option<&ListStep> {
    match &self.kind {
      StepKind::List(list) => Some(list),
      _ => None,
    }
  }

  pub fn as_command(&self) -> Option<&CommandStep> {
    match &self.kind {
      StepKind::Command(command) => Some(command),
      _ => None,
    }
  }

  pub fn as_dynamic(&self) -> Option<&DynamicStep> {
    match &self.kind {
      StepKind::Dynamic(dynamic) => Some(dynamic),
      _ => None,
    }
  }

  pub fn is_wait(&self) -> bool {
    matches!(self.kind, StepKind::Wait)
  }

  /// Leaf steps are the ones tallied in the run summary.
  pub(crate) fn is_leaf(&self) -> bool {
    matches!(self.kind, StepKind::Command(_) | StepKind::Custom(_))
  }

  /// The typed host payload, if one of type `T` was attached.
  pub fn tag<T: Any + Send + Sync>(&self) -> Option<&T> {
    self.tag.get()?.downcast_ref::<T>()
  }

  /// Attach a host payload after construction. Returns `false` if one was already set.
  pub fn set_tag<T: Any + Send + Sync>(&self, tag: T) -> bool {
    self.tag.set(Arc::new(tag)).is_ok()
  }

  pub fn priority(&self) -> Option<i32> {
    self.priority
  }

  /// The first explicit priority found on this step or its ancestors.
  pub fn effective_priority(&self) -> i32 {
    if let Some(priority) = self.priority {
      return priority;
    }
    let mut current = self.parent();
    while let Some(step) = current {
      if let Some(priority) = step.priority {
        return priority;
      }
      current = step.parent();
    }
    DEFAULT_PRIORITY
  }

  pub fn execution_id(&self) -> Option<u64> {
    match self.execution_id.load(Ordering::Acquire) {
      0 => None,
      id => Some(id),
    }
  }

  pub fn is_scheduled(&self) -> bool {
    self.execution_id().is_some()
  }

  /// Claim the step for scheduling. Only the first caller succeeds.
  pub(crate) fn assign_execution_id(&self, id: u64) -> bool {
    self
      .execution_id
      .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  pub fn parent(&self) -> Option<Arc<BuildStep>> {
    self.parent.get().and_then(Weak::upgrade)
  }

  /// Assign the structural parent. Setting the same parent again is a no-op;
  /// a different one is a contract violation.
  pub fn set_parent(&self, parent: &Arc<BuildStep>) -> Result<(), BuildError> {
    let current = self.parent.get_or_init(|| Arc::downgrade(parent));
    if std::ptr::eq(current.as_ptr(), Arc::as_ptr(parent)) {
      Ok(())
    } else {
      Err(BuildError::ParentConflict {
        step: self.title.clone(),
      })
    }
  }

  /// Append a child to a list step, making this step its parent.
  pub fn add_step(self: &Arc<Self>, child: Arc<BuildStep>) -> Result<(), BuildError> {
    let Some(list) = self.as_list() else {
      return Err(BuildError::NotAList {
        step: self.title.clone(),
      });
    };
    child.set_parent(self)?;
    list.push(child);
    Ok(())
  }

  /// Declare that this step may only run after `step` reaches a terminal status.
  pub fn add_prerequisite(&self, step: &Arc<BuildStep>) {
    let mut prerequisites = self.prerequisites.lock().unwrap_or_else(|e| e.into_inner());
    if !prerequisites.iter().any(|p| Arc::ptr_eq(p, step)) {
      prerequisites.push(step.clone());
    }
  }

  pub fn prerequisites(&self) -> Vec<Arc<BuildStep>> {
    self
      .prerequisites
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Steps scheduled with this step as instigator.
  pub fn spawned_steps(&self) -> Vec<Arc<BuildStep>> {
    self
      .spawned
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  pub(crate) fn push_spawned(&self, step: Arc<BuildStep>) {
    self
      .spawned
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(step);
  }

  pub fn status(&self) -> ResultStatus {
    match *self.completion.borrow() {
      Completion::Done(status) => status,
      _ => ResultStatus::NotProcessed,
    }
  }

  pub fn succeeded(&self) -> bool {
    self.status().succeeded()
  }

  pub fn failed(&self) -> bool {
    self.status().failed()
  }

  pub fn is_processed(&self) -> bool {
    self.status().is_processed()
  }

  /// Set the terminal status and wake every waiter. Fires exactly once.
  pub(crate) fn complete(&self, status: ResultStatus) -> Result<(), BuildError> {
    let fired = self.completion.send_if_modified(|completion| {
      if *completion == Completion::Pending {
        *completion = Completion::Done(status);
        true
      } else {
        false
      }
    });

    if fired {
      Ok(())
    } else {
      Err(BuildError::StatusAlreadySet {
        step: self.title.clone(),
      })
    }
  }

  /// Release waiters without setting a status.
  pub(crate) fn abort(&self) {
    self.completion.send_if_modified(|completion| {
      if *completion == Completion::Pending {
        *completion = Completion::Aborted;
        true
      } else {
        false
      }
    });
  }

  /// Resolves once this step reaches a terminal status. Already processed
  /// steps resolve immediately.
  pub fn wait_processed(&self) -> impl Future<Output = ResultStatus> + Send + 'static {
    let mut receiver = self.completion.subscribe();
    async move {
      let status = match receiver.wait_for(|c| *c != Completion::Pending).await {
        Ok(completion) => match *completion {
          Completion::Done(status) => status,
          _ => ResultStatus::NotProcessed,
        },
        Err(_) => ResultStatus::NotProcessed,
      };
      status
    }
  }

  /// Resolves once this step and everything it spawned, transitively, are processed.
  pub fn wait_completed(self: Arc<Self>) -> BoxFuture<'static, ResultStatus> {
    async move {
      let status = self.wait_processed().await;
      let spawned = self.spawned_steps();
      join_all(spawned.into_iter().map(BuildStep::wait_completed)).await;
      status
    }
    .boxed()
  }

  pub fn log(&self) -> &StepLog {
    &self.log
  }

  /// Append to the step log and forward to `tracing`.
  pub fn write_log(&self, level: LogLevel, text: impl Into<String>) {
    let text = text.into();
    let execution_id = self.execution_id().unwrap_or_default();
    match level {
      LogLevel::Debug => debug!(execution_id, step = %self.title, "{}", text),
      LogLevel::Info => info!(execution_id, step = %self.title, "{}", text),
      LogLevel::Warning => warn!(execution_id, step = %self.title, "{}", text),
      LogLevel::Error => error!(execution_id, step = %self.title, "{}", text),
    }
    self.log.push(LogMessage::new(level, text));
  }

  /// Outputs of this step's subtree. Only container steps have one.
  pub fn output_group(&self) -> Option<&OutputGroup> {
    self.outputs.as_ref()
  }

  /// This step, if it is a container, followed by every container ancestor up to the root.
  pub fn output_object_groups(self: &Arc<Self>) -> Vec<Arc<BuildStep>> {
    let mut groups = Vec::new();
    let mut current = Some(self.clone());
    while let Some(step) = current {
      current = step.parent();
      if step.outputs.is_some() {
        groups.push(step);
      }
    }
    groups
  }

  pub(crate) fn execute<'a>(
    self: &'a Arc<Self>,
    ctx: &'a ExecuteContext,
  ) -> BoxFuture<'a, Result<ResultStatus, StepError>> {
    match &self.kind {
      StepKind::List(list) => list.execute(self, ctx).boxed(),
      StepKind::Command(command) => command.execute(self, ctx).boxed(),
      StepKind::Dynamic(dynamic) => dynamic.execute(self, ctx).boxed(),
      StepKind::Wait => async { Ok(ResultStatus::Successful) }.boxed(),
      StepKind::Custom(work) => work.execute(ctx),
    }
  }
}

impl fmt::Debug for BuildStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BuildStep")
      .field("title", &self.title)
      .field("execution_id", &self.execution_id())
      .field("status", &self.status())
      .finish()
  }
}
