//! Step scheduling.
//!
//! Every scheduled step becomes one task on the run's [`Executor`]. The task
//! waits for the step's prerequisites, runs the step's work inside an
//! [`ExecuteContext`] and publishes the terminal status exactly once.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{FutureExt, join_all};
use kiln_storage::{ObjectId, ObjectStore, VersionTracker, VirtualFileSystem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ResultCache;
use crate::command::CommandRegistry;
use crate::context::ExecuteContext;
use crate::error::{BuildError, StepError};
use crate::events::{BuildEvent, BuildNotifier};
use crate::executor::{Executor, panic_message};
use crate::log::LogLevel;
use crate::status::{BuildMode, ResultStatus, StepCounter};
use crate::step::BuildStep;

/// Collaborators a run borrows from its builder.
pub(crate) struct RunServices {
  pub(crate) store: Arc<dyn ObjectStore>,
  pub(crate) tracker: Arc<dyn VersionTracker>,
  pub(crate) vfs: Arc<VirtualFileSystem>,
  pub(crate) registry: Arc<CommandRegistry>,
  pub(crate) counter: Arc<StepCounter>,
  pub(crate) notifier: Arc<dyn BuildNotifier>,
}

/// State shared by every task of one build run.
pub(crate) struct RunState {
  pub(crate) executor: Executor,
  pub(crate) mode: BuildMode,
  pub(crate) token: CancellationToken,
  pub(crate) store: Arc<dyn ObjectStore>,
  pub(crate) cache: ResultCache,
  pub(crate) tracker: Arc<dyn VersionTracker>,
  pub(crate) vfs: Arc<VirtualFileSystem>,
  pub(crate) registry: Arc<CommandRegistry>,
  counter: Arc<StepCounter>,
  notifier: Arc<dyn BuildNotifier>,
  running_commands: Mutex<HashMap<ObjectId, Arc<BuildStep>>>,
  next_execution_id: AtomicU64,
  fatal: Mutex<Option<BuildError>>,
}

impl RunState {
  pub(crate) fn new(services: RunServices, mode: BuildMode, token: CancellationToken) -> Arc<Self> {
    Arc::new(Self {
      executor: Executor::new(),
      mode,
      token,
      cache: ResultCache::new(services.store.clone()),
      store: services.store,
      tracker: services.tracker,
      vfs: services.vfs,
      registry: services.registry,
      counter: services.counter,
      notifier: services.notifier,
      running_commands: Mutex::new(HashMap::new()),
      next_execution_id: AtomicU64::new(1),
      fatal: Mutex::new(None),
    })
  }

  /// Create the task of `step` and queue it.
  ///
  /// A step that already has an execution id is left alone. The instigator
  /// becomes the step's parent if it has none; a different existing parent
  /// is a fatal error.
  pub(crate) fn schedule(
    self: &Arc<Self>,
    instigator: Option<&Arc<BuildStep>>,
    step: &Arc<BuildStep>,
  ) -> Result<(), BuildError> {
    if step.is_scheduled() {
      return Ok(());
    }

    if let Some(instigator) = instigator
      && step.set_parent(instigator).is_err()
    {
      error!(
        step = %step.title(),
        instigator = %instigator.title(),
        "scheduling a build step with a different instigator than its parent"
      );
      self.fail(BuildError::ParentConflict {
        step: step.title().to_string(),
      });
      return Err(BuildError::ParentConflict {
        step: step.title().to_string(),
      });
    }

    let execution_id = self.next_execution_id.fetch_add(1, Ordering::Relaxed);
    if !step.assign_execution_id(execution_id) {
      // Claimed concurrently.
      return Ok(());
    }
    if let Some(instigator) = instigator {
      instigator.push_spawned(step.clone());
    }

    let priority = step.effective_priority();
    debug!(execution_id, step = %step.title(), priority, "build step scheduled");
    self.notifier.notify(BuildEvent::StepScheduled {
      execution_id,
      title: step.title().to_string(),
      priority,
    });
    self
      .executor
      .spawn(priority, run_step(self.clone(), step.clone(), execution_id));
    Ok(())
  }

  pub(crate) fn running_command(&self, command_hash: &ObjectId) -> Option<Arc<BuildStep>> {
    let running = self
      .running_commands
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    running.get(command_hash).cloned()
  }

  /// Claim `command_hash` for `step`. Returns the step holding it if it is
  /// somebody else.
  pub(crate) fn try_start_command(
    &self,
    command_hash: ObjectId,
    step: &Arc<BuildStep>,
  ) -> Option<Arc<BuildStep>> {
    let mut running = self
      .running_commands
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    match running.get(&command_hash) {
      Some(holder) if !Arc::ptr_eq(holder, step) => Some(holder.clone()),
      Some(_) => None,
      None => {
        running.insert(command_hash, step.clone());
        None
      }
    }
  }

  pub(crate) fn finish_command(&self, command_hash: &ObjectId, step: &Arc<BuildStep>) {
    let mut running = self
      .running_commands
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    if running
      .get(command_hash)
      .is_some_and(|holder| Arc::ptr_eq(holder, step))
    {
      running.remove(command_hash);
    }
  }

  /// Record a fatal error and cancel the run. The first error wins.
  pub(crate) fn fail(&self, error: BuildError) {
    {
      let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
      if fatal.is_none() {
        *fatal = Some(error);
      }
    }
    self.token.cancel();
  }

  pub(crate) fn take_fatal(&self) -> Option<BuildError> {
    self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
  }

  pub(crate) fn notify(&self, event: BuildEvent) {
    self.notifier.notify(event);
  }
}

/// Releases waiters if a step task is dropped before publishing a status.
struct TaskGuard {
  run: Arc<RunState>,
  step: Arc<BuildStep>,
  finished: bool,
}

impl Drop for TaskGuard {
  fn drop(&mut self) {
    if !self.finished {
      self.step.abort();
      self.run.fail(BuildError::WorkerPanicked {
        message: format!("task of build step {} ended without a status", self.step.title()),
      });
    }
  }
}

async fn run_step(run: Arc<RunState>, step: Arc<BuildStep>, execution_id: u64) {
  let mut guard = TaskGuard {
    run: run.clone(),
    step: step.clone(),
    finished: false,
  };

  let prerequisites = step.prerequisites();
  for prerequisite in &prerequisites {
    // Prerequisites nobody scheduled would never complete. They publish into
    // their own parent's outputs, or the dependent's parent if they have none.
    let instigator = prerequisite.parent().or_else(|| step.parent());
    if let Err(e) = run.schedule(instigator.as_ref(), prerequisite) {
      error!(execution_id, step = %step.title(), error = %e, "failed to schedule prerequisite");
    }
  }
  let prerequisite_statuses = join_all(prerequisites.iter().map(|p| p.wait_processed())).await;

  let status = if prerequisite_statuses.iter().all(|s| s.succeeded()) {
    if run.token.is_cancelled() && step.is_leaf() {
      ResultStatus::Cancelled
    } else {
      execute_step(&run, &step, execution_id).await
    }
  } else {
    ResultStatus::NotTriggeredPrerequisiteFailed
  };

  guard.finished = true;
  let title = step.title();
  match status {
    ResultStatus::NotProcessed => {
      error!(execution_id, step = %title, "build step returned without a result status");
      step.abort();
      run.fail(BuildError::StepNotProcessed {
        step: title.to_string(),
      });
      return;
    }
    ResultStatus::Successful => info!(execution_id, step = %title, "build step was successful"),
    ResultStatus::Failed => error!(execution_id, step = %title, "build step failed"),
    ResultStatus::Cancelled => warn!(execution_id, step = %title, "build step cancelled"),
    ResultStatus::NotTriggeredWasSuccessful => {
      debug!(execution_id, step = %title, "build step is up-to-date and has been skipped")
    }
    ResultStatus::NotTriggeredPrerequisiteFailed => {
      debug!(execution_id, step = %title, "build step not triggered, a prerequisite did not succeed")
    }
  }

  if let Err(e) = step.complete(status) {
    run.fail(e);
    return;
  }
  if step.is_leaf() {
    run.counter.add_step_result(status);
  }
  run.notify(BuildEvent::StepCompleted {
    execution_id,
    title: title.to_string(),
    status,
  });
}

async fn execute_step(run: &Arc<RunState>, step: &Arc<BuildStep>, execution_id: u64) -> ResultStatus {
  run.notify(BuildEvent::StepStarted {
    execution_id,
    title: step.title().to_string(),
  });

  let ctx = ExecuteContext::new(run.clone(), step.clone());
  let outcome = AssertUnwindSafe(step.execute(&ctx)).catch_unwind().await;

  match outcome {
    Ok(Ok(status)) => status,
    Ok(Err(StepError::Cancelled)) => ResultStatus::Cancelled,
    Ok(Err(StepError::Aborted(reason))) => {
      ctx.log(
        LogLevel::Warning,
        format!(
          "A child task of build step {} was aborted without being handled. The command has not handled cancellation gracefully.",
          step.title()
        ),
      );
      ctx.log(LogLevel::Warning, reason);
      ResultStatus::Cancelled
    }
    Ok(Err(e)) => {
      ctx.log(
        LogLevel::Error,
        format!("Exception in command {}: {}", step.title(), e),
      );
      ResultStatus::Failed
    }
    Err(payload) => {
      ctx.log(
        LogLevel::Error,
        format!(
          "Exception in command {}: {}",
          step.title(),
          panic_message(payload.as_ref())
        ),
      );
      ResultStatus::Failed
    }
  }
}
