//! Execution contexts handed to running steps and commands.
//!
//! [`ExecuteContext`] is the capability object every executing step receives:
//! input hashing, output publication, sub-scheduling and the in-flight
//! command registry all go through it. [`CommandContext`] is the narrower
//! view a [`Command`](crate::Command) uses; everything registered through it
//! ends up in the command's [`ResultEntry`].

use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use kiln_storage::{ObjectId, ObjectStore, ObjectUrl, StorageError, UrlType, VirtualFileSystem};
use tokio_util::sync::CancellationToken;

use crate::cache::{ResultCache, ResultEntry};
use crate::command::{Command, CommandRecord, CommandRegistry};
use crate::error::{BuildError, StepError};
use crate::log::{LogLevel, LogMessage};
use crate::scheduler::RunState;
use crate::status::{BuildMode, ResultStatus};
use crate::step::BuildStep;

/// Context of one executing step.
pub struct ExecuteContext {
  run: Arc<RunState>,
  step: Arc<BuildStep>,
  groups: OnceLock<Vec<Arc<BuildStep>>>,
}

impl ExecuteContext {
  pub(crate) fn new(run: Arc<RunState>, step: Arc<BuildStep>) -> Self {
    Self {
      run,
      step,
      groups: OnceLock::new(),
    }
  }

  pub fn step(&self) -> &Arc<BuildStep> {
    &self.step
  }

  pub fn mode(&self) -> BuildMode {
    self.run.mode
  }

  pub fn cancellation_token(&self) -> &CancellationToken {
    &self.run.token
  }

  pub fn is_cancelled(&self) -> bool {
    self.run.token.is_cancelled()
  }

  pub fn store(&self) -> &Arc<dyn ObjectStore> {
    &self.run.store
  }

  pub fn vfs(&self) -> &VirtualFileSystem {
    &self.run.vfs
  }

  pub fn registry(&self) -> &CommandRegistry {
    &self.run.registry
  }

  pub(crate) fn cache(&self) -> &ResultCache {
    &self.run.cache
  }

  /// Append to the current step's log.
  pub fn log(&self, level: LogLevel, text: impl Into<String>) {
    self.step.write_log(level, text);
  }

  /// Content hash of a named input, or [`ObjectId::EMPTY`] if it cannot be resolved.
  ///
  /// Files go through the version tracker, internal urls through the outputs
  /// already produced in this build, virtual urls through the mounted provider.
  pub fn compute_input_hash(&self, url: &ObjectUrl) -> ObjectId {
    match url.url_type {
      UrlType::File => self.run.tracker.hash_of(Path::new(&url.path)),
      UrlType::Internal => self.find_output(url).unwrap_or_else(|| {
        self.log(
          LogLevel::Warning,
          format!(
            "Unable to find the hash of {} in the build transaction. The build cache will not work for this command!",
            url
          ),
        );
        ObjectId::EMPTY
      }),
      UrlType::Virtual => self.run.vfs.object_id(&url.path).unwrap_or_else(|| {
        self.log(
          LogLevel::Warning,
          format!("Unable to resolve {} through the virtual file system", url),
        );
        ObjectId::EMPTY
      }),
    }
  }

  /// Schedule a step as a child of the current step.
  pub fn schedule_build_step(&self, step: &Arc<BuildStep>) -> Result<(), BuildError> {
    self.run.schedule(Some(&self.step), step)
  }

  pub fn is_command_currently_running(&self, command_hash: &ObjectId) -> bool {
    self.run.running_command(command_hash).is_some()
  }

  /// Register the current step as running `command_hash`. Returns `false` if
  /// another step already holds it.
  pub fn notify_command_started(&self, command_hash: ObjectId) -> bool {
    self.run.try_start_command(command_hash, &self.step).is_none()
  }

  pub fn notify_command_finished(&self, command_hash: &ObjectId) {
    self.run.finish_command(command_hash, &self.step);
  }

  /// Wait until no other step runs `command_hash`, then hold it until the
  /// guard drops.
  pub(crate) async fn acquire_command(&self, command_hash: ObjectId) -> CommandGuard<'_> {
    while let Some(other) = self.run.try_start_command(command_hash, &self.step) {
      self.log(
        LogLevel::Debug,
        format!(
          "Command {} is already running in {}, waiting for it",
          command_hash,
          other.title()
        ),
      );
      other.wait_processed().await;
    }
    CommandGuard {
      ctx: self,
      command_hash,
    }
  }

  /// Container steps whose outputs are visible from here, nearest first.
  pub fn output_object_groups(&self) -> &[Arc<BuildStep>] {
    self.groups.get_or_init(|| self.step.output_object_groups())
  }

  /// Resolve an output produced earlier in this build.
  pub fn find_output(&self, url: &ObjectUrl) -> Option<ObjectId> {
    self
      .output_object_groups()
      .iter()
      .filter_map(|step| step.output_group())
      .find_map(|group| group.get(url))
  }

  pub(crate) fn publish_output(&self, url: &ObjectUrl, id: ObjectId) {
    for step in self.output_object_groups() {
      let Some(group) = step.output_group() else {
        continue;
      };
      if let Some(previous) = group.insert(url.clone(), id) {
        self.log(
          LogLevel::Warning,
          format!(
            "Output {} registered with hash {} replaces {} in {}",
            url,
            id,
            previous,
            step.title()
          ),
        );
      }
    }
  }

  pub(crate) fn publish_tag(&self, url: &ObjectUrl, tag: &str) {
    for step in self.output_object_groups() {
      if let Some(group) = step.output_group() {
        group.add_tag(url, tag);
      }
    }
  }
}

/// Holds a command hash in the in-flight registry.
pub(crate) struct CommandGuard<'a> {
  ctx: &'a ExecuteContext,
  command_hash: ObjectId,
}

impl Drop for CommandGuard<'_> {
  fn drop(&mut self) {
    self.ctx.notify_command_finished(&self.command_hash);
  }
}

/// View of the execution context used by a running [`Command`].
pub struct CommandContext<'a> {
  ctx: &'a ExecuteContext,
  entry: Mutex<ResultEntry>,
}

impl<'a> CommandContext<'a> {
  pub(crate) fn new(ctx: &'a ExecuteContext) -> Self {
    Self {
      ctx,
      entry: Mutex::new(ResultEntry::default()),
    }
  }

  pub(crate) fn into_entry(self) -> ResultEntry {
    self.entry.into_inner().unwrap_or_else(|e| e.into_inner())
  }

  fn with_entry<R>(&self, f: impl FnOnce(&mut ResultEntry) -> R) -> R {
    let mut entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut entry)
  }

  pub fn execute_context(&self) -> &ExecuteContext {
    self.ctx
  }

  pub fn step(&self) -> &Arc<BuildStep> {
    self.ctx.step()
  }

  pub fn cancellation_token(&self) -> &CancellationToken {
    self.ctx.cancellation_token()
  }

  pub fn is_cancelled(&self) -> bool {
    self.ctx.is_cancelled()
  }

  /// Run a sub-command as a child step and wait for it. The sub-command is
  /// recorded in the result entry whatever its outcome.
  pub async fn schedule_and_execute_command(
    &self,
    command: Arc<dyn Command>,
  ) -> Result<ResultStatus, BuildError> {
    self.with_entry(|entry| entry.spawned_commands.push(command.record()));
    let child = Arc::new(BuildStep::command(command));
    self.ctx.schedule_build_step(&child)?;
    Ok(child.wait_completed().await)
  }

  /// Record a sub-command without running it, so it is replayed with this command.
  pub fn register_spawned_command_without_scheduling(&self, record: CommandRecord) {
    self.with_entry(|entry| entry.spawned_commands.push(record));
  }

  /// Declare an input discovered during execution and capture its current hash.
  pub fn register_input_dependency(&self, url: ObjectUrl) -> ObjectId {
    let id = self.ctx.compute_input_hash(&url);
    self.with_entry(|entry| entry.input_dependency_versions.insert(url, id));
    id
  }

  pub fn register_output(&self, url: ObjectUrl, id: ObjectId) {
    self.with_entry(|entry| entry.output_objects.insert(url, id));
  }

  /// Store `data` in the object store and register it as an output.
  pub fn write_output(&self, url: ObjectUrl, data: impl Into<Bytes>) -> Result<ObjectId, StorageError> {
    let id = self.ctx.store().put(data.into())?;
    self.register_output(url, id);
    Ok(id)
  }

  /// Read an input, registering it as a dependency.
  pub fn read_input(&self, url: &ObjectUrl) -> Result<Bytes, StepError> {
    let id = self.register_input_dependency(url.clone());
    if id.is_empty() {
      return Err(StepError::failed(format!("input {} is not available", url)));
    }

    match url.url_type {
      UrlType::File => Ok(Bytes::from(std::fs::read(&url.path)?)),
      UrlType::Internal | UrlType::Virtual => Ok(self.ctx.store().get(&id)?),
    }
  }

  pub fn add_tag(&self, url: ObjectUrl, tag: impl Into<String>) {
    self.with_entry(|entry| entry.tag_symbols.push((url, tag.into())));
  }

  /// Log to the step and capture the message for replay on cache hits.
  pub fn log(&self, level: LogLevel, text: impl Into<String>) {
    let message = LogMessage::new(level, text);
    self.ctx.log(level, message.text.clone());
    self.with_entry(|entry| entry.log_messages.push(message));
  }

  /// Capture messages produced elsewhere (for example by a child process).
  pub fn register_command_log(&self, messages: impl IntoIterator<Item = LogMessage>) {
    self.with_entry(|entry| entry.log_messages.extend(messages));
  }
}
