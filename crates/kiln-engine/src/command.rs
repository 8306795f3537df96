//! Commands and the cache-aware command step.
//!
//! Before a command runs, its command hash is computed from its kind, version,
//! parameters and the hashes of its static inputs. A cached [`ResultEntry`]
//! under that hash is reused only if every input recorded during the cached
//! execution still hashes the same. Otherwise the command runs and, on
//! success, its registered inputs, outputs, logs and spawned commands become
//! the new entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use kiln_storage::{ObjectId, ObjectIdBuilder, ObjectUrl};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::ResultEntry;
use crate::context::{CommandContext, ExecuteContext};
use crate::error::StepError;
use crate::log::LogLevel;
use crate::status::{BuildMode, ResultStatus};
use crate::step::BuildStep;

/// A user-defined, cacheable unit of work.
#[async_trait]
pub trait Command: Send + Sync + fmt::Debug {
  /// Registry key used to re-create this command from a [`CommandRecord`].
  fn kind(&self) -> &str;

  fn title(&self) -> String {
    self.kind().to_string()
  }

  /// Bump to invalidate every cached result of this command kind.
  fn version(&self) -> u32 {
    0
  }

  /// Parameters that fully describe this command. Part of the command hash.
  fn parameters(&self) -> serde_json::Value;

  /// Inputs known before execution. Their hashes are part of the command hash.
  fn input_urls(&self) -> Vec<ObjectUrl> {
    Vec::new()
  }

  async fn execute(&self, ctx: &CommandContext<'_>) -> Result<(), StepError>;

  fn record(&self) -> CommandRecord {
    CommandRecord {
      kind: self.kind().to_string(),
      parameters: self.parameters(),
    }
  }
}

/// Serialized form of a command, kept for spawned sub-commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
  pub kind: String,
  pub parameters: serde_json::Value,
}

type CommandFactory =
  Box<dyn Fn(serde_json::Value) -> Result<Arc<dyn Command>, StepError> + Send + Sync>;

/// Re-creates commands from their records.
#[derive(Default)]
pub struct CommandRegistry {
  factories: RwLock<HashMap<String, CommandFactory>>,
}

impl CommandRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a command type whose parameters deserialize into the command itself.
  pub fn register<C>(&self, kind: impl Into<String>)
  where
    C: Command + DeserializeOwned + 'static,
  {
    self.register_fn(kind, |parameters| {
      let command: C = serde_json::from_value(parameters)?;
      Ok(Arc::new(command) as Arc<dyn Command>)
    });
  }

  pub fn register_fn<F>(&self, kind: impl Into<String>, factory: F)
  where
    F: Fn(serde_json::Value) -> Result<Arc<dyn Command>, StepError> + Send + Sync + 'static,
  {
    let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
    factories.insert(kind.into(), Box::new(factory));
  }

  pub fn contains(&self, kind: &str) -> bool {
    let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
    factories.contains_key(kind)
  }

  pub fn create(&self, record: &CommandRecord) -> Result<Arc<dyn Command>, StepError> {
    let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
    let factory = factories
      .get(&record.kind)
      .ok_or_else(|| StepError::UnknownCommand {
        kind: record.kind.clone(),
      })?;
    factory(record.parameters.clone())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommandHash {
  pub(crate) id: ObjectId,
  /// False if any static input could not be hashed.
  pub(crate) resolved: bool,
}

pub(crate) fn compute_command_hash(command: &dyn Command, ctx: &ExecuteContext) -> CommandHash {
  let mut builder = ObjectIdBuilder::new();
  builder
    .write_str("kiln.command")
    .write_str(command.kind())
    .write_u32(command.version())
    // serde_json objects are sorted maps, so this rendering is canonical.
    .write_str(&command.parameters().to_string());

  let mut resolved = true;
  for url in command.input_urls() {
    let id = ctx.compute_input_hash(&url);
    resolved &= !id.is_empty();
    builder.write_str(&url.to_string()).write_id(&id);
  }

  CommandHash {
    id: builder.finish(),
    resolved,
  }
}

/// Leaf step wrapping a [`Command`].
pub struct CommandStep {
  command: Arc<dyn Command>,
  command_hash: Mutex<Option<ObjectId>>,
  result: Mutex<Option<ResultEntry>>,
}

impl CommandStep {
  pub(crate) fn new(command: Arc<dyn Command>) -> Self {
    Self {
      command,
      command_hash: Mutex::new(None),
      result: Mutex::new(None),
    }
  }

  pub fn command(&self) -> &Arc<dyn Command> {
    &self.command
  }

  /// Hash computed for the last execution.
  pub fn command_hash(&self) -> Option<ObjectId> {
    *self.command_hash.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Result of the last execution or cache replay.
  pub fn result(&self) -> Option<ResultEntry> {
    self
      .result
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  fn set_result(&self, hash: ObjectId, entry: ResultEntry) {
    *self.command_hash.lock().unwrap_or_else(|e| e.into_inner()) = Some(hash);
    *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(entry);
  }

  pub(crate) async fn execute(
    &self,
    step: &Arc<BuildStep>,
    ctx: &ExecuteContext,
  ) -> Result<ResultStatus, StepError> {
    if ctx.mode().is_clean() {
      return self.clean(ctx).await;
    }

    let hash = compute_command_hash(&*self.command, ctx);
    let _running = ctx.acquire_command(hash.id).await;

    if hash.resolved
      && let Some(entry) = ctx.cache().find(&hash.id)
      && dependencies_current(&entry, ctx)
      && let Some(status) = self.replay(step, ctx, hash.id, entry).await?
    {
      return Ok(status);
    }

    let command_ctx = CommandContext::new(ctx);
    let outcome = self.command.execute(&command_ctx).await;
    let entry = command_ctx.into_entry();
    outcome?;

    publish(ctx, &entry);
    if hash.resolved
      && let Err(e) = ctx.cache().store(&hash.id, &entry)
    {
      ctx.log(
        LogLevel::Warning,
        format!("Unable to store the result of {}: {}", step.title(), e),
      );
    }
    self.set_result(hash.id, entry);
    Ok(ResultStatus::Successful)
  }

  /// Reuse a cached entry. `None` means the entry cannot be replayed and the
  /// command must run.
  async fn replay(
    &self,
    step: &Arc<BuildStep>,
    ctx: &ExecuteContext,
    hash: ObjectId,
    entry: ResultEntry,
  ) -> Result<Option<ResultStatus>, StepError> {
    let mut spawned = Vec::with_capacity(entry.spawned_commands.len());
    for record in &entry.spawned_commands {
      match ctx.registry().create(record) {
        Ok(command) => spawned.push(command),
        Err(e) => {
          ctx.log(
            LogLevel::Warning,
            format!("Cached result of {} cannot be replayed: {}", step.title(), e),
          );
          return Ok(None);
        }
      }
    }

    for message in &entry.log_messages {
      step.write_log(message.level, message.text.clone());
    }
    publish(ctx, &entry);

    let children: Vec<Arc<BuildStep>> = spawned
      .into_iter()
      .map(|command| Arc::new(BuildStep::command(command)))
      .collect();
    for child in &children {
      ctx.schedule_build_step(child)?;
    }
    let statuses = join_all(children.iter().cloned().map(BuildStep::wait_completed)).await;
    self.set_result(hash, entry);

    if statuses.iter().all(|s| s.succeeded()) {
      Ok(Some(ResultStatus::NotTriggeredWasSuccessful))
    } else {
      ctx.log(
        LogLevel::Error,
        format!("A spawned command of {} did not succeed", step.title()),
      );
      Ok(Some(ResultStatus::Failed))
    }
  }

  /// Drop the cached result. Outputs are still published so dependents hash
  /// the same way they did when the entry was written.
  async fn clean(&self, ctx: &ExecuteContext) -> Result<ResultStatus, StepError> {
    let hash = compute_command_hash(&*self.command, ctx);
    let Some(entry) = ctx.cache().find(&hash.id) else {
      return Ok(ResultStatus::Successful);
    };

    publish(ctx, &entry);
    ctx.cache().remove(&hash.id)?;
    if ctx.mode() == BuildMode::CleanAndDelete {
      for id in entry.output_objects.values() {
        ctx.store().delete(id)?;
      }
    }

    let mut children = Vec::new();
    for record in &entry.spawned_commands {
      match ctx.registry().create(record) {
        Ok(command) => children.push(Arc::new(BuildStep::command(command))),
        Err(e) => ctx.log(
          LogLevel::Warning,
          format!("Spawned command cannot be cleaned: {}", e),
        ),
      }
    }
    for child in &children {
      ctx.schedule_build_step(child)?;
    }
    join_all(children.iter().cloned().map(BuildStep::wait_completed)).await;

    ctx.log(
      LogLevel::Debug,
      format!("Removed cached result {}", hash.id),
    );
    self.set_result(hash.id, entry);
    Ok(ResultStatus::Successful)
  }
}

/// Whether every input recorded in the entry still has the recorded hash.
fn dependencies_current(entry: &ResultEntry, ctx: &ExecuteContext) -> bool {
  entry
    .input_dependency_versions
    .iter()
    .all(|(url, recorded)| !recorded.is_empty() && ctx.compute_input_hash(url) == *recorded)
}

fn publish(ctx: &ExecuteContext, entry: &ResultEntry) {
  for (url, id) in &entry.output_objects {
    ctx.publish_output(url, *id);
  }
  for (url, tag) in &entry.tag_symbols {
    ctx.publish_tag(url, tag);
  }
}
