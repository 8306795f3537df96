#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use kiln_engine::{
  BuildStep, Builder, BuilderConfig, Command, CommandContext, ExecuteContext, LogLevel, LogMessage,
  ObjectUrl, ResultStatus, StepError, StepWork,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Writes `content`, followed by the content of its inputs, to an internal output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteCommand {
  pub name: String,
  pub output: String,
  #[serde(default)]
  pub content: String,
  /// Static file input.
  #[serde(default)]
  pub input_file: Option<String>,
  /// Internal outputs read during execution.
  #[serde(default)]
  pub reads: Vec<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub version: u32,
  /// Not part of the parameters, so a failing and a succeeding instance share a hash.
  #[serde(default)]
  pub fail: bool,
  #[serde(skip)]
  pub runs: Arc<AtomicUsize>,
}

impl WriteCommand {
  pub fn new(name: &str, output: &str, content: &str) -> Self {
    Self {
      name: name.to_string(),
      output: output.to_string(),
      content: content.to_string(),
      ..Self::default()
    }
  }

  pub fn with_input_file(mut self, path: &Path) -> Self {
    self.input_file = Some(path.to_string_lossy().into_owned());
    self
  }

  pub fn reading(mut self, output: &str) -> Self {
    self.reads.push(output.to_string());
    self
  }

  pub fn tagged(mut self, tag: &str) -> Self {
    self.tags.push(tag.to_string());
    self
  }

  pub fn failing(mut self) -> Self {
    self.fail = true;
    self
  }

  pub fn runs(&self) -> usize {
    self.runs.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Command for WriteCommand {
  fn kind(&self) -> &str {
    "write"
  }

  fn title(&self) -> String {
    format!("write {}", self.name)
  }

  fn version(&self) -> u32 {
    self.version
  }

  fn parameters(&self) -> serde_json::Value {
    json!({
      "name": self.name,
      "output": self.output,
      "content": self.content,
      "input_file": self.input_file,
      "reads": self.reads,
      "tags": self.tags,
      "version": self.version,
    })
  }

  fn input_urls(&self) -> Vec<ObjectUrl> {
    self.input_file.iter().map(ObjectUrl::file).collect()
  }

  async fn execute(&self, ctx: &CommandContext<'_>) -> Result<(), StepError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    if self.fail {
      return Err(StepError::failed(format!("{} was told to fail", self.name)));
    }

    let mut data = self.content.clone().into_bytes();
    for url in self.input_urls() {
      data.extend_from_slice(&ctx.read_input(&url)?);
    }
    for read in &self.reads {
      data.extend_from_slice(&ctx.read_input(&ObjectUrl::internal(read.as_str()))?);
    }

    let output = ObjectUrl::internal(self.output.as_str());
    ctx.write_output(output.clone(), data)?;
    for tag in &self.tags {
      ctx.add_tag(output.clone(), tag.as_str());
    }
    ctx.log(LogLevel::Info, format!("{} written", self.output));
    Ok(())
  }
}

/// Runs its children as sub-commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnCommand {
  pub name: String,
  pub children: Vec<WriteCommand>,
  #[serde(skip)]
  pub runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Command for SpawnCommand {
  fn kind(&self) -> &str {
    "spawn"
  }

  fn parameters(&self) -> serde_json::Value {
    let children: Vec<_> = self.children.iter().map(|c| c.parameters()).collect();
    json!({ "name": self.name, "children": children })
  }

  async fn execute(&self, ctx: &CommandContext<'_>) -> Result<(), StepError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    for child in &self.children {
      let status = ctx
        .schedule_and_execute_command(Arc::new(child.clone()))
        .await?;
      if !status.succeeded() {
        return Err(StepError::failed(format!("{} did not succeed", child.name)));
      }
    }
    Ok(())
  }
}

/// Hands its child over for later and forwards the log of an external tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeferCommand {
  pub name: String,
  pub child: WriteCommand,
  pub tool_log: Vec<String>,
  #[serde(skip)]
  pub runs: Arc<AtomicUsize>,
}

impl DeferCommand {
  pub fn runs(&self) -> usize {
    self.runs.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Command for DeferCommand {
  fn kind(&self) -> &str {
    "defer"
  }

  fn parameters(&self) -> serde_json::Value {
    json!({
      "name": self.name,
      "child": self.child.parameters(),
      "tool_log": self.tool_log,
    })
  }

  async fn execute(&self, ctx: &CommandContext<'_>) -> Result<(), StepError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    ctx.register_spawned_command_without_scheduling(self.child.record());
    ctx.register_command_log(
      self
        .tool_log
        .iter()
        .map(|line| LogMessage::new(LogLevel::Warning, line.as_str())),
    );
    Ok(())
  }
}

/// Appends its name to a shared journal.
pub struct Record {
  pub name: String,
  pub journal: Journal,
}

#[async_trait]
impl StepWork for Record {
  async fn execute(&self, _ctx: &ExecuteContext) -> Result<ResultStatus, StepError> {
    yield_now().await;
    self.journal.push(&self.name);
    Ok(ResultStatus::Successful)
  }
}

/// Host work driven by a closure over the execution context.
pub struct Work<F>(pub F);

#[async_trait]
impl<F> StepWork for Work<F>
where
  F: Fn(&ExecuteContext) -> Result<ResultStatus, StepError> + Send + Sync,
{
  async fn execute(&self, ctx: &ExecuteContext) -> Result<ResultStatus, StepError> {
    (self.0)(ctx)
  }
}

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
  pub fn push(&self, entry: &str) {
    self.0.lock().unwrap().push(entry.to_string());
  }

  pub fn entries(&self) -> Vec<String> {
    self.0.lock().unwrap().clone()
  }

  pub fn position(&self, entry: &str) -> usize {
    self
      .entries()
      .iter()
      .position(|e| e == entry)
      .unwrap_or_else(|| panic!("{} not in journal", entry))
  }
}

/// Suspends once, rescheduling the task immediately.
pub fn yield_now() -> impl Future<Output = ()> {
  struct YieldNow(bool);

  impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
      if self.0 {
        return Poll::Ready(());
      }
      self.0 = true;
      cx.waker().wake_by_ref();
      Poll::Pending
    }
  }

  YieldNow(false)
}

pub fn builder(dir: &Path, threads: usize) -> Builder {
  let builder = Builder::new(BuilderConfig::new(dir).with_thread_count(threads)).unwrap();
  builder.register_command::<WriteCommand>("write");
  builder.register_command::<SpawnCommand>("spawn");
  builder.register_command::<DeferCommand>("defer");
  builder
}

pub fn command(command: &WriteCommand) -> Arc<BuildStep> {
  Arc::new(BuildStep::command(Arc::new(command.clone())))
}

pub fn record(name: &str, journal: &Journal) -> BuildStep {
  BuildStep::custom(
    name,
    Record {
      name: name.to_string(),
      journal: journal.clone(),
    },
  )
}

/// Content of an internal output published into the root of the last run.
pub fn read_output(builder: &Builder, path: &str) -> Option<String> {
  let id = builder
    .root()
    .output_group()?
    .get(&ObjectUrl::internal(path))?;
  let data = builder.store().get(&id).ok()?;
  Some(String::from_utf8_lossy(&data).into_owned())
}
