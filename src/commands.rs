//! Built-in command kinds available to build scripts.

use async_trait::async_trait;
use kiln_engine::{Builder, Command, CommandContext, LogLevel, ObjectUrl, StepError};
use serde::{Deserialize, Serialize};

/// Register every built-in command kind.
pub fn register_builtin_commands(builder: &Builder) {
  builder.register_command::<WriteCommand>(WriteCommand::KIND);
  builder.register_command::<CopyCommand>(CopyCommand::KIND);
  builder.register_command::<ConcatCommand>(ConcatCommand::KIND);
}

/// Store literal text as an output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteCommand {
  pub output: String,
  pub content: String,
}

impl WriteCommand {
  pub const KIND: &'static str = "write";
}

#[async_trait]
impl Command for WriteCommand {
  fn kind(&self) -> &str {
    Self::KIND
  }

  fn title(&self) -> String {
    format!("Write {}", self.output)
  }

  fn parameters(&self) -> serde_json::Value {
    serde_json::json!({ "output": self.output, "content": self.content })
  }

  async fn execute(&self, ctx: &CommandContext<'_>) -> Result<(), StepError> {
    ctx.write_output(ObjectUrl::internal(self.output.as_str()), self.content.clone())?;
    Ok(())
  }
}

/// Import a file from disk into the build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyCommand {
  pub source: String,
  pub output: String,
  #[serde(default)]
  pub tags: Vec<String>,
}

impl CopyCommand {
  pub const KIND: &'static str = "copy";
}

#[async_trait]
impl Command for CopyCommand {
  fn kind(&self) -> &str {
    Self::KIND
  }

  fn title(&self) -> String {
    format!("Copy {} to {}", self.source, self.output)
  }

  fn parameters(&self) -> serde_json::Value {
    serde_json::json!({ "source": self.source, "output": self.output, "tags": self.tags })
  }

  fn input_urls(&self) -> Vec<ObjectUrl> {
    vec![ObjectUrl::file(self.source.as_str())]
  }

  async fn execute(&self, ctx: &CommandContext<'_>) -> Result<(), StepError> {
    let data = ctx.read_input(&ObjectUrl::file(self.source.as_str()))?;
    let size = data.len();
    let output = ObjectUrl::internal(self.output.as_str());
    let id = ctx.write_output(output.clone(), data)?;
    for tag in &self.tags {
      ctx.add_tag(output.clone(), tag.as_str());
    }
    ctx.log(
      LogLevel::Debug,
      format!("Copied {} bytes from {} as {}", size, self.source, id),
    );
    Ok(())
  }
}

/// Join several build outputs, or mounted objects, into one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcatCommand {
  /// Internal output paths, or `vfs:` prefixed virtual paths.
  pub inputs: Vec<String>,
  pub output: String,
  #[serde(default)]
  pub separator: String,
}

impl ConcatCommand {
  pub const KIND: &'static str = "concat";
}

fn input_url(input: &str) -> ObjectUrl {
  match input.strip_prefix("vfs:") {
    Some(path) => ObjectUrl::virtual_path(path),
    None => ObjectUrl::internal(input),
  }
}

#[async_trait]
impl Command for ConcatCommand {
  fn kind(&self) -> &str {
    Self::KIND
  }

  fn title(&self) -> String {
    format!("Concat {}", self.output)
  }

  fn parameters(&self) -> serde_json::Value {
    serde_json::json!({
      "inputs": self.inputs,
      "output": self.output,
      "separator": self.separator,
    })
  }

  async fn execute(&self, ctx: &CommandContext<'_>) -> Result<(), StepError> {
    let mut data = Vec::new();
    for (i, input) in self.inputs.iter().enumerate() {
      if ctx.is_cancelled() {
        return Err(StepError::Cancelled);
      }
      if i > 0 {
        data.extend_from_slice(self.separator.as_bytes());
      }
      data.extend_from_slice(&ctx.read_input(&input_url(input))?);
    }
    ctx.write_output(ObjectUrl::internal(self.output.as_str()), data)?;
    Ok(())
  }
}
