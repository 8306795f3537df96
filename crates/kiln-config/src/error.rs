use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
  #[error("duplicate step id: {0}")]
  DuplicateStepId(String),

  #[error("step {step} depends on unknown step {depends_on}")]
  UnknownDependency { step: String, depends_on: String },

  #[error("dependency cycle involving step {0}")]
  Cycle(String),

  #[error("wait steps cannot declare dependencies")]
  WaitWithDependencies,

  #[error("failed to parse build script: {0}")]
  Parse(#[from] serde_json::Error),
}
