use kiln_storage::StorageError;
use thiserror::Error;

/// Errors raised by the builder and scheduler.
///
/// Contract violations (see [`BuildError::is_fatal`]) abort the run. Everything
/// else is recovered at step granularity.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error("build step {step} completed without a result status")]
  StepNotProcessed { step: String },

  #[error("build step {step} already has a parent")]
  ParentConflict { step: String },

  #[error("result status of build step {step} was already set")]
  StatusAlreadySet { step: String },

  #[error("build step {step} is not a list step")]
  NotAList { step: String },

  #[error("wait step {step} is not supported as direct child of a dynamic build step")]
  InvalidDynamicChild { step: String },

  #[error("a build is already running")]
  AlreadyRunning,

  #[error("the build root has already been executed, reset the builder before running again")]
  RootAlreadyExecuted,

  #[error("worker thread panicked: {message}")]
  WorkerPanicked { message: String },

  #[error("storage error: {0}")]
  Storage(#[from] StorageError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl BuildError {
  /// Whether this error is a programming error that must abort the run.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      BuildError::StepNotProcessed { .. }
        | BuildError::ParentConflict { .. }
        | BuildError::StatusAlreadySet { .. }
        | BuildError::WorkerPanicked { .. }
    )
  }
}

/// Errors returned by step and command work.
#[derive(Debug, Error)]
pub enum StepError {
  /// The work observed cancellation and stopped.
  #[error("cancelled")]
  Cancelled,

  /// A lower-level operation was aborted without the work handling cancellation itself.
  #[error("operation aborted: {0}")]
  Aborted(String),

  #[error("{0}")]
  Failed(String),

  #[error("unknown command kind: {kind}")]
  UnknownCommand { kind: String },

  #[error("invalid command parameters: {0}")]
  Parameters(#[from] serde_json::Error),

  #[error("storage error: {0}")]
  Storage(#[from] StorageError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Build(#[from] BuildError),
}

impl StepError {
  pub fn failed(message: impl Into<String>) -> Self {
    StepError::Failed(message.into())
  }
}
