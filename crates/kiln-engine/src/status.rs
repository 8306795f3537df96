//! Result statuses, run modes and the per-run step counter.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Result status of a build step.
///
/// A step starts as `NotProcessed` and moves exactly once to one of the
/// terminal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
  /// Not finished yet. Never a terminal status.
  #[default]
  NotProcessed,
  /// The step ran and succeeded.
  Successful,
  /// The step ran and failed.
  Failed,
  /// The step was stopped by cancellation.
  Cancelled,
  /// Skipped because a cached result was reused.
  NotTriggeredWasSuccessful,
  /// Skipped because a prerequisite did not succeed.
  NotTriggeredPrerequisiteFailed,
}

impl ResultStatus {
  /// Every status, in declaration order.
  pub const ALL: [ResultStatus; 6] = [
    ResultStatus::NotProcessed,
    ResultStatus::Successful,
    ResultStatus::Failed,
    ResultStatus::Cancelled,
    ResultStatus::NotTriggeredWasSuccessful,
    ResultStatus::NotTriggeredPrerequisiteFailed,
  ];

  /// Whether dependents may run: the step succeeded or was up to date.
  pub fn succeeded(self) -> bool {
    matches!(
      self,
      ResultStatus::Successful | ResultStatus::NotTriggeredWasSuccessful
    )
  }

  /// Whether the step failed itself or because of a prerequisite.
  pub fn failed(self) -> bool {
    matches!(
      self,
      ResultStatus::Failed | ResultStatus::NotTriggeredPrerequisiteFailed
    )
  }

  /// Whether the status is terminal.
  pub fn is_processed(self) -> bool {
    self != ResultStatus::NotProcessed
  }

  fn index(self) -> usize {
    self as usize
  }
}

impl fmt::Display for ResultStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ResultStatus::NotProcessed => "not processed",
      ResultStatus::Successful => "successful",
      ResultStatus::Failed => "failed",
      ResultStatus::Cancelled => "cancelled",
      ResultStatus::NotTriggeredWasSuccessful => "up-to-date",
      ResultStatus::NotTriggeredPrerequisiteFailed => "not triggered (prerequisite failed)",
    };
    f.write_str(name)
  }
}

/// Overall verdict of a build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResultCode {
  /// Every step succeeded or was up to date.
  Successful,
  /// At least one step failed or was not triggered because of a failure.
  BuildError,
  /// The run was cancelled before it completed.
  Cancelled,
}

/// What a run does with the commands of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
  /// Execute commands, reusing cached results where inputs are unchanged.
  #[default]
  Build,
  /// Drop cached results.
  Clean,
  /// Drop cached results and delete the outputs they reference.
  CleanAndDelete,
}

impl BuildMode {
  /// Whether this run removes cached results instead of building.
  pub fn is_clean(self) -> bool {
    self != BuildMode::Build
  }
}

/// Snapshot of a [`StepCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepCounts {
  counts: [usize; 6],
  total: usize,
}

impl StepCounts {
  /// Number of steps that finished with `status`.
  pub fn get(&self, status: ResultStatus) -> usize {
    self.counts[status.index()]
  }

  /// Number of steps counted, whatever their status.
  pub fn total(&self) -> usize {
    self.total
  }

  /// Steps that failed or were not triggered because of a failure.
  pub fn failures(&self) -> usize {
    self.get(ResultStatus::Failed) + self.get(ResultStatus::NotTriggeredPrerequisiteFailed)
  }
}

/// Run-scoped tally of terminal statuses, shared by all worker threads.
#[derive(Debug, Default)]
pub struct StepCounter {
  inner: Mutex<StepCounts>,
}

impl StepCounter {
  /// A counter with every count at zero.
  pub fn new() -> Self {
    Self::default()
  }

  /// Count one step that reached `status`.
  pub fn add_step_result(&self, status: ResultStatus) {
    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    inner.counts[status.index()] += 1;
    inner.total += 1;
  }

  /// Number of steps counted so far with `status`.
  pub fn get(&self, status: ResultStatus) -> usize {
    self.snapshot().get(status)
  }

  /// Number of steps counted so far.
  pub fn total(&self) -> usize {
    self.snapshot().total
  }

  /// Copy of the counts so far.
  pub fn snapshot(&self) -> StepCounts {
    *self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Reset every count, at the start of a run.
  pub fn clear(&self) {
    *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = StepCounts::default();
  }
}
