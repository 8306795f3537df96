use std::sync::{Arc, Mutex};

use futures::future::join_all;

use crate::context::ExecuteContext;
use crate::error::StepError;
use crate::status::ResultStatus;
use crate::step::BuildStep;

/// Container step that schedules its children in order.
///
/// Children run concurrently unless ordered by prerequisites or separated by
/// a wait step: everything scheduled before a wait step, including work it
/// spawned, completes before anything after it is scheduled.
#[derive(Default)]
pub struct ListStep {
  steps: Mutex<Vec<Arc<BuildStep>>>,
}

impl ListStep {
  pub(crate) fn push(&self, step: Arc<BuildStep>) {
    self
      .steps
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(step);
  }

  pub fn steps(&self) -> Vec<Arc<BuildStep>> {
    self.steps.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  pub fn len(&self) -> usize {
    self.steps.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub(crate) async fn execute(
    &self,
    _step: &Arc<BuildStep>,
    ctx: &ExecuteContext,
  ) -> Result<ResultStatus, StepError> {
    let mut scheduled: Vec<Arc<BuildStep>> = Vec::new();

    for child in self.steps() {
      if child.is_wait() {
        join_all(scheduled.iter().cloned().map(BuildStep::wait_completed)).await;
      }
      ctx.schedule_build_step(&child)?;
      scheduled.push(child);
    }

    let statuses = join_all(scheduled.iter().cloned().map(BuildStep::wait_completed)).await;
    Ok(aggregate_status(&statuses, ctx.is_cancelled()))
  }
}

/// Status of a container, folded from its children's statuses one at a time.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StatusAggregate {
  failed: bool,
  cancelled: bool,
}

impl StatusAggregate {
  pub(crate) fn add(&mut self, status: ResultStatus) {
    if status.failed() || !status.is_processed() {
      self.failed = true;
    } else if status == ResultStatus::Cancelled {
      self.cancelled = true;
    }
  }

  /// A cancelled run wins, then any failure, then any cancelled child.
  pub(crate) fn status(&self, cancel_requested: bool) -> ResultStatus {
    if cancel_requested {
      ResultStatus::Cancelled
    } else if self.failed {
      ResultStatus::Failed
    } else if self.cancelled {
      ResultStatus::Cancelled
    } else {
      ResultStatus::Successful
    }
  }
}

/// Status of a container from the statuses of its children.
pub(crate) fn aggregate_status(statuses: &[ResultStatus], cancel_requested: bool) -> ResultStatus {
  let mut aggregate = StatusAggregate::default();
  for status in statuses {
    aggregate.add(*status);
  }
  aggregate.status(cancel_requested)
}
