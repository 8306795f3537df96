//! Provider-fed work pool.
//!
//! A [`DynamicStep`] keeps pulling steps from a [`BuildStepProvider`] and
//! keeps at most `max_parallel_steps` of them in flight. Another
//! `max_high_priority_parallel_steps` slots only admit urgent work, meaning
//! steps the provider returns for a negative priority ceiling.
//!
//! The pool runs until cancelled, or until it is closed and every in-flight
//! subtree has completed.

use std::future::{Future, poll_fn};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;

use tokio::sync::Notify;

use crate::context::ExecuteContext;
use crate::error::{BuildError, StepError};
use crate::list::StatusAggregate;
use crate::status::ResultStatus;
use crate::step::BuildStep;

/// Source of steps for a [`DynamicStep`].
pub trait BuildStepProvider: Send + Sync {
  /// The next available step with a priority of at most `max_priority`.
  fn next_step(&self, max_priority: i32) -> Option<Arc<BuildStep>>;
}

impl<F> BuildStepProvider for F
where
  F: Fn(i32) -> Option<Arc<BuildStep>> + Send + Sync,
{
  fn next_step(&self, max_priority: i32) -> Option<Arc<BuildStep>> {
    self(max_priority)
  }
}

/// Priority ceiling used once the normal slots are full.
const HIGH_PRIORITY_CEILING: i32 = -1;

pub struct DynamicStep {
  provider: Box<dyn BuildStepProvider>,
  max_parallel_steps: usize,
  max_high_priority_parallel_steps: usize,
  new_work: Notify,
  closed: AtomicBool,
}

enum Wake {
  Completed(usize, ResultStatus),
  NewWork,
  Cancelled,
}

impl DynamicStep {
  pub fn new(provider: impl BuildStepProvider + 'static, max_parallel_steps: usize) -> Self {
    Self {
      provider: Box::new(provider),
      max_parallel_steps: max_parallel_steps.max(1),
      max_high_priority_parallel_steps: 0,
      new_work: Notify::new(),
      closed: AtomicBool::new(false),
    }
  }

  /// A pool fed by a closure.
  pub fn from_fn<F>(provider: F, max_parallel_steps: usize) -> Self
  where
    F: Fn(i32) -> Option<Arc<BuildStep>> + Send + Sync + 'static,
  {
    Self::new(provider, max_parallel_steps)
  }

  /// Reserve extra slots for urgent work.
  pub fn with_max_high_priority_parallel_steps(mut self, slots: usize) -> Self {
    self.max_high_priority_parallel_steps = slots;
    self
  }

  pub fn max_parallel_steps(&self) -> usize {
    self.max_parallel_steps
  }

  pub fn max_high_priority_parallel_steps(&self) -> usize {
    self.max_high_priority_parallel_steps
  }

  /// Wake the pool so it asks the provider again.
  pub fn notify_new_work_available(&self) {
    self.new_work.notify_one();
  }

  /// No more work will ever be provided. The pool finishes once the provider
  /// is drained and the in-flight steps complete.
  pub fn close(&self) {
    self.closed.store(true, Ordering::Release);
    self.new_work.notify_one();
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  pub(crate) async fn execute(
    &self,
    _step: &Arc<BuildStep>,
    ctx: &ExecuteContext,
  ) -> Result<ResultStatus, StepError> {
    let mut in_flight: Vec<Arc<BuildStep>> = Vec::new();
    let mut aggregate = StatusAggregate::default();

    loop {
      if ctx.is_cancelled() {
        return Ok(ResultStatus::Cancelled);
      }

      if in_flight.len() >= self.max_parallel_steps {
        let reserve_free =
          in_flight.len() < self.max_parallel_steps + self.max_high_priority_parallel_steps;
        match self.wait_for(&in_flight, reserve_free, ctx).await {
          Wake::Completed(index, status) => {
            in_flight.swap_remove(index);
            aggregate.add(status);
            continue;
          }
          // Only urgent work fits; ask the provider for it.
          Wake::NewWork => {}
          Wake::Cancelled => return Ok(ResultStatus::Cancelled),
        }
      }

      // Read before asking the provider so work provided before close() is not lost.
      let closed = self.is_closed();
      let max_priority = if in_flight.len() < self.max_parallel_steps {
        i32::MAX
      } else {
        HIGH_PRIORITY_CEILING
      };

      let Some(next) = self.provider.next_step(max_priority) else {
        if closed && in_flight.is_empty() {
          break;
        }
        match self.wait_for(&in_flight, !closed, ctx).await {
          Wake::Completed(index, status) => {
            in_flight.swap_remove(index);
            aggregate.add(status);
          }
          Wake::NewWork => {}
          Wake::Cancelled => return Ok(ResultStatus::Cancelled),
        }
        continue;
      };

      if next.is_processed() {
        continue;
      }
      if next.is_wait() {
        return Err(
          BuildError::InvalidDynamicChild {
            step: next.title().to_string(),
          }
          .into(),
        );
      }

      ctx.schedule_build_step(&next)?;
      in_flight.push(next);
    }

    Ok(aggregate.status(ctx.is_cancelled()))
  }

  /// Suspend until an in-flight subtree completes, new work is signalled (if
  /// `watch_new_work`), or the run is cancelled.
  async fn wait_for(
    &self,
    in_flight: &[Arc<BuildStep>],
    watch_new_work: bool,
    ctx: &ExecuteContext,
  ) -> Wake {
    let mut completions: Vec<_> = in_flight
      .iter()
      .cloned()
      .map(BuildStep::wait_completed)
      .collect();
    let mut new_work = watch_new_work.then(|| Box::pin(self.new_work.notified()));
    let mut cancelled = pin!(ctx.cancellation_token().cancelled());

    poll_fn(|cx| {
      for (index, completion) in completions.iter_mut().enumerate() {
        if let Poll::Ready(status) = completion.as_mut().poll(cx) {
          return Poll::Ready(Wake::Completed(index, status));
        }
      }
      if let Some(notified) = new_work.as_mut()
        && notified.as_mut().poll(cx).is_ready()
      {
        return Poll::Ready(Wake::NewWork);
      }
      if cancelled.as_mut().poll(cx).is_ready() {
        return Poll::Ready(Wake::Cancelled);
      }
      Poll::Pending
    })
    .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_closure_is_a_provider() {
    let provider = |max_priority: i32| {
      (max_priority < 0).then(|| Arc::new(BuildStep::wait()))
    };
    assert!(provider.next_step(i32::MAX).is_none());
    assert!(provider.next_step(HIGH_PRIORITY_CEILING).is_some());
  }

  #[test]
  fn test_dynamic_step_defaults() {
    let pool = DynamicStep::from_fn(|_| None, 0).with_max_high_priority_parallel_steps(2);
    assert_eq!(pool.max_parallel_steps(), 1);
    assert_eq!(pool.max_high_priority_parallel_steps(), 2);
    assert!(!pool.is_closed());
    pool.close();
    assert!(pool.is_closed());

    let step = BuildStep::dynamic("pool", pool);
    assert_eq!(step.priority(), Some(crate::step::HIGHEST_PRIORITY));
    assert!(step.output_group().is_some());
  }
}
