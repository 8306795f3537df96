mod common;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{Journal, Work, builder, record, yield_now};
use kiln_engine::{
  BuildMode, BuildResultCode, BuildStep, BuildStepProvider, DynamicStep, ExecuteContext,
  ResultStatus, StepError, StepWork,
};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Hands out queued steps in order, honouring the priority ceiling.
#[derive(Clone, Default)]
struct Queue(Arc<Mutex<VecDeque<Arc<BuildStep>>>>);

impl Queue {
  fn push(&self, step: BuildStep) -> Arc<BuildStep> {
    let step = Arc::new(step);
    self.0.lock().unwrap().push_back(step.clone());
    step
  }
}

impl BuildStepProvider for Queue {
  fn next_step(&self, max_priority: i32) -> Option<Arc<BuildStep>> {
    let mut queue = self.0.lock().unwrap();
    let index = queue
      .iter()
      .position(|step| step.effective_priority() <= max_priority)?;
    queue.remove(index)
  }
}

/// Counts steps running at the same time.
#[derive(Clone, Default)]
struct Concurrency {
  active: Arc<AtomicUsize>,
  peak: Arc<AtomicUsize>,
}

impl Concurrency {
  fn enter(&self) {
    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
  }

  fn leave(&self) {
    self.active.fetch_sub(1, Ordering::SeqCst);
  }

  fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

/// Tracks how many instances run at the same time.
struct Tracked(Concurrency);

#[async_trait]
impl StepWork for Tracked {
  async fn execute(&self, _ctx: &ExecuteContext) -> Result<ResultStatus, StepError> {
    self.0.enter();
    for _ in 0..3 {
      yield_now().await;
    }
    self.0.leave();
    Ok(ResultStatus::Successful)
  }
}

fn pool_of(step: &ExecuteContext) -> Arc<BuildStep> {
  step.step().parent().unwrap()
}

#[test]
fn test_pool_bounds_parallelism() {
  let build = TempDir::new().unwrap();
  let builder = builder(build.path(), 4);
  let queue = Queue::default();
  let concurrency = Concurrency::default();

  let steps: Vec<_> = (0..6)
    .map(|i| {
      let tracked = Tracked(concurrency.clone());
      queue.push(BuildStep::custom(format!("tracked{}", i), tracked))
    })
    .collect();

  let pool = DynamicStep::new(queue, 2);
  pool.close();
  let pool = Arc::new(BuildStep::dynamic("pool", pool));
  builder.add_step(pool.clone()).unwrap();

  let report = builder.run(BuildMode::Build).unwrap();
  assert_eq!(report.result, BuildResultCode::Successful);
  assert_eq!(pool.status(), ResultStatus::Successful);
  assert!(steps.iter().all(|s| s.status() == ResultStatus::Successful));
  assert_eq!(report.counts.get(ResultStatus::Successful), 6);
  assert!(concurrency.peak() <= 2);
  assert_eq!(pool.spawned_steps().len(), 6);
}

#[test]
fn test_reserved_slot_admits_urgent_work_only() {
  let build = TempDir::new().unwrap();
  let builder = builder(build.path(), 2);
  let queue = Queue::default();
  let journal = Journal::default();
  let gate = Arc::new(Notify::new());

  let urgent = {
    let journal = journal.clone();
    let gate = gate.clone();
    BuildStep::custom(
      "urgent",
      Work(move |_: &ExecuteContext| -> Result<ResultStatus, StepError> {
        journal.push("urgent");
        gate.notify_one();
        Ok(ResultStatus::Successful)
      }),
    )
    .with_priority(-5)
  };

  struct Blocker {
    journal: Journal,
    gate: Arc<Notify>,
    queue: Queue,
    urgent: Mutex<Option<BuildStep>>,
  }

  #[async_trait]
  impl StepWork for Blocker {
    async fn execute(&self, ctx: &ExecuteContext) -> Result<ResultStatus, StepError> {
      self.journal.push("blocker-start");
      if let Some(urgent) = self.urgent.lock().unwrap().take() {
        self.queue.push(urgent);
      }
      pool_of(ctx)
        .as_dynamic()
        .unwrap()
        .notify_new_work_available();
      self.gate.notified().await;
      self.journal.push("blocker-end");
      Ok(ResultStatus::Successful)
    }
  }

  queue.push(
    BuildStep::custom(
      "blocker",
      Blocker {
        journal: journal.clone(),
        gate,
        queue: queue.clone(),
        urgent: Mutex::new(Some(urgent)),
      },
    )
    .with_priority(0),
  );
  let closing_journal = journal.clone();
  queue.push(
    BuildStep::custom(
      "normal",
      Work(move |ctx: &ExecuteContext| -> Result<ResultStatus, StepError> {
        closing_journal.push("normal");
        pool_of(ctx).as_dynamic().unwrap().close();
        Ok(ResultStatus::Successful)
      }),
    )
    .with_priority(0),
  );

  let pool = DynamicStep::new(queue, 1).with_max_high_priority_parallel_steps(1);
  builder
    .add_step(Arc::new(BuildStep::dynamic("pool", pool)))
    .unwrap();

  let report = builder.run(BuildMode::Build).unwrap();
  assert_eq!(report.result, BuildResultCode::Successful);
  assert_eq!(
    journal.entries(),
    vec!["blocker-start", "urgent", "blocker-end", "normal"]
  );
}

#[test]
fn test_saturated_pool_admits_urgent_work_into_reserved_slot() {
  let build = TempDir::new().unwrap();
  let builder = builder(build.path(), 4);
  let queue = Queue::default();
  let concurrency = Concurrency::default();
  // Unfinished pool children seen by each urgent step when it starts.
  let seen = Arc::new(Mutex::new(Vec::new()));
  let finished_urgent = Arc::new(AtomicUsize::new(0));

  struct Urgent {
    concurrency: Concurrency,
    gate: Arc<Notify>,
    seen: Arc<Mutex<Vec<usize>>>,
    finished: Arc<AtomicUsize>,
  }

  #[async_trait]
  impl StepWork for Urgent {
    async fn execute(&self, ctx: &ExecuteContext) -> Result<ResultStatus, StepError> {
      self.concurrency.enter();
      let pool = pool_of(ctx);
      let unfinished = pool
        .spawned_steps()
        .iter()
        .filter(|step| !step.is_processed())
        .count();
      self.seen.lock().unwrap().push(unfinished);
      yield_now().await;
      self.concurrency.leave();
      self.gate.notify_one();
      // Nothing is pushed after the second urgent step.
      if self.finished.fetch_add(1, Ordering::SeqCst) == 1 {
        pool.as_dynamic().unwrap().close();
      }
      Ok(ResultStatus::Successful)
    }
  }

  /// Holds a normal slot until the urgent step it provides has run.
  struct Blocker {
    concurrency: Concurrency,
    gate: Arc<Notify>,
    queue: Queue,
    urgent: Mutex<Option<BuildStep>>,
  }

  #[async_trait]
  impl StepWork for Blocker {
    async fn execute(&self, ctx: &ExecuteContext) -> Result<ResultStatus, StepError> {
      self.concurrency.enter();
      if let Some(urgent) = self.urgent.lock().unwrap().take() {
        self.queue.push(urgent);
      }
      pool_of(ctx)
        .as_dynamic()
        .unwrap()
        .notify_new_work_available();
      self.gate.notified().await;
      self.concurrency.leave();
      Ok(ResultStatus::Successful)
    }
  }

  for name in ["a", "b"] {
    let gate = Arc::new(Notify::new());
    let urgent = BuildStep::custom(
      format!("urgent-{}", name),
      Urgent {
        concurrency: concurrency.clone(),
        gate: gate.clone(),
        seen: seen.clone(),
        finished: finished_urgent.clone(),
      },
    )
    .with_priority(-5);
    queue.push(
      BuildStep::custom(
        format!("blocker-{}", name),
        Blocker {
          concurrency: concurrency.clone(),
          gate,
          queue: queue.clone(),
          urgent: Mutex::new(Some(urgent)),
        },
      )
      .with_priority(0),
    );
  }
  for i in 0..6 {
    let normal = BuildStep::custom(format!("normal{}", i), Tracked(concurrency.clone()));
    queue.push(normal.with_priority(0));
  }

  let pool = DynamicStep::new(queue.clone(), 2).with_max_high_priority_parallel_steps(1);
  let pool = Arc::new(BuildStep::dynamic("pool", pool));
  builder.add_step(pool.clone()).unwrap();

  let report = builder.run(BuildMode::Build).unwrap();
  assert_eq!(report.result, BuildResultCode::Successful);
  assert_eq!(pool.status(), ResultStatus::Successful);
  assert_eq!(report.counts.get(ResultStatus::Successful), 10);
  assert!(concurrency.peak() <= 3, "peak {}", concurrency.peak());

  // The first urgent step ran beside both blockers, which hold the normal slots.
  let seen = seen.lock().unwrap().clone();
  assert_eq!(seen.len(), 2);
  assert_eq!(seen[0], 3);
  assert!(queue.0.lock().unwrap().is_empty());
}

#[test]
fn test_long_lived_pool_reports_a_single_failure() {
  let build = TempDir::new().unwrap();
  let builder = builder(build.path(), 2);
  let queue = Queue::default();

  for i in 0..40 {
    let status = if i == 17 {
      ResultStatus::Failed
    } else {
      ResultStatus::Successful
    };
    queue.push(BuildStep::custom(
      format!("child{}", i),
      Work(move |_: &ExecuteContext| -> Result<ResultStatus, StepError> { Ok(status) }),
    ));
  }

  let pool = DynamicStep::new(queue, 3);
  pool.close();
  let pool = Arc::new(BuildStep::dynamic("pool", pool));
  builder.add_step(pool.clone()).unwrap();

  let report = builder.run(BuildMode::Build).unwrap();
  assert_eq!(report.result, BuildResultCode::BuildError);
  assert_eq!(pool.status(), ResultStatus::Failed);
  assert_eq!(report.counts.get(ResultStatus::Successful), 39);
  assert_eq!(report.counts.get(ResultStatus::Failed), 1);
}

#[test]
fn test_wait_step_from_provider_fails_the_pool() {
  let build = TempDir::new().unwrap();
  let builder = builder(build.path(), 2);
  let queue = Queue::default();
  queue.push(BuildStep::wait());

  let pool = DynamicStep::new(queue, 2);
  pool.close();
  let pool = Arc::new(BuildStep::dynamic("pool", pool));
  builder.add_step(pool.clone()).unwrap();

  let report = builder.run(BuildMode::Build).unwrap();
  assert_eq!(pool.status(), ResultStatus::Failed);
  assert_eq!(report.result, BuildResultCode::BuildError);
}

#[test]
fn test_idle_pool_stops_on_cancellation() {
  let build = TempDir::new().unwrap();
  let builder = builder(build.path(), 2);

  let pool = Arc::new(BuildStep::dynamic(
    "pool",
    DynamicStep::from_fn(|_| None, 2),
  ));
  builder.add_step(pool.clone()).unwrap();
  builder
    .add_step(Arc::new(BuildStep::custom(
      "cancel",
      Work(|ctx: &ExecuteContext| -> Result<ResultStatus, StepError> {
        ctx.cancellation_token().cancel();
        Ok(ResultStatus::Successful)
      }),
    )))
    .unwrap();

  let report = builder.run(BuildMode::Build).unwrap();
  assert_eq!(report.result, BuildResultCode::Cancelled);
  assert_eq!(pool.status(), ResultStatus::Cancelled);
}

#[test]
fn test_pool_closed_by_a_later_step() {
  let build = TempDir::new().unwrap();
  let builder = builder(build.path(), 2);
  let queue = Queue::default();
  let journal = Journal::default();
  queue.push(record("first", &journal));
  queue.push(record("second", &journal));

  let pool = Arc::new(BuildStep::dynamic("pool", DynamicStep::new(queue.clone(), 1)));
  let target = pool.clone();
  let closer = Arc::new(BuildStep::custom(
    "closer",
    Work(move |_: &ExecuteContext| -> Result<ResultStatus, StepError> {
      target.as_dynamic().unwrap().close();
      Ok(ResultStatus::Successful)
    }),
  ));
  builder.add_step(pool.clone()).unwrap();
  builder.add_step(closer).unwrap();

  let report = builder.run(BuildMode::Build).unwrap();
  assert_eq!(report.result, BuildResultCode::Successful);
  assert_eq!(pool.status(), ResultStatus::Successful);
  assert_eq!(journal.entries(), vec!["first", "second"]);
  assert!(queue.0.lock().unwrap().is_empty());
}
