//! Cooperative executor for build tasks.
//!
//! Every scheduled step becomes one heap-allocated, pinned future. Worker
//! threads share a single ready queue ordered by priority and poll a task until
//! it suspends. A task's waker pushes it back onto the queue; woken
//! continuations are served ahead of freshly spawned tasks of the same
//! priority so in-flight work drains before new work starts.
//!
//! Workers return once no live task remains anywhere in the executor.

use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use futures::task::{ArcWake, waker_ref};
use tracing::error;

// Task states. A task is queued at most once: wakes that arrive while the
// task is being polled are recorded as NOTIFIED and re-queued afterwards.
const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const DONE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lane {
  Continuation,
  Fresh,
}

struct Task {
  future: Mutex<Option<BoxFuture<'static, ()>>>,
  priority: i32,
  state: AtomicU8,
  executor: Weak<Shared>,
}

impl ArcWake for Task {
  fn wake_by_ref(arc_self: &Arc<Self>) {
    let mut state = arc_self.state.load(Ordering::Acquire);
    loop {
      let next = match state {
        IDLE => SCHEDULED,
        RUNNING => NOTIFIED,
        _ => return,
      };
      match arc_self
        .state
        .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => {
          if next == SCHEDULED
            && let Some(shared) = arc_self.executor.upgrade()
          {
            shared.push(arc_self.clone(), Lane::Continuation);
          }
          return;
        }
        Err(actual) => state = actual,
      }
    }
  }
}

struct Ready {
  priority: i32,
  lane: Lane,
  sequence: u64,
  task: Arc<Task>,
}

impl Ready {
  fn key(&self) -> (i32, Lane, u64) {
    (self.priority, self.lane, self.sequence)
  }
}

impl PartialEq for Ready {
  fn eq(&self, other: &Self) -> bool {
    self.key() == other.key()
  }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

impl Ord for Ready {
  // BinaryHeap is a max-heap; the smallest key must come out first.
  fn cmp(&self, other: &Self) -> CmpOrdering {
    other.key().cmp(&self.key())
  }
}

#[derive(Default)]
struct Queue {
  ready: BinaryHeap<Ready>,
  live: usize,
  sequence: u64,
}

impl Queue {
  fn enqueue(&mut self, task: Arc<Task>, lane: Lane) {
    let sequence = self.sequence;
    self.sequence += 1;
    self.ready.push(Ready {
      priority: task.priority,
      lane,
      sequence,
      task,
    });
  }
}

#[derive(Default)]
struct Shared {
  queue: Mutex<Queue>,
  available: Condvar,
}

impl Shared {
  fn push(&self, task: Arc<Task>, lane: Lane) {
    self
      .queue
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .enqueue(task, lane);
    self.available.notify_one();
  }
}

/// Priority-ordered cooperative executor driven by caller-provided threads.
#[derive(Clone, Default)]
pub(crate) struct Executor {
  shared: Arc<Shared>,
}

impl Executor {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Queue a new task. Lower priority values are served first.
  pub(crate) fn spawn(&self, priority: i32, future: impl Future<Output = ()> + Send + 'static) {
    let task = Arc::new(Task {
      future: Mutex::new(Some(future.boxed())),
      priority,
      state: AtomicU8::new(SCHEDULED),
      executor: Arc::downgrade(&self.shared),
    });

    {
      let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
      queue.live += 1;
      queue.enqueue(task, Lane::Fresh);
    }
    self.shared.available.notify_one();
  }

  pub(crate) fn live_tasks(&self) -> usize {
    self
      .shared
      .queue
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .live
  }

  /// Run tasks on the calling thread until no live task remains.
  pub(crate) fn run_worker(&self) {
    while let Some(task) = self.next_task() {
      self.poll_task(task);
    }
  }

  fn next_task(&self) -> Option<Arc<Task>> {
    let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
    loop {
      if let Some(ready) = queue.ready.pop() {
        return Some(ready.task);
      }
      if queue.live == 0 {
        drop(queue);
        self.shared.available.notify_all();
        return None;
      }
      queue = self
        .shared
        .available
        .wait(queue)
        .unwrap_or_else(|e| e.into_inner());
    }
  }

  fn poll_task(&self, task: Arc<Task>) {
    if task
      .state
      .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return;
    }

    let finished = {
      let mut slot = task.future.lock().unwrap_or_else(|e| e.into_inner());
      let outcome = match slot.as_mut() {
        Some(future) => {
          let waker = waker_ref(&task);
          let mut cx = Context::from_waker(&waker);
          panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        }
        None => Ok(Poll::Ready(())),
      };

      match outcome {
        Ok(Poll::Pending) => false,
        Ok(Poll::Ready(())) => {
          *slot = None;
          true
        }
        Err(payload) => {
          error!(panic = %panic_message(payload.as_ref()), "build task panicked");
          *slot = None;
          true
        }
      }
    };

    if finished {
      task.state.store(DONE, Ordering::Release);
      let idle = {
        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.live -= 1;
        queue.live == 0
      };
      if idle {
        self.shared.available.notify_all();
      }
      return;
    }

    if task
      .state
      .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      // Woken while running.
      task.state.store(SCHEDULED, Ordering::Release);
      self.shared.push(task, Lane::Continuation);
    }
  }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::channel::oneshot;
  use std::thread;

  #[test]
  fn test_priority_order_on_single_worker() {
    let executor = Executor::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (name, priority) in [("low", 5), ("high", -5), ("mid", 0), ("mid2", 0)] {
      let order = order.clone();
      executor.spawn(priority, async move {
        order.lock().unwrap().push(name);
      });
    }
    executor.run_worker();

    assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "mid2", "low"]);
    assert_eq!(executor.live_tasks(), 0);
  }

  #[test]
  fn test_suspended_task_resumes_across_workers() {
    let executor = Executor::new();
    let (sender, receiver) = oneshot::channel::<u32>();
    let result = Arc::new(Mutex::new(None));

    let slot = result.clone();
    executor.spawn(0, async move {
      *slot.lock().unwrap() = receiver.await.ok();
    });
    executor.spawn(1, async move {
      let _ = sender.send(7);
    });

    let workers: Vec<_> = (0..3)
      .map(|_| {
        let executor = executor.clone();
        thread::spawn(move || executor.run_worker())
      })
      .collect();
    for worker in workers {
      worker.join().unwrap();
    }

    assert_eq!(*result.lock().unwrap(), Some(7));
  }

  #[test]
  fn test_panicking_task_does_not_stop_worker() {
    let executor = Executor::new();
    let ran = Arc::new(Mutex::new(false));

    executor.spawn(0, async {
      panic!("boom");
    });
    let flag = ran.clone();
    executor.spawn(1, async move {
      *flag.lock().unwrap() = true;
    });
    executor.run_worker();

    assert!(*ran.lock().unwrap());
    assert_eq!(executor.live_tasks(), 0);
  }
}
