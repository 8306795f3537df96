//! Build events and notifiers for observability.
//!
//! Events are emitted while a build runs so consumers can render progress,
//! persist run history or stream to a UI.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::status::{BuildMode, BuildResultCode, ResultStatus};

/// Events emitted during a build run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BuildEvent {
  RunStarted { builder_id: String, mode: BuildMode },

  /// A step received its execution id and was queued.
  StepScheduled {
    execution_id: u64,
    title: String,
    priority: i32,
  },

  /// A step's prerequisites are done and its work is about to run.
  StepStarted { execution_id: u64, title: String },

  StepCompleted {
    execution_id: u64,
    title: String,
    status: ResultStatus,
  },

  RunCompleted {
    builder_id: String,
    result: BuildResultCode,
    total: usize,
  },
}

/// Receives build events.
///
/// Called from worker threads; implementations must not block.
pub trait BuildNotifier: Send + Sync {
  fn notify(&self, event: BuildEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl BuildNotifier for NoopNotifier {
  fn notify(&self, _event: BuildEvent) {}
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls a worker thread.
  sender: mpsc::UnboundedSender<BuildEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<BuildEvent>) -> Self {
    Self { sender }
  }
}

impl BuildNotifier for ChannelNotifier {
  fn notify(&self, event: BuildEvent) {
    // Receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}
