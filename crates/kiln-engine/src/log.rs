//! Messages logged by build steps and commands.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Severity of a step log message, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
  /// Detail only useful when diagnosing the engine.
  Debug,
  /// Normal progress.
  Info,
  /// Something that may make the cache ineffective or the output wrong.
  Warning,
  /// The step failed.
  Error,
}

/// A captured log line.
///
/// Messages a command logs are stored in its cached result and written to
/// the step log again when the result is replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
  /// Component that produced the message, if not the command itself.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub module: Option<String>,
  pub level: LogLevel,
  /// Message text, as shown to the user.
  pub text: String,
}

impl LogMessage {
  /// A message without a module.
  pub fn new(level: LogLevel, text: impl Into<String>) -> Self {
    Self {
      module: None,
      level,
      text: text.into(),
    }
  }
}

/// Per-step log sink.
///
/// Written from any worker thread.
#[derive(Debug, Default)]
pub struct StepLog {
  messages: Mutex<Vec<LogMessage>>,
}

impl StepLog {
  /// Append a message.
  pub fn push(&self, message: LogMessage) {
    self
      .messages
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(message);
  }

  /// Copy of the messages logged so far, oldest first.
  pub fn messages(&self) -> Vec<LogMessage> {
    self
      .messages
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Whether any message is at [`LogLevel::Error`].
  pub fn has_errors(&self) -> bool {
    self
      .messages
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .any(|m| m.level == LogLevel::Error)
  }

  /// Whether any message at `level` contains `needle`.
  pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
    self
      .messages
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .any(|m| m.level == level && m.text.contains(needle))
  }
}
