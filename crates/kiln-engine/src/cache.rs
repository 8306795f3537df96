//! Result cache keyed by command hash.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use kiln_storage::{ObjectId, ObjectStore, ObjectUrl, StorageError};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::CommandRecord;
use crate::log::LogMessage;

/// Everything a successful command execution registered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
  /// Input hashes observed during execution, including inputs discovered at runtime.
  #[serde(default)]
  pub input_dependency_versions: BTreeMap<ObjectUrl, ObjectId>,
  /// Outputs the command registered, published again on replay.
  #[serde(default)]
  pub output_objects: BTreeMap<ObjectUrl, ObjectId>,
  /// Messages the command logged or forwarded.
  #[serde(default)]
  pub log_messages: Vec<LogMessage>,
  /// Tags added to outputs, applied again on replay.
  #[serde(default)]
  pub tag_symbols: Vec<(ObjectUrl, String)>,
  /// Sub-commands, scheduled again on replay.
  #[serde(default)]
  pub spawned_commands: Vec<CommandRecord>,
}

/// Stores [`ResultEntry`] blobs in the object store under their command hash.
///
/// Reads and writes are individually atomic at the store level. A lookup
/// followed by a store is not: two runs racing on the same hash both execute
/// and the last write wins.
#[derive(Clone)]
pub struct ResultCache {
  store: Arc<dyn ObjectStore>,
}

impl ResultCache {
  /// A cache over `store`. Entries live beside the objects they reference.
  pub fn new(store: Arc<dyn ObjectStore>) -> Self {
    Self { store }
  }

  /// Look up an entry. Missing and unreadable entries are both misses.
  pub fn find(&self, command_hash: &ObjectId) -> Option<ResultEntry> {
    let data = match self.store.get(command_hash) {
      Ok(data) => data,
      Err(StorageError::NotFound { .. }) => return None,
      Err(e) => {
        warn!(command_hash = %command_hash, error = %e, "cached result unreadable");
        return None;
      }
    };

    match serde_json::from_slice(&data) {
      Ok(entry) => Some(entry),
      Err(e) => {
        warn!(command_hash = %command_hash, error = %e, "cached result corrupt, ignoring");
        None
      }
    }
  }

  /// Store an entry, replacing any stale one.
  pub fn store(&self, command_hash: &ObjectId, entry: &ResultEntry) -> Result<(), StorageError> {
    let data = serde_json::to_vec(entry)?;
    self.store.write(command_hash, Bytes::from(data))
  }

  /// Forget the entry of `command_hash`. Returns whether one was stored.
  pub fn remove(&self, command_hash: &ObjectId) -> Result<bool, StorageError> {
    self.store.delete(command_hash)
  }
}
