use bytes::Bytes;

use crate::{ObjectId, StorageError};

/// Content store trait.
///
/// Implementations must be safe to call from several worker threads at once.
/// Blobs are normally keyed by their own hash ([`ObjectStore::put`]); callers
/// that need a derived key (such as cached build results keyed by command
/// hash) use [`ObjectStore::write`] directly.
pub trait ObjectStore: Send + Sync {
  /// Retrieve a blob.
  fn get(&self, id: &ObjectId) -> Result<Bytes, StorageError>;

  /// Store a blob under an explicit key, replacing any previous value.
  fn write(&self, id: &ObjectId, data: Bytes) -> Result<(), StorageError>;

  /// Delete a blob. Returns `false` if it did not exist.
  fn delete(&self, id: &ObjectId) -> Result<bool, StorageError>;

  fn exists(&self, id: &ObjectId) -> Result<bool, StorageError>;

  /// List every key in the store.
  fn enumerate(&self) -> Result<Vec<ObjectId>, StorageError>;

  /// Store a blob under its content hash.
  fn put(&self, data: Bytes) -> Result<ObjectId, StorageError> {
    let id = ObjectId::of(&data);
    if !self.exists(&id)? {
      self.write(&id, data)?;
    }
    Ok(id)
  }

  /// Delete every blob. Returns the number removed.
  fn clear(&self) -> Result<usize, StorageError> {
    let mut removed = 0;
    for id in self.enumerate()? {
      if self.delete(&id)? {
        removed += 1;
      }
    }
    Ok(removed)
  }
}
