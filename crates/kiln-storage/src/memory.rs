use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;

use crate::{ObjectId, ObjectStore, StorageError};

/// In-memory object store.
///
/// Useful for tests and for builds that do not need to persist results.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
  objects: RwLock<HashMap<ObjectId, Bytes>>,
}

impl MemoryObjectStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.objects.read().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl ObjectStore for MemoryObjectStore {
  fn get(&self, id: &ObjectId) -> Result<Bytes, StorageError> {
    let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
    objects
      .get(id)
      .cloned()
      .ok_or(StorageError::NotFound { id: *id })
  }

  fn write(&self, id: &ObjectId, data: Bytes) -> Result<(), StorageError> {
    let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
    objects.insert(*id, data);
    Ok(())
  }

  fn delete(&self, id: &ObjectId) -> Result<bool, StorageError> {
    let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
    Ok(objects.remove(id).is_some())
  }

  fn exists(&self, id: &ObjectId) -> Result<bool, StorageError> {
    let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
    Ok(objects.contains_key(id))
  }

  fn enumerate(&self) -> Result<Vec<ObjectId>, StorageError> {
    let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
    Ok(objects.keys().copied().collect())
  }
}
