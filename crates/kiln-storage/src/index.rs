use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{MountProvider, ObjectId, StorageError};

/// Persisted mapping of logical output path to content hash.
///
/// Written at the end of a build so consumers can locate outputs by name.
/// Also usable as a read-only [`MountProvider`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIndex {
  entries: BTreeMap<String, ObjectId>,
}

impl ObjectIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Load an index file. A missing file yields an empty index.
  pub fn load(path: &Path) -> Result<Self, StorageError> {
    match fs::read(path) {
      Ok(data) => Ok(serde_json::from_slice(&data)?),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::new()),
      Err(e) => Err(e.into()),
    }
  }

  pub fn save(&self, path: &Path) -> Result<(), StorageError> {
    if let Some(dir) = path.parent() {
      fs::create_dir_all(dir)?;
    }
    let temp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
    fs::write(&temp, serde_json::to_vec_pretty(self)?)?;
    fs::rename(&temp, path)?;
    Ok(())
  }

  pub fn get(&self, path: &str) -> Option<ObjectId> {
    self.entries.get(path).copied()
  }

  /// Insert an entry, returning the previous hash if any.
  pub fn insert(&mut self, path: impl Into<String>, id: ObjectId) -> Option<ObjectId> {
    self.entries.insert(path.into(), id)
  }

  /// Merge another index into this one. Entries from `other` win.
  pub fn merge(&mut self, other: ObjectIndex) {
    self.entries.extend(other.entries);
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &ObjectId)> {
    self.entries.iter().map(|(k, v)| (k.as_str(), v))
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl MountProvider for ObjectIndex {
  fn object_id(&self, path: &str) -> Option<ObjectId> {
    self.get(path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_missing_file_is_empty() {
    let dir = TempDir::new().unwrap();
    let index = ObjectIndex::load(&dir.path().join("nope")).unwrap();
    assert!(index.is_empty());
  }

  #[test]
  fn test_save_load_and_merge() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index").join("main");

    let mut prior = ObjectIndex::new();
    prior.insert("/a", ObjectId::of(b"a1"));
    prior.insert("/b", ObjectId::of(b"b1"));
    prior.save(&path).unwrap();

    let mut current = ObjectIndex::new();
    current.insert("/a", ObjectId::of(b"a2"));

    let mut merged = ObjectIndex::load(&path).unwrap();
    merged.merge(current);
    assert_eq!(merged.get("/a"), Some(ObjectId::of(b"a2")));
    assert_eq!(merged.get("/b"), Some(ObjectId::of(b"b1")));
    assert_eq!(merged.object_id("/b"), Some(ObjectId::of(b"b1")));
  }
}
