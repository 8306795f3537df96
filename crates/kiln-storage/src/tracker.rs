use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{ObjectId, StorageError};

/// Computes content hashes for on-disk input files.
pub trait VersionTracker: Send + Sync {
  /// Hash of the file's current content, or [`ObjectId::EMPTY`] if it cannot be read.
  fn hash_of(&self, path: &Path) -> ObjectId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct TrackedFile {
  len: u64,
  modified_ns: u64,
  id: ObjectId,
}

/// Version tracker that caches file hashes keyed by size and modification time.
///
/// The cache can be persisted between runs with [`FileVersionTracker::save`]
/// so unchanged inputs are not re-read.
#[derive(Debug, Default)]
pub struct FileVersionTracker {
  cache_path: Option<PathBuf>,
  files: RwLock<HashMap<String, TrackedFile>>,
  dirty: AtomicBool,
}

impl FileVersionTracker {
  /// A tracker with no persisted cache.
  pub fn new() -> Self {
    Self::default()
  }

  /// Open a tracker backed by a cache file. A missing or unreadable cache starts empty.
  pub fn open(cache_path: impl Into<PathBuf>) -> Self {
    let cache_path = cache_path.into();
    let files = match fs::read(&cache_path) {
      Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
        warn!(path = %cache_path.display(), error = %e, "input hash cache corrupt, starting empty");
        HashMap::new()
      }),
      Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
      Err(e) => {
        warn!(path = %cache_path.display(), error = %e, "input hash cache unreadable, starting empty");
        HashMap::new()
      }
    };

    Self {
      cache_path: Some(cache_path),
      files: RwLock::new(files),
      dirty: AtomicBool::new(false),
    }
  }

  pub fn cache_path(&self) -> Option<&Path> {
    self.cache_path.as_deref()
  }

  /// Persist the cache if anything changed since it was loaded.
  pub fn save(&self) -> Result<(), StorageError> {
    let Some(path) = &self.cache_path else {
      return Ok(());
    };
    if !self.dirty.swap(false, Ordering::AcqRel) {
      return Ok(());
    }

    let files = self.files.read().unwrap_or_else(|e| e.into_inner());
    if let Some(dir) = path.parent() {
      fs::create_dir_all(dir)?;
    }
    fs::write(path, serde_json::to_vec(&*files)?)?;
    debug!(path = %path.display(), entries = files.len(), "input hash cache saved");
    Ok(())
  }

  /// Forget all cached hashes and delete the cache file.
  pub fn clear(&self) -> Result<(), StorageError> {
    self
      .files
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .clear();
    self.dirty.store(false, Ordering::Release);
    if let Some(path) = &self.cache_path {
      match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
      }
    }
    Ok(())
  }

  fn stamp(path: &Path) -> Option<(u64, u64)> {
    let metadata = fs::metadata(path).ok()?;
    if !metadata.is_file() {
      return None;
    }
    let modified = metadata
      .modified()
      .ok()?
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_nanos() as u64)
      .unwrap_or(0);
    Some((metadata.len(), modified))
  }
}

impl VersionTracker for FileVersionTracker {
  fn hash_of(&self, path: &Path) -> ObjectId {
    let Some((len, modified_ns)) = Self::stamp(path) else {
      return ObjectId::EMPTY;
    };
    let key = path.to_string_lossy().into_owned();

    {
      let files = self.files.read().unwrap_or_else(|e| e.into_inner());
      if let Some(tracked) = files.get(&key)
        && tracked.len == len
        && tracked.modified_ns == modified_ns
      {
        return tracked.id;
      }
    }

    let id = match fs::read(path) {
      Ok(data) => ObjectId::of(&data),
      Err(_) => return ObjectId::EMPTY,
    };

    let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
    files.insert(
      key,
      TrackedFile {
        len,
        modified_ns,
        id,
      },
    );
    self.dirty.store(true, Ordering::Release);
    id
  }
}
