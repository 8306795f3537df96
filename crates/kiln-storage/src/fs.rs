use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::{ObjectId, ObjectStore, StorageError};

/// Filesystem-based object store.
///
/// Objects are stored as loose files fanned out by the first hash byte:
/// ```text
/// {root}/
/// ├── 2c/
/// │   └── f24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824
/// └── 9f/
///     └── 86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08
/// ```
///
/// Writes go through a uniquely named temp file followed by a rename, so a
/// reader never observes a partially written object.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
  root: PathBuf,
}

impl FsObjectStore {
  /// Open a store rooted at the given directory, creating it if needed.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
    let root = root.into();
    fs::create_dir_all(&root)?;
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn object_path(&self, id: &ObjectId) -> PathBuf {
    let hex = id.to_hex();
    self.root.join(&hex[..2]).join(&hex[2..])
  }
}

impl ObjectStore for FsObjectStore {
  fn get(&self, id: &ObjectId) -> Result<Bytes, StorageError> {
    match fs::read(self.object_path(id)) {
      Ok(data) => Ok(Bytes::from(data)),
      Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound { id: *id }),
      Err(e) => Err(e.into()),
    }
  }

  fn write(&self, id: &ObjectId, data: Bytes) -> Result<(), StorageError> {
    let path = self.object_path(id);
    let Some(dir) = path.parent() else {
      return Err(StorageError::InvalidObjectId { value: id.to_hex() });
    };
    fs::create_dir_all(dir)?;

    let temp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    fs::write(&temp, &data)?;
    if let Err(e) = fs::rename(&temp, &path) {
      let _ = fs::remove_file(&temp);
      return Err(e.into());
    }
    Ok(())
  }

  fn delete(&self, id: &ObjectId) -> Result<bool, StorageError> {
    match fs::remove_file(self.object_path(id)) {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
      Err(e) => Err(e.into()),
    }
  }

  fn exists(&self, id: &ObjectId) -> Result<bool, StorageError> {
    Ok(self.object_path(id).is_file())
  }

  fn enumerate(&self) -> Result<Vec<ObjectId>, StorageError> {
    let mut ids = Vec::new();

    for fan in fs::read_dir(&self.root)? {
      let fan = fan?;
      if !fan.file_type()?.is_dir() {
        continue;
      }
      let Some(prefix) = fan.file_name().to_str().map(str::to_string) else {
        continue;
      };

      for entry in fs::read_dir(fan.path())? {
        let entry = entry?;
        let Some(rest) = entry.file_name().to_str().map(str::to_string) else {
          continue;
        };
        // Temp files and foreign files simply fail to parse.
        if let Ok(id) = format!("{}{}", prefix, rest).parse::<ObjectId>() {
          ids.push(id);
        }
      }
    }

    Ok(ids)
  }
}
