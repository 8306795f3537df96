use std::sync::{Arc, RwLock};

use crate::ObjectId;

/// A provider mounted into the [`VirtualFileSystem`].
pub trait MountProvider: Send + Sync {
  /// Content hash of the object at a provider-local path.
  fn object_id(&self, path: &str) -> Option<ObjectId>;
}

struct Mount {
  prefix: String,
  provider: Arc<dyn MountProvider>,
}

/// Resolves virtual paths to a mounted provider plus a provider-local path.
///
/// Mount prefixes are matched on path segment boundaries and the longest
/// matching prefix wins.
#[derive(Default)]
pub struct VirtualFileSystem {
  mounts: RwLock<Vec<Mount>>,
}

impl VirtualFileSystem {
  pub fn new() -> Self {
    Self::default()
  }

  /// Mount a provider at `prefix`, replacing any provider already there.
  pub fn mount(&self, prefix: &str, provider: Arc<dyn MountProvider>) {
    let prefix = normalize(prefix);
    let mut mounts = self.mounts.write().unwrap_or_else(|e| e.into_inner());
    mounts.retain(|m| m.prefix != prefix);
    mounts.push(Mount { prefix, provider });
  }

  pub fn unmount(&self, prefix: &str) -> bool {
    let prefix = normalize(prefix);
    let mut mounts = self.mounts.write().unwrap_or_else(|e| e.into_inner());
    let before = mounts.len();
    mounts.retain(|m| m.prefix != prefix);
    mounts.len() != before
  }

  /// Find the provider responsible for `path`.
  pub fn resolve(&self, path: &str) -> Option<(Arc<dyn MountProvider>, String)> {
    let path = normalize(path);
    let mounts = self.mounts.read().unwrap_or_else(|e| e.into_inner());

    mounts
      .iter()
      .filter_map(|m| local_path(&m.prefix, &path).map(|local| (m, local)))
      .max_by_key(|(m, _)| m.prefix.len())
      .map(|(m, local)| (m.provider.clone(), local))
  }

  pub fn object_id(&self, path: &str) -> Option<ObjectId> {
    let (provider, local) = self.resolve(path)?;
    provider.object_id(&local)
  }
}

fn normalize(path: &str) -> String {
  let trimmed = path.trim_matches('/');
  format!("/{}", trimmed)
}

fn local_path(prefix: &str, path: &str) -> Option<String> {
  if prefix == "/" {
    return Some(path.to_string());
  }
  let rest = path.strip_prefix(prefix)?;
  if rest.is_empty() {
    Some("/".to_string())
  } else if rest.starts_with('/') {
    Some(rest.to_string())
  } else {
    None
  }
}
