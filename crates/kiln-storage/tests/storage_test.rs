use std::sync::Arc;

use bytes::Bytes;
use kiln_storage::{
  FileVersionTracker, FsObjectStore, ObjectId, ObjectIndex, ObjectStore, VersionTracker,
  VirtualFileSystem,
};
use tempfile::TempDir;

#[test]
fn test_index_of_stored_objects_mounts_into_vfs() {
  let dir = TempDir::new().unwrap();
  let store = FsObjectStore::open(dir.path().join("objects")).unwrap();

  let mut index = ObjectIndex::new();
  for (path, data) in [("/textures/a", "alpha"), ("/textures/b", "beta"), ("/c", "gamma")] {
    let id = store.put(Bytes::from(data)).unwrap();
    index.insert(path, id);
  }
  let index_path = dir.path().join("index").join("main");
  index.save(&index_path).unwrap();

  let vfs = VirtualFileSystem::new();
  vfs.mount("/game", Arc::new(ObjectIndex::load(&index_path).unwrap()));
  vfs.mount("/game/textures", Arc::new(ObjectIndex::new()));

  // The longer, empty mount shadows the index for its subtree.
  assert_eq!(vfs.object_id("/game/textures/a"), None);
  let id = vfs.object_id("/game/c").unwrap();
  assert_eq!(&store.get(&id).unwrap()[..], b"gamma");

  assert!(vfs.unmount("/game/textures"));
  let id = vfs.object_id("game/textures/a").unwrap();
  assert_eq!(id, ObjectId::of(b"alpha"));
}

#[test]
fn test_tracker_cache_survives_reopen() {
  let dir = TempDir::new().unwrap();
  let source = dir.path().join("input.txt");
  std::fs::write(&source, "contents").unwrap();
  let cache = dir.path().join("input_hashes.json");

  let tracker = FileVersionTracker::open(&cache);
  let id = tracker.hash_of(&source);
  assert_eq!(id, ObjectId::of(b"contents"));
  tracker.save().unwrap();
  assert!(cache.exists());

  let reopened = FileVersionTracker::open(&cache);
  assert_eq!(reopened.hash_of(&source), id);
  assert!(reopened.hash_of(&dir.path().join("missing")).is_empty());
}
