//! Build orchestration.
//!
//! The [`Builder`] owns the root list step, the on-disk database and the
//! worker threads of a run.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use kiln_storage::{
  FileVersionTracker, FsObjectStore, ObjectId, ObjectIndex, ObjectStore, StorageError, UrlType,
  VirtualFileSystem,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::command::{Command, CommandRegistry};
use crate::error::BuildError;
use crate::events::{BuildEvent, BuildNotifier, NoopNotifier};
use crate::executor::panic_message;
use crate::scheduler::{RunServices, RunState};
use crate::status::{BuildMode, BuildResultCode, ResultStatus, StepCounter, StepCounts};
use crate::step::BuildStep;

/// Version of the on-disk cache layout. A database stamped with another
/// version is wiped when the builder opens it.
pub const CACHE_FORMAT_VERSION: u32 = 3;

/// Outputs tagged with this are reported by [`Builder::do_not_pack_ids`] and
/// left out of packages.
pub const DO_NOT_PACK_TAG: &str = "DoNotPack";

/// Outputs tagged with this are reported by [`Builder::disable_compression_ids`].
pub const DO_NOT_COMPRESS_TAG: &str = "DoNotCompress";

const DATABASE_DIR: &str = "db";
const OBJECTS_DIR: &str = "objects";
const INDEX_DIR: &str = "index";
const VERSION_FILE: &str = "version";
const INPUT_HASHES_FILE: &str = "input_hashes.json";

/// Configuration for a [`Builder`].
#[derive(Debug, Clone)]
pub struct BuilderConfig {
  /// Root of the build database.
  pub build_path: PathBuf,
  /// Name of the output index file under `db/index/`.
  pub index_name: String,
  /// Used in worker thread names.
  pub builder_name: Option<String>,
  pub thread_count: usize,
}

impl BuilderConfig {
  pub fn new(build_path: impl Into<PathBuf>) -> Self {
    Self {
      build_path: build_path.into(),
      index_name: "index".to_string(),
      builder_name: None,
      thread_count: thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1),
    }
  }

  pub fn with_thread_count(mut self, thread_count: usize) -> Self {
    self.thread_count = thread_count.max(1);
    self
  }

  pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
    self.index_name = index_name.into();
    self
  }

  pub fn with_builder_name(mut self, builder_name: impl Into<String>) -> Self {
    self.builder_name = Some(builder_name.into());
    self
  }

  pub fn database_path(&self) -> PathBuf {
    self.build_path.join(DATABASE_DIR)
  }

  pub fn index_path(&self) -> PathBuf {
    self.database_path().join(INDEX_DIR).join(&self.index_name)
  }

  pub fn input_hashes_path(&self) -> PathBuf {
    self.database_path().join(INPUT_HASHES_FILE)
  }
}

/// Outcome of [`Builder::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildReport {
  pub result: BuildResultCode,
  /// Terminal statuses of the leaf steps of the run.
  pub counts: StepCounts,
}

/// Runs a graph of build steps over a persistent result cache.
///
/// Generic over `N: BuildNotifier`. Use `Builder::new()` to discard events or
/// `Builder::with_notifier()` to observe them.
pub struct Builder<N: BuildNotifier = NoopNotifier> {
  id: Uuid,
  config: BuilderConfig,
  root: Arc<BuildStep>,
  store: Arc<FsObjectStore>,
  tracker: Arc<FileVersionTracker>,
  vfs: Arc<VirtualFileSystem>,
  registry: Arc<CommandRegistry>,
  counter: Arc<StepCounter>,
  notifier: Arc<N>,
  running: AtomicBool,
  token: Mutex<CancellationToken>,
  tagged_ids: Mutex<TaggedIds>,
}

/// Object ids carrying the well-known packaging tags, refreshed on index write.
#[derive(Default)]
struct TaggedIds {
  do_not_compress: BTreeSet<ObjectId>,
  do_not_pack: BTreeSet<ObjectId>,
}

impl Builder<NoopNotifier> {
  pub fn new(config: BuilderConfig) -> Result<Self, BuildError> {
    Self::with_notifier(config, NoopNotifier)
  }
}

impl<N: BuildNotifier + 'static> Builder<N> {
  pub fn with_notifier(config: BuilderConfig, notifier: N) -> Result<Self, BuildError> {
    let database = config.database_path();
    fs::create_dir_all(&database)?;
    let store = FsObjectStore::open(database.join(OBJECTS_DIR))?;
    check_cache_version(&database.join(VERSION_FILE), &store)?;
    let tracker = FileVersionTracker::open(config.input_hashes_path());

    let id = Uuid::new_v4();
    info!(
      builder_id = %id,
      build_path = %config.build_path.display(),
      threads = config.thread_count,
      "builder opened"
    );

    Ok(Self {
      id,
      config,
      root: Arc::new(BuildStep::list("Root")),
      store: Arc::new(store),
      tracker: Arc::new(tracker),
      vfs: Arc::new(VirtualFileSystem::new()),
      registry: Arc::new(CommandRegistry::new()),
      counter: Arc::new(StepCounter::new()),
      notifier: Arc::new(notifier),
      running: AtomicBool::new(false),
      token: Mutex::new(CancellationToken::new()),
      tagged_ids: Mutex::new(TaggedIds::default()),
    })
  }

  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn name(&self) -> &str {
    self.config.builder_name.as_deref().unwrap_or("Builder")
  }

  pub fn config(&self) -> &BuilderConfig {
    &self.config
  }

  pub fn root(&self) -> &Arc<BuildStep> {
    &self.root
  }

  /// Append a step to the root list.
  pub fn add_step(&self, step: Arc<BuildStep>) -> Result<(), BuildError> {
    self.root.add_step(step)
  }

  /// Discard the root list and start over with an empty one.
  pub fn reset(&mut self) {
    self.root = Arc::new(BuildStep::list("Root"));
    self.counter.clear();
  }

  /// Register a command type so cached sub-commands of this kind can be replayed.
  pub fn register_command<C>(&self, kind: impl Into<String>)
  where
    C: Command + DeserializeOwned + 'static,
  {
    self.registry.register::<C>(kind);
  }

  pub fn registry(&self) -> &CommandRegistry {
    &self.registry
  }

  pub fn store(&self) -> Arc<dyn ObjectStore> {
    self.store.clone()
  }

  pub fn vfs(&self) -> &VirtualFileSystem {
    &self.vfs
  }

  pub fn counts(&self) -> StepCounts {
    self.counter.snapshot()
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  /// Cancel the run in progress. Steps wind down and report `Cancelled`.
  pub fn cancel_build(&self) {
    if self.is_running() {
      info!(builder_id = %self.id, "cancelling build");
      self.cancellation_token().cancel();
    }
  }

  /// Token of the current (or last) run.
  pub fn cancellation_token(&self) -> CancellationToken {
    self
      .token
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Mount the persisted output index at `prefix` in the virtual file system.
  pub fn mount_index(&self, prefix: &str) -> Result<(), StorageError> {
    self.mount_index_file(prefix, &self.config.index_path())
  }

  /// Mount the index file at `path`, typically written by another build, at `prefix`.
  /// A missing file mounts an empty index.
  pub fn mount_index_file(&self, prefix: &str, path: &Path) -> Result<(), StorageError> {
    let index = ObjectIndex::load(path)?;
    info!(prefix, path = %path.display(), entries = index.len(), "index mounted");
    self.vfs.mount(prefix, Arc::new(index));
    Ok(())
  }

  /// Run the root step to completion on `thread_count` worker threads.
  ///
  /// Returns `Err` for contract violations detected during the run; step
  /// failures are reported through [`BuildReport::result`].
  #[instrument(skip(self), fields(builder_id = %self.id))]
  pub fn run(&self, mode: BuildMode) -> Result<BuildReport, BuildError> {
    if self.running.swap(true, Ordering::AcqRel) {
      return Err(BuildError::AlreadyRunning);
    }
    let _running = RunningFlag(&self.running);

    if self.root.is_scheduled() {
      return Err(BuildError::RootAlreadyExecuted);
    }

    let token = CancellationToken::new();
    *self.token.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
    self.counter.clear();
    *self.tagged_ids.lock().unwrap_or_else(|e| e.into_inner()) = TaggedIds::default();
    self.notifier.notify(BuildEvent::RunStarted {
      builder_id: self.id.to_string(),
      mode,
    });

    let run = RunState::new(
      RunServices {
        store: self.store.clone(),
        tracker: self.tracker.clone(),
        vfs: self.vfs.clone(),
        registry: self.registry.clone(),
        counter: self.counter.clone(),
        notifier: self.notifier.clone(),
      },
      mode,
      token.clone(),
    );
    run.schedule(None, &self.root)?;

    let workers = (1..=self.config.thread_count.max(1))
      .map(|n| {
        let executor = run.executor.clone();
        thread::Builder::new()
          .name(format!("{} worker thread {}", self.name(), n))
          .spawn(move || executor.run_worker())
      })
      .collect::<Result<Vec<_>, _>>()?;
    for worker in workers {
      if let Err(payload) = worker.join() {
        run.fail(BuildError::WorkerPanicked {
          message: panic_message(payload.as_ref()),
        });
      }
    }
    debug_assert_eq!(run.executor.live_tasks(), 0);

    if let Some(fatal) = run.take_fatal() {
      error!(error = %fatal, "build aborted");
      return Err(fatal);
    }

    let counts = self.counter.snapshot();
    let result = if token.is_cancelled() {
      BuildResultCode::Cancelled
    } else if counts.failures() > 0 || self.root.failed() {
      BuildResultCode::BuildError
    } else {
      BuildResultCode::Successful
    };

    match mode {
      BuildMode::Build => {
        if let Err(e) = self.tracker.save() {
          warn!(error = %e, "failed to save input hash cache");
        }
      }
      BuildMode::Clean | BuildMode::CleanAndDelete => {
        self.tracker.clear()?;
        if mode == BuildMode::CleanAndDelete {
          remove_file_if_exists(&self.config.index_path())?;
        }
      }
    }

    let total = counts.total();
    let succeeded = counts.get(ResultStatus::Successful);
    let up_to_date = counts.get(ResultStatus::NotTriggeredWasSuccessful);
    let failed = counts.get(ResultStatus::Failed);
    let not_triggered = counts.get(ResultStatus::NotTriggeredPrerequisiteFailed);
    match result {
      BuildResultCode::Successful => info!(
        ?mode,
        total, succeeded, up_to_date, failed, not_triggered, "build finished successfully"
      ),
      BuildResultCode::BuildError => error!(
        ?mode,
        total, succeeded, up_to_date, failed, not_triggered, "build failed"
      ),
      BuildResultCode::Cancelled => warn!(?mode, total, "build cancelled"),
    }

    self.notifier.notify(BuildEvent::RunCompleted {
      builder_id: self.id.to_string(),
      result,
      total,
    });
    Ok(BuildReport { result, counts })
  }

  /// Write the internal outputs of the last run to the index file.
  ///
  /// With `merge`, entries of the existing index that this run did not
  /// produce are kept. Also refreshes [`Builder::disable_compression_ids`]
  /// and [`Builder::do_not_pack_ids`].
  pub fn write_index_file(&self, merge: bool) -> Result<ObjectIndex, StorageError> {
    let path = self.config.index_path();
    let mut index = if merge {
      ObjectIndex::load(&path)?
    } else {
      ObjectIndex::new()
    };

    let mut tagged = TaggedIds::default();
    if let Some(group) = self.root.output_group() {
      for (url, object) in group.snapshot() {
        if url.url_type != UrlType::Internal || object.object_id.is_empty() {
          continue;
        }
        if object.tags.contains(DO_NOT_COMPRESS_TAG) {
          tagged.do_not_compress.insert(object.object_id);
        }
        if object.tags.contains(DO_NOT_PACK_TAG) {
          tagged.do_not_pack.insert(object.object_id);
        }
        index.insert(url.path, object.object_id);
      }
    }

    index.save(&path)?;
    info!(
      path = %path.display(),
      entries = index.len(),
      do_not_compress = tagged.do_not_compress.len(),
      do_not_pack = tagged.do_not_pack.len(),
      "index file written"
    );
    *self.tagged_ids.lock().unwrap_or_else(|e| e.into_inner()) = tagged;
    Ok(index)
  }

  /// Ids of internal outputs tagged [`DO_NOT_COMPRESS_TAG`], collected by
  /// the last [`Builder::write_index_file`].
  pub fn disable_compression_ids(&self) -> BTreeSet<ObjectId> {
    self
      .tagged_ids
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .do_not_compress
      .clone()
  }

  /// Ids of internal outputs tagged [`DO_NOT_PACK_TAG`], collected by the
  /// last [`Builder::write_index_file`]. They stay in the index.
  pub fn do_not_pack_ids(&self) -> BTreeSet<ObjectId> {
    self
      .tagged_ids
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .do_not_pack
      .clone()
  }
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Wipe the store if the database was written with another cache format.
fn check_cache_version(path: &Path, store: &dyn ObjectStore) -> Result<(), BuildError> {
  let found = match fs::read_to_string(path) {
    Ok(content) => content.trim().parse::<u32>().ok(),
    Err(e) if e.kind() == ErrorKind::NotFound => None,
    Err(e) => return Err(e.into()),
  };
  if found == Some(CACHE_FORMAT_VERSION) {
    return Ok(());
  }

  if !store.enumerate()?.is_empty() {
    let removed = store.clear()?;
    warn!(
      ?found,
      expected = CACHE_FORMAT_VERSION,
      removed,
      "cache format changed, object store wiped"
    );
  }
  fs::write(path, CACHE_FORMAT_VERSION.to_string())?;
  Ok(())
}

fn remove_file_if_exists(path: &Path) -> Result<(), std::io::Error> {
  match fs::remove_file(path) {
    Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
    _ => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_config_defaults() {
    let config = BuilderConfig::new("/tmp/kiln");
    assert_eq!(config.index_name, "index");
    assert!(config.thread_count >= 1);
    assert_eq!(config.index_path(), PathBuf::from("/tmp/kiln/db/index/index"));
    assert_eq!(
      config.input_hashes_path(),
      PathBuf::from("/tmp/kiln/db/input_hashes.json")
    );
  }

  #[test]
  fn test_version_stamp_written_on_open() {
    let dir = TempDir::new().unwrap();
    Builder::new(BuilderConfig::new(dir.path())).unwrap();

    let stamp = fs::read_to_string(dir.path().join("db/version")).unwrap();
    assert_eq!(stamp, CACHE_FORMAT_VERSION.to_string());
  }

  #[test]
  fn test_stale_cache_format_wipes_store() {
    let dir = TempDir::new().unwrap();
    let builder = Builder::new(BuilderConfig::new(dir.path())).unwrap();
    let id = builder.store().put(bytes::Bytes::from_static(b"old")).unwrap();
    drop(builder);

    fs::write(dir.path().join("db/version"), "2").unwrap();
    let builder = Builder::new(BuilderConfig::new(dir.path())).unwrap();
    assert!(!builder.store().exists(&id).unwrap());

    // Same version: contents survive.
    let id = builder.store().put(bytes::Bytes::from_static(b"new")).unwrap();
    drop(builder);
    let builder = Builder::new(BuilderConfig::new(dir.path())).unwrap();
    assert!(builder.store().exists(&id).unwrap());
  }

  #[test]
  fn test_empty_root_runs_successfully() {
    let dir = TempDir::new().unwrap();
    let builder = Builder::new(BuilderConfig::new(dir.path()).with_thread_count(2)).unwrap();

    let report = builder.run(BuildMode::Build).unwrap();
    assert_eq!(report.result, BuildResultCode::Successful);
    assert_eq!(report.counts.total(), 0);
    assert_eq!(builder.root().status(), ResultStatus::Successful);
    assert!(!builder.is_running());
  }

  #[test]
  fn test_root_cannot_run_twice_without_reset() {
    let dir = TempDir::new().unwrap();
    let mut builder = Builder::new(BuilderConfig::new(dir.path())).unwrap();

    builder.run(BuildMode::Build).unwrap();
    assert!(matches!(
      builder.run(BuildMode::Build),
      Err(BuildError::RootAlreadyExecuted)
    ));

    builder.reset();
    assert!(builder.run(BuildMode::Build).is_ok());
  }
}
