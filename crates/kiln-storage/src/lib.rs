//! Kiln Storage
//!
//! Storage collaborators consumed by the build engine:
//!
//! - [`ObjectId`] / [`ObjectUrl`]: content hash and typed logical path of a build output
//! - [`ObjectStore`]: opaque key to blob store keyed by content hash ([`FsObjectStore`],
//!   [`MemoryObjectStore`])
//! - [`ObjectIndex`]: persisted mapping of logical output path to content hash
//! - [`VersionTracker`]: content hashes for on-disk input files ([`FileVersionTracker`])
//! - [`VirtualFileSystem`]: resolves virtual paths to a mounted [`MountProvider`]

mod error;
mod fs;
mod id;
mod index;
mod memory;
mod store;
mod tracker;
mod url;
mod vfs;

pub use error::StorageError;
pub use fs::FsObjectStore;
pub use id::{ObjectId, ObjectIdBuilder};
pub use index::ObjectIndex;
pub use memory::MemoryObjectStore;
pub use store::ObjectStore;
pub use tracker::{FileVersionTracker, VersionTracker};
pub use url::{ObjectUrl, UrlType};
pub use vfs::{MountProvider, VirtualFileSystem};
