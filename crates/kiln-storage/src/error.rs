use thiserror::Error;

use crate::ObjectId;

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
  /// The requested object is not in the store.
  #[error("object not found: {id}")]
  NotFound { id: ObjectId },

  #[error("invalid object id: {value}")]
  InvalidObjectId { value: String },

  #[error("invalid object url: {value}")]
  InvalidUrl { value: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}
