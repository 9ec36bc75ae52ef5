//! Error taxonomy for the data layer.
//!
//! Backend failures arrive as [`StoreError`]; everything the data layer hands
//! back to consumers is a [`DataError`]. Both are `Clone` so they can sit inside
//! observable state published through watch channels.

use serde::Serialize;
use thiserror::Error;
use types::Document;

/// Failure reported by a [`DocumentStore`](crate::store::DocumentStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
  #[error("document {collection}/{id} not found")]
  NotFound { collection: String, id: String },
  #[error("store unavailable: {0}")]
  Unavailable(String),
  #[error("store rejected the request: {0}")]
  Rejected(String),
  #[error("store error: {0}")]
  Backend(String),
}

/// The store operation a [`DataError::Transient`] happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
  Get,
  Query,
  Subscribe,
  Create,
  Update,
  Delete,
}

impl std::fmt::Display for Operation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Operation::Get => write!(f, "get"),
      Operation::Query => write!(f, "query"),
      Operation::Subscribe => write!(f, "subscribe"),
      Operation::Create => write!(f, "create"),
      Operation::Update => write!(f, "update"),
      Operation::Delete => write!(f, "delete"),
    }
  }
}

/// Why a delete was refused: the first dependency check that found
/// referencing documents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyBlock {
  /// Collection holding the referencing documents
  pub collection: String,
  /// Number of referencing documents found
  pub count: usize,
  /// Up to five referencing documents, for display
  pub sample: Vec<Document>,
  pub message: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
  /// The root entity does not exist remotely. Not retried automatically.
  #[error("{collection}/{id} not found")]
  NotFound { collection: String, id: String },

  /// Network or backend failure. Safe to retry.
  #[error("{operation} {collection}/{id} failed: {source}")]
  Transient {
    operation: Operation,
    collection: String,
    id: String,
    #[source]
    source: StoreError,
  },

  /// The store did not answer within the configured fetch timeout.
  #[error("{operation} {collection}/{id} timed out after {elapsed_ms}ms")]
  Timeout {
    operation: Operation,
    collection: String,
    id: String,
    elapsed_ms: u64,
  },

  /// Rejected before any write was issued.
  #[error("validation failed: {0}")]
  Validation(String),

  /// Delete refused because other documents still reference the entity.
  #[error("{}", .0.message)]
  DependencyBlocked(DependencyBlock),

  /// A collection or id was empty.
  #[error("invalid key: {0}")]
  InvalidKey(String),
}

impl DataError {
  /// Wrap a store error with the operation context it happened in. A store
  /// `NotFound` becomes [`DataError::NotFound`], everything else is transient.
  pub fn from_store(operation: Operation, collection: &str, id: &str, err: StoreError) -> Self {
    match err {
      StoreError::NotFound { collection, id } => DataError::NotFound { collection, id },
      other => DataError::Transient {
        operation,
        collection: collection.to_string(),
        id: id.to_string(),
        source: other,
      },
    }
  }

  pub fn not_found(collection: &str, id: &str) -> Self {
    DataError::NotFound {
      collection: collection.to_string(),
      id: id.to_string(),
    }
  }

  /// Whether calling `retry()` can be expected to help.
  pub fn is_retryable(&self) -> bool {
    matches!(self, DataError::Transient { .. } | DataError::Timeout { .. })
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, DataError::NotFound { .. })
  }

  pub fn dependency_block(&self) -> Option<&DependencyBlock> {
    match self {
      DataError::DependencyBlocked(block) => Some(block),
      _ => None,
    }
  }
}

pub type DataResult<T> = Result<T, DataError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn store_not_found_maps_to_not_found() {
    let err = DataError::from_store(
      Operation::Get,
      "contacts",
      "c1",
      StoreError::NotFound {
        collection: "contacts".into(),
        id: "c1".into(),
      },
    );
    assert!(err.is_not_found());
    assert!(!err.is_retryable());
  }

  #[test]
  fn backend_failure_is_retryable() {
    let err = DataError::from_store(
      Operation::Get,
      "contacts",
      "c1",
      StoreError::Unavailable("connection reset".into()),
    );
    assert!(err.is_retryable());
    assert_eq!(
      err.to_string(),
      "get contacts/c1 failed: store unavailable: connection reset"
    );
  }
}
