//! Backing document store contract
//!
//! The data layer talks to its remote store only through [`DocumentStore`].
//! [`InMemoryStore`] is a complete in-process implementation.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use types::{Document, QueryOptions};

use crate::error::{DataError, DataResult, Operation, StoreError};

/// What a live subscription delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
  /// Current state of one document; `None` once it no longer exists
  Document(Option<Document>),
  /// Current result list of a query
  Query(Vec<Document>),
}

/// Handle on a live subscription.
///
/// The store pushes snapshots (or errors) until the handle is dropped or
/// [`unsubscribe`](Subscription::unsubscribe) is called; both release the
/// store-side registration.
pub struct Subscription {
  rx: mpsc::UnboundedReceiver<Result<Snapshot, StoreError>>,
  cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
  pub fn new(
    rx: mpsc::UnboundedReceiver<Result<Snapshot, StoreError>>,
    cancel: impl FnOnce() + Send + Sync + 'static,
  ) -> Self {
    Self {
      rx,
      cancel: Some(Box::new(cancel)),
    }
  }

  /// Next snapshot, or `None` once the store closed the subscription.
  pub async fn recv(&mut self) -> Option<Result<Snapshot, StoreError>> {
    self.rx.recv().await
  }

  pub fn unsubscribe(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.release();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("active", &self.cancel.is_some())
      .finish()
  }
}

/// Minimal CRUD + query + subscribe contract of the backing store.
///
/// Every call may be slow, fail, or race with other calls. Bodies are JSON
/// objects; the document id lives beside the body, not inside it.
#[async_trait]
pub trait DocumentStore: Send + Sync {
  /// Read one document; `StoreError::NotFound` when it does not exist.
  async fn get(&self, collection: &str, id: &str) -> Result<Document, StoreError>;

  /// Run a query: filters, at most one sort key, optional limit.
  async fn get_many(
    &self,
    collection: &str,
    options: &QueryOptions,
  ) -> Result<Vec<Document>, StoreError>;

  /// Create or overwrite a document.
  async fn put(&self, collection: &str, id: &str, data: Value) -> Result<Document, StoreError>;

  /// Shallow-merge `partial` into an existing document.
  async fn patch(&self, collection: &str, id: &str, partial: Value)
    -> Result<Document, StoreError>;

  /// Delete a document. Deleting a missing document succeeds.
  async fn remove(&self, collection: &str, id: &str) -> Result<(), StoreError>;

  /// Follow one document. The current state is delivered first.
  async fn subscribe(&self, collection: &str, id: &str) -> Result<Subscription, StoreError>;

  /// Follow a query's result list. The current result is delivered first.
  async fn subscribe_query(
    &self,
    collection: &str,
    options: &QueryOptions,
  ) -> Result<Subscription, StoreError>;

  /// A fresh id for a document about to be `put`.
  fn generate_id(&self, collection: &str) -> String;

  /// Timestamp token for bookkeeping fields.
  fn now(&self) -> Value;
}

/// Await a store call, bounded by `timeout` when one is set, and attach the
/// operation context to any failure.
pub(crate) async fn bounded<T, F>(
  timeout: Option<Duration>,
  operation: Operation,
  collection: &str,
  id: &str,
  call: F,
) -> DataResult<T>
where
  F: Future<Output = Result<T, StoreError>>,
{
  let started = Instant::now();
  let outcome = match timeout {
    Some(limit) => match tokio::time::timeout(limit, call).await {
      Ok(outcome) => outcome,
      Err(_) => {
        return Err(DataError::Timeout {
          operation,
          collection: collection.to_string(),
          id: id.to_string(),
          elapsed_ms: started.elapsed().as_millis() as u64,
        })
      }
    },
    None => call.await,
  };
  outcome.map_err(|err| DataError::from_store(operation, collection, id, err))
}
