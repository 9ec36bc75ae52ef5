//! Writes against the store, with validation, bookkeeping timestamps and
//! cache invalidation

mod guard;

pub use guard::{DependencyCheck, DependencyProbe, Reference, SAMPLE_SIZE};

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use types::Document;

use crate::cache::CacheStore;
use crate::error::{DataError, DataResult, Operation};
use crate::store::{bounded, DocumentStore};

/// Field stamped with the store's timestamp on create.
pub const CREATED_AT: &str = "createdAt";
/// Field stamped with the store's timestamp on every write.
pub const UPDATED_AT: &str = "updatedAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
  Create,
  Update,
}

/// Check run on a payload before it is written. An `Err` message becomes a
/// [`DataError::Validation`] and the write is never issued.
pub trait Validator: Send + Sync {
  fn validate(&self, data: &Map<String, Value>, kind: WriteKind) -> Result<(), String>;
}

impl<F> Validator for F
where
  F: Fn(&Map<String, Value>, WriteKind) -> Result<(), String> + Send + Sync,
{
  fn validate(&self, data: &Map<String, Value>, kind: WriteKind) -> Result<(), String> {
    self(data, kind)
  }
}

/// Fields that must be present and non-empty on create. On update they may
/// be omitted but not blanked.
pub struct RequiredFields(pub Vec<String>);

impl RequiredFields {
  pub fn new(fields: &[&str]) -> Self {
    Self(fields.iter().map(|f| f.to_string()).collect())
  }
}

impl Validator for RequiredFields {
  fn validate(&self, data: &Map<String, Value>, kind: WriteKind) -> Result<(), String> {
    for field in &self.0 {
      let blank = match data.get(field) {
        None => kind == WriteKind::Create,
        Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
      };
      if blank {
        return Err(format!("'{}' is required", field));
      }
    }
    Ok(())
  }
}

/// One step of a [`MutationCoordinator::batch`].
#[derive(Debug, Clone)]
pub enum Mutation {
  Create { collection: String, data: Value },
  Update {
    collection: String,
    id: String,
    patch: Value,
  },
  Delete { collection: String, id: String },
}

impl Mutation {
  pub fn collection(&self) -> &str {
    match self {
      Mutation::Create { collection, .. }
      | Mutation::Update { collection, .. }
      | Mutation::Delete { collection, .. } => collection,
    }
  }
}

pub struct MutationCoordinator {
  store: Arc<dyn DocumentStore>,
  cache: Arc<CacheStore>,
  timeout: Option<Duration>,
  validators: RwLock<HashMap<String, Vec<Arc<dyn Validator>>>>,
}

impl MutationCoordinator {
  pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<CacheStore>) -> Self {
    Self {
      store,
      cache,
      timeout: None,
      validators: RwLock::new(HashMap::new()),
    }
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  /// Register a validator for every create and update in `collection`.
  pub fn add_validator(&self, collection: &str, validator: Arc<dyn Validator>) {
    self
      .validators
      .write()
      .entry(collection.to_string())
      .or_default()
      .push(validator);
  }

  /// Create a document under a fresh id.
  pub async fn create(&self, collection: &str, data: Value) -> DataResult<Document> {
    if collection.is_empty() {
      return Err(DataError::InvalidKey("collection must not be empty".into()));
    }
    let id = self.store.generate_id(collection);
    self.create_with_id(collection, &id, data).await
  }

  /// Create (or overwrite) a document under a caller-chosen id.
  pub async fn create_with_id(
    &self,
    collection: &str,
    id: &str,
    data: Value,
  ) -> DataResult<Document> {
    let doc = self.write_create(collection, id, data).await?;
    // A new document may belong to any cached list of its collection.
    self.cache.invalidate(collection, None);
    debug!(collection, id, "Created document");
    Ok(doc)
  }

  /// Shallow-merge `patch` into an existing document.
  pub async fn update(&self, collection: &str, id: &str, patch: Value) -> DataResult<Document> {
    let doc = self.write_update(collection, id, patch).await?;
    self.cache.invalidate(collection, Some(id));
    self.cache.invalidate_relations_from(collection, id);
    debug!(collection, id, "Updated document");
    Ok(doc)
  }

  pub async fn delete(&self, collection: &str, id: &str) -> DataResult<()> {
    self.write_delete(collection, id).await?;
    self.cache.invalidate(collection, Some(id));
    self.cache.invalidate_relations_from(collection, id);
    debug!(collection, id, "Deleted document");
    Ok(())
  }

  /// Delete unless one of `checks` finds documents that still reference the
  /// entity. Checks run in order; the first hit is reported and nothing is
  /// removed.
  pub async fn delete_guarded(
    &self,
    collection: &str,
    id: &str,
    checks: &[DependencyCheck],
  ) -> DataResult<()> {
    if collection.is_empty() || id.is_empty() {
      return Err(DataError::InvalidKey(format!("{}/{}", collection, id)));
    }
    for check in checks {
      if let Some(block) = check.evaluate(self.store.as_ref(), self.timeout, id).await? {
        warn!(
          collection,
          id,
          referenced_by = %block.collection,
          count = block.count,
          "Delete blocked by dependent documents"
        );
        return Err(DataError::DependencyBlocked(block));
      }
    }
    self.delete(collection, id).await
  }

  /// Apply several mutations in order. Every affected collection is
  /// invalidated once at the end, including when a step fails; the first
  /// failure stops the batch and is returned.
  ///
  /// The result holds the confirmed document of each create and update and
  /// `None` for each delete.
  pub async fn batch(&self, mutations: Vec<Mutation>) -> DataResult<Vec<Option<Document>>> {
    let mut touched: BTreeSet<String> = BTreeSet::new();
    let mut results = Vec::with_capacity(mutations.len());
    let mut failure = None;

    for mutation in mutations {
      let outcome = match &mutation {
        Mutation::Create { collection, data } => {
          let id = self.store.generate_id(collection);
          self.write_create(collection, &id, data.clone()).await.map(Some)
        }
        Mutation::Update {
          collection,
          id,
          patch,
        } => self.write_update(collection, id, patch.clone()).await.map(Some),
        Mutation::Delete { collection, id } => self.write_delete(collection, id).await.map(|_| None),
      };
      match outcome {
        Ok(result) => {
          touched.insert(mutation.collection().to_string());
          results.push(result);
        }
        Err(err) => {
          failure = Some(err);
          break;
        }
      }
    }

    for collection in &touched {
      self.cache.invalidate(collection, None);
    }
    debug!(collections = touched.len(), steps = results.len(), "Applied batch");

    match failure {
      Some(err) => Err(err),
      None => Ok(results),
    }
  }

  async fn write_create(&self, collection: &str, id: &str, data: Value) -> DataResult<Document> {
    let mut body = self.prepare(collection, id, data, WriteKind::Create)?;
    let now = self.store.now();
    body.insert(CREATED_AT.to_string(), now.clone());
    body.insert(UPDATED_AT.to_string(), now);
    bounded(
      self.timeout,
      Operation::Create,
      collection,
      id,
      self.store.put(collection, id, Value::Object(body)),
    )
    .await
  }

  async fn write_update(&self, collection: &str, id: &str, patch: Value) -> DataResult<Document> {
    let mut body = self.prepare(collection, id, patch, WriteKind::Update)?;
    body.remove(CREATED_AT);
    body.insert(UPDATED_AT.to_string(), self.store.now());
    bounded(
      self.timeout,
      Operation::Update,
      collection,
      id,
      self.store.patch(collection, id, Value::Object(body)),
    )
    .await
  }

  async fn write_delete(&self, collection: &str, id: &str) -> DataResult<()> {
    if collection.is_empty() || id.is_empty() {
      return Err(DataError::InvalidKey(format!("{}/{}", collection, id)));
    }
    bounded(
      self.timeout,
      Operation::Delete,
      collection,
      id,
      self.store.remove(collection, id),
    )
    .await
  }

  /// Key check, object check and validators. Returns the body to write.
  fn prepare(
    &self,
    collection: &str,
    id: &str,
    data: Value,
    kind: WriteKind,
  ) -> DataResult<Map<String, Value>> {
    if collection.is_empty() || id.is_empty() {
      return Err(DataError::InvalidKey(format!("{}/{}", collection, id)));
    }
    let Value::Object(mut body) = data else {
      return Err(DataError::Validation(
        "document body must be a JSON object".into(),
      ));
    };
    body.remove("id");

    if let Some(list) = self.validators.read().get(collection) {
      for validator in list {
        validator
          .validate(&body, kind)
          .map_err(DataError::Validation)?;
      }
    }
    Ok(body)
  }
}
