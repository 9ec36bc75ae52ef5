//! Resolves relation descriptors against the store, through the cache

use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use types::{Document, FieldFilter, QueryOptions};

use super::{foreign_ids, RelationDescriptor, RelationKind};
use crate::cache::{CacheStore, RelationKey, Related};
use crate::error::{DataError, DataResult, Operation};
use crate::store::{bounded, DocumentStore};

pub struct RelatedEntityLoader {
  store: Arc<dyn DocumentStore>,
  cache: Arc<CacheStore>,
  coalesce_window: Duration,
  timeout: Option<Duration>,
  /// Read and write the cache; off, every load goes to the store
  use_cache: bool,
  /// (collection, id) of each root -> when its last `load_all` started
  recent: Mutex<HashMap<(String, String), Instant>>,
}

impl RelatedEntityLoader {
  pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<CacheStore>) -> Self {
    Self {
      store,
      cache,
      coalesce_window: Duration::from_millis(250),
      timeout: None,
      use_cache: true,
      recent: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_coalesce_window(mut self, window: Duration) -> Self {
    self.coalesce_window = window;
    self
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_cache(mut self, enabled: bool) -> Self {
    self.use_cache = enabled;
    self
  }

  /// Resolve every descriptor for `root`, concurrently.
  ///
  /// Returns `None` when another `load_all` for the same root started less
  /// than the coalesce window ago; that call's results stand for both.
  /// Individual relation failures resolve to the relation's empty value.
  pub async fn load_all(
    &self,
    root: &Document,
    descriptors: &[RelationDescriptor],
  ) -> Option<HashMap<String, Related>> {
    if !self.claim(root) {
      debug!(
        collection = %root.collection,
        id = %root.id,
        "Relation load coalesced with a recent one"
      );
      return None;
    }

    let loads = descriptors.iter().map(|d| async move {
      let related = self.load_one(d, root).await;
      (d.name.clone(), related)
    });
    Some(join_all(loads).await.into_iter().collect())
  }

  /// Resolve one descriptor. Never fails: errors are logged and the
  /// relation resolves empty.
  pub async fn load_one(&self, descriptor: &RelationDescriptor, root: &Document) -> Related {
    match self.try_load_one(descriptor, root).await {
      Ok(related) => related,
      Err(err) => {
        warn!(
          relation = %descriptor.name,
          collection = %root.collection,
          id = %root.id,
          error = %err,
          "Failed to load relation"
        );
        descriptor.empty()
      }
    }
  }

  /// Resolve one descriptor, surfacing the failure instead of swallowing it.
  pub async fn try_load_one(
    &self,
    descriptor: &RelationDescriptor,
    root: &Document,
  ) -> DataResult<Related> {
    let key = RelationKey::new(&root.collection, &root.id, &descriptor.collection)
      .filter(|_| self.use_cache);
    if let Some(key) = &key {
      // Several relations of one root can target the same collection and
      // share a key; only a value that fits this one is reused.
      if let Ok(cached) = self.cache.get_relation_for(key, &descriptor.name) {
        if descriptor.is_current(&cached, root) {
          return Ok(cached);
        }
      }
    }

    let related = match &descriptor.kind {
      RelationKind::OneToOne { foreign_key } => {
        match foreign_ids(root.field(foreign_key)).into_iter().next() {
          // Nothing to point at; not an error, and nothing is cached.
          None => return Ok(Related::One(None)),
          Some(id) => Related::One(self.fetch_target(&descriptor.collection, &id).await?),
        }
      }
      RelationKind::OneToMany { foreign_key } => {
        let ids = foreign_ids(root.field(foreign_key));
        if ids.is_empty() {
          return Ok(Related::Many(Vec::new()));
        }
        let fetches = ids
          .iter()
          .map(|id| self.fetch_target(&descriptor.collection, id));
        let mut docs = Vec::with_capacity(ids.len());
        for fetched in join_all(fetches).await {
          if let Some(doc) = fetched? {
            docs.push(doc);
          }
        }
        Related::Many(docs)
      }
      RelationKind::Inverse { field, contains } => {
        let filter = if *contains {
          FieldFilter::array_contains(field.as_str(), root.id.as_str())
        } else {
          FieldFilter::eq(field.as_str(), root.id.as_str())
        };
        let options = QueryOptions::new().filter(filter);
        let docs = bounded(
          self.timeout,
          Operation::Query,
          &descriptor.collection,
          &root.id,
          self.store.get_many(&descriptor.collection, &options),
        )
        .await?;
        if self.use_cache {
          for doc in &docs {
            self.cache.set_entity(&doc.collection, &doc.id, doc.clone());
          }
        }
        Related::Many(docs)
      }
      RelationKind::Custom(resolver) => {
        let value = bounded(
          self.timeout,
          Operation::Query,
          &descriptor.collection,
          &root.id,
          resolver.resolve(root, self.store.as_ref()),
        )
        .await?;
        Related::Opaque(value)
      }
    };

    if let Some(key) = &key {
      self.cache.set_relation_for(key, &descriptor.name, related.clone());
    }
    Ok(related)
  }

  /// Resolve a relation for an explicit target id, ignoring the root's own
  /// foreign key.
  pub async fn load_by_id(
    &self,
    descriptor: &RelationDescriptor,
    root: &Document,
    target_id: &str,
  ) -> DataResult<Related> {
    if target_id.is_empty() {
      return Ok(Related::One(None));
    }
    let related = Related::One(self.fetch_target(&descriptor.collection, target_id).await?);
    let key = RelationKey::new(&root.collection, &root.id, &descriptor.collection)
      .filter(|_| self.use_cache);
    if let Some(key) = key {
      self.cache.set_relation_for(&key, &descriptor.name, related.clone());
    }
    Ok(related)
  }

  /// Forget the coalescing record of a root so the next `load_all` runs.
  pub fn reset(&self, collection: &str, id: &str) {
    self
      .recent
      .lock()
      .remove(&(collection.to_string(), id.to_string()));
  }

  /// One target by id: entity cache first, then the store. A target that no
  /// longer exists is `None`; any other failure is an error.
  async fn fetch_target(&self, collection: &str, id: &str) -> DataResult<Option<Document>> {
    if self.use_cache {
      if let Ok(doc) = self.cache.get_entity(collection, id) {
        return Ok(Some(doc));
      }
    }
    match bounded(
      self.timeout,
      Operation::Get,
      collection,
      id,
      self.store.get(collection, id),
    )
    .await
    {
      Ok(doc) => {
        if self.use_cache {
          self.cache.set_entity(collection, id, doc.clone());
        }
        Ok(Some(doc))
      }
      Err(DataError::NotFound { .. }) => Ok(None),
      Err(err) => Err(err),
    }
  }

  fn claim(&self, root: &Document) -> bool {
    if self.coalesce_window.is_zero() {
      return true;
    }
    let now = Instant::now();
    let mut recent = self.recent.lock();
    recent.retain(|_, started| now.saturating_duration_since(*started) < self.coalesce_window);
    let key = (root.collection.clone(), root.id.clone());
    if recent.contains_key(&key) {
      return false;
    }
    recent.insert(key, now);
    true
  }
}
