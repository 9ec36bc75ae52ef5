//! In-process document store with live subscriptions

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use types::{ChangeOperation, Document, DocumentChange, QueryOptions};
use uuid::Uuid;

use super::{DocumentStore, Snapshot, Subscription};
use crate::error::StoreError;

enum Watch {
  Document(String),
  Query(QueryOptions),
}

struct Watcher {
  id: u64,
  watch: Watch,
  tx: mpsc::UnboundedSender<Result<Snapshot, StoreError>>,
}

struct Inner {
  /// Collection name -> (id -> body)
  collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
  /// Collection name -> watchers on that collection. Changes only visit the
  /// watchers of the collection they touch.
  watchers: RwLock<HashMap<String, Vec<Watcher>>>,
  change_tx: broadcast::Sender<DocumentChange>,
  next_watcher: AtomicU64,
}

/// A [`DocumentStore`] kept entirely in memory.
///
/// Cloning is cheap and every clone sees the same data.
#[derive(Clone)]
pub struct InMemoryStore {
  inner: Arc<Inner>,
}

impl Default for InMemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryStore {
  pub fn new() -> Self {
    let (change_tx, _) = broadcast::channel(1024);
    Self {
      inner: Arc::new(Inner {
        collections: RwLock::new(HashMap::new()),
        watchers: RwLock::new(HashMap::new()),
        change_tx,
        next_watcher: AtomicU64::new(1),
      }),
    }
  }

  /// Load a seed of the form `{ "<collection>": [ { "id": "...", ... } ] }`.
  /// Entries without a string id get a generated one.
  pub fn from_seed(seed: &Value) -> Result<Self, StoreError> {
    let store = Self::new();
    let collections = seed
      .as_object()
      .ok_or_else(|| StoreError::Rejected("seed must be an object of collections".into()))?;
    for (collection, docs) in collections {
      let docs = docs.as_array().ok_or_else(|| {
        StoreError::Rejected(format!("seed collection '{}' must be an array", collection))
      })?;
      for doc in docs {
        let mut body = doc.clone();
        let id = match body.as_object_mut().and_then(|o| o.remove("id")) {
          Some(Value::String(id)) if !id.is_empty() => id,
          _ => store.generate_id(collection),
        };
        store.insert(collection, &id, body)?;
      }
    }
    Ok(store)
  }

  /// Synchronous `put`, for seeding.
  pub fn insert(&self, collection: &str, id: &str, data: Value) -> Result<Document, StoreError> {
    check_key(collection, id)?;
    let data = strip_id(check_body(data)?);
    let existed = self
      .inner
      .collections
      .write()
      .entry(collection.to_string())
      .or_default()
      .insert(id.to_string(), data.clone())
      .is_some();

    let doc = Document::new(collection, id, data);
    let op = if existed {
      ChangeOperation::Update
    } else {
      ChangeOperation::Insert
    };
    self.notify(DocumentChange::upsert(op, doc.clone()));
    Ok(doc)
  }

  /// Raw feed of every change applied to the store.
  pub fn changes(&self) -> broadcast::Receiver<DocumentChange> {
    self.inner.change_tx.subscribe()
  }

  /// Number of documents in a collection.
  pub fn count(&self, collection: &str) -> usize {
    self
      .inner
      .collections
      .read()
      .get(collection)
      .map_or(0, BTreeMap::len)
  }

  pub fn collection_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.inner.collections.read().keys().cloned().collect();
    names.sort();
    names
  }

  /// Number of live subscriptions still registered.
  pub fn subscriber_count(&self) -> usize {
    self.inner.watchers.read().values().map(Vec::len).sum()
  }

  fn read_one(&self, collection: &str, id: &str) -> Option<Document> {
    self
      .inner
      .collections
      .read()
      .get(collection)
      .and_then(|docs| docs.get(id))
      .map(|data| Document::new(collection, id, data.clone()))
  }

  fn query(&self, collection: &str, options: &QueryOptions) -> Vec<Document> {
    let collections = self.inner.collections.read();
    let Some(docs) = collections.get(collection) else {
      return Vec::new();
    };
    options.apply(
      docs
        .iter()
        .map(|(id, data)| Document::new(collection, id.as_str(), data.clone())),
    )
  }

  fn notify(&self, change: DocumentChange) {
    let _ = self.inner.change_tx.send(change.clone());

    let mut index = self.inner.watchers.write();
    let Some(watchers) = index.get_mut(&change.collection) else {
      return;
    };
    watchers.retain(|w| {
      let snapshot = match &w.watch {
        Watch::Document(id) if *id == change.id => {
          let current = if change.is_delete() {
            None
          } else {
            change.document.clone()
          };
          Snapshot::Document(current)
        }
        Watch::Document(_) => return true,
        Watch::Query(options) => Snapshot::Query(self.query(&change.collection, options)),
      };
      w.tx.send(Ok(snapshot)).is_ok()
    });
    if watchers.is_empty() {
      index.remove(&change.collection);
    }
  }

  fn register(&self, collection: &str, watch: Watch, initial: Snapshot) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(Ok(initial));

    let id = self.inner.next_watcher.fetch_add(1, Ordering::Relaxed);
    self
      .inner
      .watchers
      .write()
      .entry(collection.to_string())
      .or_default()
      .push(Watcher { id, watch, tx });

    let inner: Weak<Inner> = Arc::downgrade(&self.inner);
    let collection = collection.to_string();
    Subscription::new(rx, move || {
      let Some(inner) = inner.upgrade() else {
        return;
      };
      let mut index = inner.watchers.write();
      if let Some(watchers) = index.get_mut(&collection) {
        watchers.retain(|w| w.id != id);
        if watchers.is_empty() {
          index.remove(&collection);
        }
      }
    })
  }
}

fn check_key(collection: &str, id: &str) -> Result<(), StoreError> {
  if collection.is_empty() || id.is_empty() {
    return Err(StoreError::Rejected("collection and id must not be empty".into()));
  }
  Ok(())
}

fn check_body(data: Value) -> Result<Value, StoreError> {
  if !data.is_object() {
    return Err(StoreError::Rejected("document body must be a JSON object".into()));
  }
  Ok(data)
}

fn strip_id(mut data: Value) -> Value {
  if let Some(obj) = data.as_object_mut() {
    obj.remove("id");
  }
  data
}

#[async_trait]
impl DocumentStore for InMemoryStore {
  async fn get(&self, collection: &str, id: &str) -> Result<Document, StoreError> {
    self
      .read_one(collection, id)
      .ok_or_else(|| StoreError::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
      })
  }

  async fn get_many(
    &self,
    collection: &str,
    options: &QueryOptions,
  ) -> Result<Vec<Document>, StoreError> {
    Ok(self.query(collection, options))
  }

  async fn put(&self, collection: &str, id: &str, data: Value) -> Result<Document, StoreError> {
    self.insert(collection, id, data)
  }

  async fn patch(
    &self,
    collection: &str,
    id: &str,
    partial: Value,
  ) -> Result<Document, StoreError> {
    check_key(collection, id)?;
    let partial = strip_id(check_body(partial)?);
    let doc = {
      let mut collections = self.inner.collections.write();
      let body = collections
        .get_mut(collection)
        .and_then(|docs| docs.get_mut(id))
        .ok_or_else(|| StoreError::NotFound {
          collection: collection.to_string(),
          id: id.to_string(),
        })?;
      if let (Some(target), Some(source)) = (body.as_object_mut(), partial.as_object()) {
        for (k, v) in source {
          target.insert(k.clone(), v.clone());
        }
      }
      Document::new(collection, id, body.clone())
    };
    self.notify(DocumentChange::upsert(ChangeOperation::Update, doc.clone()));
    Ok(doc)
  }

  async fn remove(&self, collection: &str, id: &str) -> Result<(), StoreError> {
    check_key(collection, id)?;
    let last = self
      .inner
      .collections
      .write()
      .get_mut(collection)
      .and_then(|docs| docs.remove(id));
    if let Some(data) = last {
      let last = Document::new(collection, id, data);
      self.notify(DocumentChange::delete(collection, id, Some(last)));
    }
    Ok(())
  }

  async fn subscribe(&self, collection: &str, id: &str) -> Result<Subscription, StoreError> {
    check_key(collection, id)?;
    let initial = Snapshot::Document(self.read_one(collection, id));
    Ok(self.register(collection, Watch::Document(id.to_string()), initial))
  }

  async fn subscribe_query(
    &self,
    collection: &str,
    options: &QueryOptions,
  ) -> Result<Subscription, StoreError> {
    if collection.is_empty() {
      return Err(StoreError::Rejected("collection must not be empty".into()));
    }
    let initial = Snapshot::Query(self.query(collection, options));
    Ok(self.register(collection, Watch::Query(options.clone()), initial))
  }

  fn generate_id(&self, _collection: &str) -> String {
    Uuid::new_v4().simple().to_string()
  }

  fn now(&self) -> Value {
    Value::String(Utc::now().to_rfc3339())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use types::FieldFilter;

  #[tokio::test]
  async fn patch_merges_and_missing_is_not_found() {
    let store = InMemoryStore::new();
    store
      .put("contacts", "c1", json!({ "name": "Ada", "city": "Lyon" }))
      .await
      .unwrap();
    let doc = store
      .patch("contacts", "c1", json!({ "city": "Nantes" }))
      .await
      .unwrap();
    assert_eq!(doc.str_field("name"), Some("Ada"));
    assert_eq!(doc.str_field("city"), Some("Nantes"));

    let err = store
      .patch("contacts", "nope", json!({ "city": "Paris" }))
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
  }

  #[tokio::test]
  async fn query_subscription_follows_writes() {
    let store = InMemoryStore::new();
    let options = QueryOptions::new().filter(FieldFilter::eq("city", "Lyon"));
    let mut sub = store.subscribe_query("venues", &options).await.unwrap();
    assert_eq!(sub.recv().await, Some(Ok(Snapshot::Query(vec![]))));

    store
      .put("venues", "v1", json!({ "name": "Le Transbordeur", "city": "Lyon" }))
      .await
      .unwrap();
    match sub.recv().await {
      Some(Ok(Snapshot::Query(docs))) => assert_eq!(docs.len(), 1),
      other => panic!("unexpected {:?}", other),
    }

    assert_eq!(store.subscriber_count(), 1);
    drop(sub);
    assert_eq!(store.subscriber_count(), 0);
  }

  #[test]
  fn seed_assigns_missing_ids() {
    let seed = json!({
      "contacts": [ { "id": "c1", "name": "Ada" }, { "name": "Grace" } ],
      "venues": []
    });
    let store = InMemoryStore::from_seed(&seed).unwrap();
    assert_eq!(store.count("contacts"), 2);
    assert!(store.read_one("contacts", "c1").is_some());
    assert!(InMemoryStore::from_seed(&json!([1, 2])).is_err());
  }
}
