#![allow(dead_code)]

use async_trait::async_trait;
use encore::store::{DocumentStore, InMemoryStore, Subscription};
use encore::StoreError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use types::{Document, QueryOptions};

/// Store wrapper that counts calls, holds reads until released, and fails
/// on demand. Gate and failure keys are `"collection/id"` for reads and
/// subscriptions, `"write:collection/id"` for writes and `"collection"` for
/// queries.
#[derive(Default)]
pub struct ScriptedStore {
  pub inner: InMemoryStore,
  gets: AtomicUsize,
  queries: AtomicUsize,
  puts: AtomicUsize,
  patches: AtomicUsize,
  removes: AtomicUsize,
  subscribes: AtomicUsize,
  gates: Mutex<HashMap<String, Arc<Semaphore>>>,
  failures: Mutex<HashMap<String, StoreError>>,
}

impl ScriptedStore {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn seeded(seed: Value) -> Arc<Self> {
    Arc::new(Self {
      inner: InMemoryStore::from_seed(&seed).unwrap(),
      ..Self::default()
    })
  }

  /// Make every matching call wait until [`release`](Self::release).
  pub fn hold(&self, key: &str) {
    self
      .gates
      .lock()
      .insert(key.to_string(), Arc::new(Semaphore::new(0)));
  }

  /// Let one held call through.
  pub fn release(&self, key: &str) {
    if let Some(gate) = self.gates.lock().get(key) {
      gate.add_permits(1);
    }
  }

  /// Stop holding calls; waiting ones go through.
  pub fn open(&self, key: &str) {
    if let Some(gate) = self.gates.lock().remove(key) {
      gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
  }

  /// Fail every matching call with `err` until [`heal`](Self::heal).
  pub fn fail(&self, key: &str, err: StoreError) {
    self.failures.lock().insert(key.to_string(), err);
  }

  pub fn heal(&self, key: &str) {
    self.failures.lock().remove(key);
  }

  pub fn gets(&self) -> usize {
    self.gets.load(Ordering::SeqCst)
  }

  pub fn queries(&self) -> usize {
    self.queries.load(Ordering::SeqCst)
  }

  pub fn puts(&self) -> usize {
    self.puts.load(Ordering::SeqCst)
  }

  pub fn patches(&self) -> usize {
    self.patches.load(Ordering::SeqCst)
  }

  pub fn removes(&self) -> usize {
    self.removes.load(Ordering::SeqCst)
  }

  pub fn subscribes(&self) -> usize {
    self.subscribes.load(Ordering::SeqCst)
  }

  async fn gate(&self, key: &str) -> Result<(), StoreError> {
    let gate = self.gates.lock().get(key).cloned();
    if let Some(gate) = gate {
      if let Ok(permit) = gate.acquire().await {
        permit.forget();
      }
    }
    match self.failures.lock().get(key) {
      Some(err) => Err(err.clone()),
      None => Ok(()),
    }
  }
}

#[async_trait]
impl DocumentStore for ScriptedStore {
  async fn get(&self, collection: &str, id: &str) -> Result<Document, StoreError> {
    self.gets.fetch_add(1, Ordering::SeqCst);
    self.gate(&format!("{}/{}", collection, id)).await?;
    self.inner.get(collection, id).await
  }

  async fn get_many(
    &self,
    collection: &str,
    options: &QueryOptions,
  ) -> Result<Vec<Document>, StoreError> {
    self.queries.fetch_add(1, Ordering::SeqCst);
    self.gate(collection).await?;
    self.inner.get_many(collection, options).await
  }

  async fn put(&self, collection: &str, id: &str, data: Value) -> Result<Document, StoreError> {
    self.puts.fetch_add(1, Ordering::SeqCst);
    self.gate(&format!("write:{}/{}", collection, id)).await?;
    self.inner.put(collection, id, data).await
  }

  async fn patch(
    &self,
    collection: &str,
    id: &str,
    partial: Value,
  ) -> Result<Document, StoreError> {
    self.patches.fetch_add(1, Ordering::SeqCst);
    self.gate(&format!("write:{}/{}", collection, id)).await?;
    self.inner.patch(collection, id, partial).await
  }

  async fn remove(&self, collection: &str, id: &str) -> Result<(), StoreError> {
    self.removes.fetch_add(1, Ordering::SeqCst);
    self.gate(&format!("write:{}/{}", collection, id)).await?;
    self.inner.remove(collection, id).await
  }

  async fn subscribe(&self, collection: &str, id: &str) -> Result<Subscription, StoreError> {
    self.subscribes.fetch_add(1, Ordering::SeqCst);
    self.gate(&format!("{}/{}", collection, id)).await?;
    self.inner.subscribe(collection, id).await
  }

  async fn subscribe_query(
    &self,
    collection: &str,
    options: &QueryOptions,
  ) -> Result<Subscription, StoreError> {
    self.subscribes.fetch_add(1, Ordering::SeqCst);
    self.gate(collection).await?;
    self.inner.subscribe_query(collection, options).await
  }

  fn generate_id(&self, collection: &str) -> String {
    self.inner.generate_id(collection)
  }

  fn now(&self) -> Value {
    self.inner.now()
  }
}

/// Let spawned tasks run until they block.
pub async fn settle() {
  for _ in 0..20 {
    tokio::task::yield_now().await;
  }
}
