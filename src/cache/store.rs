//! Partitioned, TTL-aware cache store

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use types::Document;

use super::config::{CacheConfig, CachePolicy};
use super::entry::{CacheEntry, CacheMiss, Related};
use super::key::{EntityKey, QueryKey, RelationKey};
use super::telemetry::{AccessTelemetry, CacheStats, TelemetryReport};

/// A relation value and the name of the relation that wrote it, if known.
#[derive(Debug, Clone)]
struct RelationEdge {
  relation: Option<String>,
  related: Related,
}

#[derive(Default)]
struct Partitions {
  entities: HashMap<EntityKey, CacheEntry<Document>>,
  queries: HashMap<QueryKey, CacheEntry<Vec<Document>>>,
  relations: HashMap<RelationKey, CacheEntry<RelationEdge>>,
  values: HashMap<String, CacheEntry<Value>>,
}

impl Partitions {
  fn len(&self) -> usize {
    self.entities.len() + self.queries.len() + self.relations.len() + self.values.len()
  }

  fn clear(&mut self) {
    self.entities.clear();
    self.queries.clear();
    self.relations.clear();
    self.values.clear();
  }

  fn sweep_expired(&mut self, now: Instant) -> usize {
    let before = self.len();
    self.entities.retain(|_, e| !e.is_expired_at(now));
    self.queries.retain(|_, e| !e.is_expired_at(now));
    self.relations.retain(|_, e| !e.is_expired_at(now));
    self.values.retain(|_, e| !e.is_expired_at(now));
    before - self.len()
  }

  /// Remove the `n` oldest entries across every partition.
  fn evict_oldest(&mut self, n: usize) -> usize {
    if n == 0 {
      return 0;
    }

    enum Slot {
      Entity(EntityKey),
      Query(QueryKey),
      Relation(RelationKey),
      Value(String),
    }

    let mut slots: Vec<(Instant, u64, Slot)> = Vec::with_capacity(self.len());
    slots.extend(
      self
        .entities
        .iter()
        .map(|(k, e)| (e.written_at, e.seq, Slot::Entity(k.clone()))),
    );
    slots.extend(
      self
        .queries
        .iter()
        .map(|(k, e)| (e.written_at, e.seq, Slot::Query(k.clone()))),
    );
    slots.extend(
      self
        .relations
        .iter()
        .map(|(k, e)| (e.written_at, e.seq, Slot::Relation(k.clone()))),
    );
    slots.extend(
      self
        .values
        .iter()
        .map(|(k, e)| (e.written_at, e.seq, Slot::Value(k.clone()))),
    );
    slots.sort_unstable_by_key(|(written_at, seq, _)| (*written_at, *seq));

    let mut removed = 0;
    for (_, _, slot) in slots.into_iter().take(n) {
      let hit = match slot {
        Slot::Entity(k) => self.entities.remove(&k).is_some(),
        Slot::Query(k) => self.queries.remove(&k).is_some(),
        Slot::Relation(k) => self.relations.remove(&k).is_some(),
        Slot::Value(k) => self.values.remove(&k).is_some(),
      };
      if hit {
        removed += 1;
      }
    }
    removed
  }
}

type Select<K, T> = fn(&Partitions) -> &HashMap<K, CacheEntry<T>>;
type SelectMut<K, T> = fn(&mut Partitions) -> &mut HashMap<K, CacheEntry<T>>;

/// In-memory cache with entity, query-result, relation and key/value
/// partitions.
///
/// Every operation is synchronous and infallible: lookups return
/// `Err(CacheMiss)` instead of failing, and writes with an empty key are
/// ignored. Values are cloned in and out, so callers never share a cached
/// object.
pub struct CacheStore {
  policy: CachePolicy,
  partitions: RwLock<Partitions>,
  seq: AtomicU64,
  telemetry: AccessTelemetry,
  last_cleanup: Mutex<Instant>,
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new(CachePolicy::default())
  }
}

impl CacheStore {
  pub fn new(policy: CachePolicy) -> Self {
    Self {
      policy,
      partitions: RwLock::new(Partitions::default()),
      seq: AtomicU64::new(0),
      telemetry: AccessTelemetry::new(),
      last_cleanup: Mutex::new(Instant::now()),
    }
  }

  pub fn from_config(config: &CacheConfig) -> Self {
    Self::new(config.policy())
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  pub fn telemetry(&self) -> &AccessTelemetry {
    &self.telemetry
  }

  // =========================================================================
  // Entity partition
  // =========================================================================

  pub fn get_entity(&self, collection: &str, id: &str) -> Result<Document, CacheMiss> {
    let key = EntityKey::new(collection, id).ok_or(CacheMiss::InvalidKey)?;
    self.lookup(&key, "entity", |_| true, |p| &p.entities, |p| &mut p.entities)
  }

  /// Insert or overwrite. Returns `false` for an empty collection or id.
  pub fn set_entity(&self, collection: &str, id: &str, document: Document) -> bool {
    let ttl = self.policy.entity_ttl(collection);
    self.set_entity_with_ttl(collection, id, document, ttl)
  }

  /// [`set_entity`](Self::set_entity) with an explicit TTL instead of the
  /// collection's.
  pub fn set_entity_with_ttl(
    &self,
    collection: &str,
    id: &str,
    document: Document,
    ttl: Duration,
  ) -> bool {
    let Some(key) = EntityKey::new(collection, id) else {
      return false;
    };
    self.insert(key, document, ttl, |p| &mut p.entities);
    true
  }

  /// Whether a fresh entry exists. Does not touch telemetry.
  pub fn contains_entity(&self, collection: &str, id: &str) -> bool {
    let Some(key) = EntityKey::new(collection, id) else {
      return false;
    };
    self
      .partitions
      .read()
      .entities
      .get(&key)
      .is_some_and(|e| !e.is_expired())
  }

  // =========================================================================
  // Query-result partition
  // =========================================================================

  pub fn get_query_result(&self, key: &QueryKey) -> Result<Vec<Document>, CacheMiss> {
    self.lookup(key, "query", |_| true, |p| &p.queries, |p| &mut p.queries)
  }

  pub fn set_query_result(&self, key: &QueryKey, documents: Vec<Document>) {
    self.insert(key.clone(), documents, self.policy.query_ttl, |p| {
      &mut p.queries
    });
  }

  // =========================================================================
  // Relation partition
  // =========================================================================

  pub fn get_relation(&self, key: &RelationKey) -> Result<Related, CacheMiss> {
    self
      .lookup(key, "relation", |_| true, |p| &p.relations, |p| &mut p.relations)
      .map(|edge| edge.related)
  }

  /// Look up an edge on behalf of one named relation. An edge another
  /// relation wrote under the same key is a miss; untagged edges match any
  /// relation.
  pub fn get_relation_for(&self, key: &RelationKey, relation: &str) -> Result<Related, CacheMiss> {
    self
      .lookup(
        key,
        "relation",
        |edge: &RelationEdge| edge.relation.as_deref().map_or(true, |r| r == relation),
        |p| &p.relations,
        |p| &mut p.relations,
      )
      .map(|edge| edge.related)
  }

  pub fn set_relation(&self, key: &RelationKey, related: Related) {
    self.insert_edge(key, None, related);
  }

  /// Store an edge tagged with the relation that resolved it.
  pub fn set_relation_for(&self, key: &RelationKey, relation: &str, related: Related) {
    self.insert_edge(key, Some(relation.to_string()), related);
  }

  fn insert_edge(&self, key: &RelationKey, relation: Option<String>, related: Related) {
    let edge = RelationEdge { relation, related };
    self.insert(key.clone(), edge, self.policy.relation_ttl, |p| {
      &mut p.relations
    });
  }

  // =========================================================================
  // Key/value partition
  // =========================================================================

  pub fn get_value(&self, key: &str) -> Result<Value, CacheMiss> {
    if key.is_empty() {
      return Err(CacheMiss::InvalidKey);
    }
    self.lookup(&key.to_string(), "value", |_| true, |p| &p.values, |p| &mut p.values)
  }

  /// Store an arbitrary JSON value; `ttl` defaults to the configured value TTL.
  pub fn set_value(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
    if key.is_empty() {
      return false;
    }
    let ttl = ttl.unwrap_or(self.policy.value_ttl);
    self.insert(key.to_string(), value, ttl, |p| &mut p.values);
    true
  }

  pub fn remove_value(&self, key: &str) -> bool {
    self.partitions.write().values.remove(key).is_some()
  }

  // =========================================================================
  // Invalidation and eviction
  // =========================================================================

  /// Invalidate cached data for a collection.
  ///
  /// With an id, only that entity is evicted. Without one, every entity of
  /// the collection and every relation edge touching it on either side is
  /// evicted. Query results are cleared in both cases because membership of a
  /// cached list cannot be known without re-running the query.
  ///
  /// Returns the number of entries removed.
  pub fn invalidate(&self, collection: &str, id: Option<&str>) -> usize {
    if collection.is_empty() {
      return 0;
    }
    let mut parts = self.partitions.write();
    let before = parts.len();

    match id {
      Some(id) => {
        if let Some(key) = EntityKey::new(collection, id) {
          parts.entities.remove(&key);
        }
      }
      None => {
        parts.entities.retain(|k, _| k.collection != collection);
        parts.relations.retain(|k, _| !k.touches(collection));
      }
    }
    parts.queries.clear();

    let removed = before - parts.len();
    debug!(collection, id = ?id, removed, "Cache invalidated");
    removed
  }

  /// Evict the relation edges that start at one entity.
  pub fn invalidate_relations_from(&self, collection: &str, id: &str) -> usize {
    let mut parts = self.partitions.write();
    let before = parts.relations.len();
    parts
      .relations
      .retain(|k, _| !(k.source_collection == collection && k.source_id == id));
    before - parts.relations.len()
  }

  /// Evict every expired entry, then force a cleanup if the store is still
  /// above its ceiling. Returns the number of expired entries removed.
  pub fn cleanup(&self) -> usize {
    let now = Instant::now();
    let (expired, remaining) = {
      let mut parts = self.partitions.write();
      let expired = parts.sweep_expired(now);
      (expired, parts.len())
    };
    self.telemetry.record_expired(expired);
    *self.last_cleanup.lock() = now;

    if expired > 0 {
      info!(expired, remaining, "Cache sweep removed expired entries");
    } else {
      debug!(remaining, "Cache sweep found nothing to expire");
    }

    if remaining > self.policy.max_items {
      self.force_cleanup();
    }
    expired
  }

  /// Evict the oldest entries regardless of TTL: a batch of
  /// `max_items * force_cleanup_ratio`, or as many as needed to get back under
  /// the ceiling if that is more.
  pub fn force_cleanup(&self) -> usize {
    let mut parts = self.partitions.write();
    self.force_cleanup_locked(&mut parts)
  }

  fn force_cleanup_locked(&self, parts: &mut Partitions) -> usize {
    let total = parts.len();
    let over = total.saturating_sub(self.policy.max_items);
    let batch = self.policy.force_cleanup_batch().max(over).min(total);
    let removed = parts.evict_oldest(batch);
    self.telemetry.record_evictions(removed);
    info!(
      removed,
      remaining = parts.len(),
      max_items = self.policy.max_items,
      "Forced cache cleanup"
    );
    removed
  }

  /// Drop every entry and reset the counters.
  pub fn clear(&self) {
    self.partitions.write().clear();
    self.telemetry.reset();
    *self.last_cleanup.lock() = Instant::now();
    info!("Cache cleared");
  }

  /// Spawn the periodic [`cleanup`](Self::cleanup) loop. The task stops once
  /// the store is dropped.
  pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let store: Weak<Self> = Arc::downgrade(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match store.upgrade() {
          Some(store) => {
            store.cleanup();
          }
          None => break,
        }
      }
    })
  }

  // =========================================================================
  // Diagnostics
  // =========================================================================

  pub fn len(&self) -> usize {
    self.partitions.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    let parts = self.partitions.read();
    CacheStats {
      hits: self.telemetry.hits(),
      misses: self.telemetry.misses(),
      hit_rate: self.telemetry.hit_rate(),
      size: parts.len(),
      entities: parts.entities.len(),
      queries: parts.queries.len(),
      relations: parts.relations.len(),
      values: parts.values.len(),
      evictions: self.telemetry.evictions(),
      expired: self.telemetry.expired(),
      last_cleanup_age_seconds: self.last_cleanup.lock().elapsed().as_secs(),
    }
  }

  pub fn report(&self, top_n: usize) -> TelemetryReport {
    self.telemetry.report(top_n)
  }

  // =========================================================================
  // Internals
  // =========================================================================

  /// A fresh entry that `accept` rejects counts as absent and is left in
  /// place.
  fn lookup<K, T>(
    &self,
    key: &K,
    label: &str,
    accept: impl Fn(&T) -> bool,
    select: Select<K, T>,
    select_mut: SelectMut<K, T>,
  ) -> Result<T, CacheMiss>
  where
    K: Hash + Eq + Display,
    T: Clone,
  {
    let now = Instant::now();
    let state = {
      let parts = self.partitions.read();
      match select(&parts).get(key) {
        None => Err(CacheMiss::Absent),
        Some(entry) if entry.is_expired_at(now) => Err(CacheMiss::Expired),
        Some(entry) if !accept(&entry.value) => Err(CacheMiss::Absent),
        Some(entry) => Ok(entry.value.clone()),
      }
    };

    match state {
      Ok(value) => {
        self.telemetry.record_hit(&format_args!("{}:{}", label, key));
        debug!(kind = label, key = %key, "Cache hit");
        Ok(value)
      }
      Err(miss) => {
        if miss == CacheMiss::Expired {
          let mut parts = self.partitions.write();
          let map = select_mut(&mut parts);
          if map.get(key).is_some_and(|e| e.is_expired_at(now)) {
            map.remove(key);
            self.telemetry.record_expired(1);
          }
        }
        self.telemetry.record_miss(&format_args!("{}:{}", label, key));
        debug!(kind = label, key = %key, reason = %miss, "Cache miss");
        Err(miss)
      }
    }
  }

  fn insert<K, T>(&self, key: K, value: T, ttl: Duration, select_mut: SelectMut<K, T>)
  where
    K: Hash + Eq,
  {
    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
    let mut parts = self.partitions.write();
    select_mut(&mut parts).insert(key, CacheEntry::new(value, ttl, seq));
    if parts.len() > self.policy.max_items {
      self.force_cleanup_locked(&mut parts);
    }
  }
}
