//! Access telemetry: global and per-key hit/miss counters

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-key counters stop accepting new keys past this many entries; global
/// counters keep counting.
const MAX_TRACKED_KEYS: usize = 10_000;

/// Snapshot of cache counters, as exposed to diagnostics surfaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  /// `hits / (hits + misses)`, 0 when nothing was looked up
  pub hit_rate: f64,
  /// Total entries across all partitions
  pub size: usize,
  pub entities: usize,
  pub queries: usize,
  pub relations: usize,
  pub values: usize,
  pub evictions: u64,
  pub expired: u64,
  pub last_cleanup_age_seconds: u64,
}

impl CacheStats {
  pub fn hit_rate_percent(&self) -> String {
    format!("{}%", (self.hit_rate * 100.0).round() as u64)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAccess {
  pub key: String,
  pub hits: u64,
  pub misses: u64,
}

impl KeyAccess {
  pub fn total(&self) -> u64 {
    self.hits + self.misses
  }
}

/// Diagnostic view of the hottest keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryReport {
  pub hits: u64,
  pub misses: u64,
  pub hit_rate: f64,
  pub tracked_keys: usize,
  pub hottest: Vec<KeyAccess>,
}

#[derive(Default)]
pub struct AccessTelemetry {
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
  expired: AtomicU64,
  per_key: Mutex<HashMap<String, (u64, u64)>>,
}

impl AccessTelemetry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_hit(&self, key: &dyn std::fmt::Display) {
    self.hits.fetch_add(1, Ordering::Relaxed);
    self.bump(key, true);
  }

  pub fn record_miss(&self, key: &dyn std::fmt::Display) {
    self.misses.fetch_add(1, Ordering::Relaxed);
    self.bump(key, false);
  }

  pub fn record_evictions(&self, n: usize) {
    self.evictions.fetch_add(n as u64, Ordering::Relaxed);
  }

  pub fn record_expired(&self, n: usize) {
    self.expired.fetch_add(n as u64, Ordering::Relaxed);
  }

  fn bump(&self, key: &dyn std::fmt::Display, hit: bool) {
    let key = key.to_string();
    let mut per_key = self.per_key.lock();
    if !per_key.contains_key(&key) && per_key.len() >= MAX_TRACKED_KEYS {
      return;
    }
    let counters = per_key.entry(key).or_default();
    if hit {
      counters.0 += 1;
    } else {
      counters.1 += 1;
    }
  }

  pub fn hits(&self) -> u64 {
    self.hits.load(Ordering::Relaxed)
  }

  pub fn misses(&self) -> u64 {
    self.misses.load(Ordering::Relaxed)
  }

  pub fn evictions(&self) -> u64 {
    self.evictions.load(Ordering::Relaxed)
  }

  pub fn expired(&self) -> u64 {
    self.expired.load(Ordering::Relaxed)
  }

  pub fn hit_rate(&self) -> f64 {
    let hits = self.hits();
    let total = hits + self.misses();
    if total == 0 {
      0.0
    } else {
      hits as f64 / total as f64
    }
  }

  /// Counters for one key, if it has been looked up.
  pub fn key(&self, key: &str) -> Option<KeyAccess> {
    self.per_key.lock().get(key).map(|(hits, misses)| KeyAccess {
      key: key.to_string(),
      hits: *hits,
      misses: *misses,
    })
  }

  /// The `top_n` most accessed keys, busiest first.
  pub fn report(&self, top_n: usize) -> TelemetryReport {
    let per_key = self.per_key.lock();
    let mut hottest: Vec<KeyAccess> = per_key
      .iter()
      .map(|(key, (hits, misses))| KeyAccess {
        key: key.clone(),
        hits: *hits,
        misses: *misses,
      })
      .collect();
    hottest.sort_by(|a, b| b.total().cmp(&a.total()).then_with(|| a.key.cmp(&b.key)));
    hottest.truncate(top_n);

    TelemetryReport {
      hits: self.hits(),
      misses: self.misses(),
      hit_rate: self.hit_rate(),
      tracked_keys: per_key.len(),
      hottest,
    }
  }

  pub fn reset(&self) {
    self.hits.store(0, Ordering::Relaxed);
    self.misses.store(0, Ordering::Relaxed);
    self.evictions.store(0, Ordering::Relaxed);
    self.expired.store(0, Ordering::Relaxed);
    self.per_key.lock().clear();
  }
}
