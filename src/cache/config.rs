//! Cache configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Cache configuration as read from YAML.
///
/// Durations are strings (`"90s"`, `"5m"`, `"1500ms"`, `"2h"`, or bare
/// seconds) and are resolved once into a [`CachePolicy`] when the cache is
/// built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  /// Entity TTL for collections without an entry in `ttls`
  #[serde(default = "default_ttl")]
  pub default_ttl: String,

  /// Per-collection entity TTLs
  #[serde(default = "default_collection_ttls")]
  pub ttls: HashMap<String, String>,

  /// TTL for cached query results; shorter than entity TTLs
  #[serde(default = "default_query_ttl")]
  pub query_ttl: String,

  /// TTL for resolved relation edges
  #[serde(default = "default_relation_ttl")]
  pub relation_ttl: String,

  /// Default TTL for the generic key/value partition
  #[serde(default = "default_value_ttl")]
  pub value_ttl: String,

  /// Total entries across all partitions before a forced cleanup
  #[serde(default = "default_max_items")]
  pub max_items: usize,

  /// Interval of the periodic expiry sweep
  #[serde(default = "default_cleanup_interval")]
  pub cleanup_interval: String,

  /// Share of `max_items` removed by a forced cleanup
  #[serde(default = "default_force_cleanup_ratio")]
  pub force_cleanup_ratio: f64,
}

fn default_ttl() -> String {
  "2m".to_string()
}

fn default_collection_ttls() -> HashMap<String, String> {
  [
    ("concerts", "1m"),
    ("form_submissions", "30s"),
    ("venues", "5m"),
    ("contacts", "5m"),
    ("artists", "5m"),
    ("structures", "10m"),
    ("settings", "30m"),
    ("templates", "30m"),
  ]
  .into_iter()
  .map(|(k, v)| (k.to_string(), v.to_string()))
  .collect()
}

fn default_query_ttl() -> String {
  "1m".to_string()
}

fn default_relation_ttl() -> String {
  "2m".to_string()
}

fn default_value_ttl() -> String {
  "2m".to_string()
}

fn default_max_items() -> usize {
  1000
}

fn default_cleanup_interval() -> String {
  "15m".to_string()
}

fn default_force_cleanup_ratio() -> f64 {
  0.2
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl: default_ttl(),
      ttls: default_collection_ttls(),
      query_ttl: default_query_ttl(),
      relation_ttl: default_relation_ttl(),
      value_ttl: default_value_ttl(),
      max_items: default_max_items(),
      cleanup_interval: default_cleanup_interval(),
      force_cleanup_ratio: default_force_cleanup_ratio(),
    }
  }
}

impl CacheConfig {
  /// Override the TTL of one collection.
  pub fn with_ttl(mut self, collection: &str, ttl: Duration) -> Self {
    self
      .ttls
      .insert(collection.to_string(), format!("{}ms", ttl.as_millis()));
    self
  }

  pub fn with_max_items(mut self, max_items: usize) -> Self {
    self.max_items = max_items;
    self
  }

  pub fn cleanup_interval(&self) -> Duration {
    parse_duration(&self.cleanup_interval).unwrap_or(Duration::from_secs(900))
  }

  /// Resolve every duration string. Unparseable values fall back to the
  /// built-in defaults.
  pub fn policy(&self) -> CachePolicy {
    let fallback = |s: &str, default: Duration| parse_duration(s).unwrap_or(default);
    let default_ttl = fallback(&self.default_ttl, Duration::from_secs(120));
    CachePolicy {
      default_ttl,
      collection_ttls: self
        .ttls
        .iter()
        .map(|(k, v)| (k.clone(), fallback(v, default_ttl)))
        .collect(),
      query_ttl: fallback(&self.query_ttl, Duration::from_secs(60)),
      relation_ttl: fallback(&self.relation_ttl, Duration::from_secs(120)),
      value_ttl: fallback(&self.value_ttl, Duration::from_secs(120)),
      max_items: self.max_items.max(1),
      force_cleanup_ratio: self.force_cleanup_ratio.clamp(0.01, 1.0),
    }
  }
}

/// [`CacheConfig`] with every duration resolved.
#[derive(Debug, Clone)]
pub struct CachePolicy {
  pub default_ttl: Duration,
  pub collection_ttls: HashMap<String, Duration>,
  pub query_ttl: Duration,
  pub relation_ttl: Duration,
  pub value_ttl: Duration,
  pub max_items: usize,
  pub force_cleanup_ratio: f64,
}

impl CachePolicy {
  pub fn entity_ttl(&self, collection: &str) -> Duration {
    self
      .collection_ttls
      .get(collection)
      .copied()
      .unwrap_or(self.default_ttl)
  }

  /// How many entries a forced cleanup removes.
  pub fn force_cleanup_batch(&self) -> usize {
    ((self.max_items as f64) * self.force_cleanup_ratio).ceil() as usize
  }
}

impl Default for CachePolicy {
  fn default() -> Self {
    CacheConfig::default().policy()
  }
}

/// Parse a duration string.
/// Supports: ms, s, m, h (case insensitive); a bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
  let s = s.trim().to_lowercase();

  if let Some(n) = s.strip_suffix("ms") {
    n.trim().parse::<u64>().ok().map(Duration::from_millis)
  } else if let Some(n) = s.strip_suffix('h') {
    n.trim().parse::<u64>().ok().map(|n| Duration::from_secs(n * 3600))
  } else if let Some(n) = s.strip_suffix('m') {
    n.trim().parse::<u64>().ok().map(|n| Duration::from_secs(n * 60))
  } else if let Some(n) = s.strip_suffix('s') {
    n.trim().parse::<u64>().ok().map(Duration::from_secs)
  } else {
    s.parse::<u64>().ok().map(Duration::from_secs)
  }
}

/// Format a duration in the largest whole unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
  let ms = d.as_millis();
  if ms == 0 {
    "0s".to_string()
  } else if ms % 3_600_000 == 0 {
    format!("{}h", ms / 3_600_000)
  } else if ms % 60_000 == 0 {
    format!("{}m", ms / 60_000)
  } else if ms % 1000 == 0 {
    format!("{}s", ms / 1000)
  } else {
    format!("{}ms", ms)
  }
}
