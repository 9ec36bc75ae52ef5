//! Cache entry types

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use types::Document;

/// A cached value with its write time and time-to-live.
///
/// `seq` is a store-wide write counter; it orders entries written at the same
/// instant so that eviction can still prefer the most recent writes.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub value: T,
  pub written_at: Instant,
  pub ttl: Duration,
  pub seq: u64,
}

impl<T> CacheEntry<T> {
  pub fn new(value: T, ttl: Duration, seq: u64) -> Self {
    Self {
      value,
      written_at: Instant::now(),
      ttl,
      seq,
    }
  }

  /// Expired once strictly more than `ttl` has elapsed since the write.
  pub fn is_expired_at(&self, now: Instant) -> bool {
    now.saturating_duration_since(self.written_at) > self.ttl
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Instant::now())
  }

  pub fn age(&self) -> Duration {
    Instant::now().saturating_duration_since(self.written_at)
  }

  pub fn ttl_remaining(&self) -> Option<Duration> {
    self.ttl.checked_sub(self.age())
  }
}

/// Why a cache lookup produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMiss {
  /// Never cached, or evicted
  Absent,
  /// Present but older than its TTL; evicted by this lookup
  Expired,
  /// Empty collection, id or key; nothing was looked up
  InvalidKey,
}

impl std::fmt::Display for CacheMiss {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheMiss::Absent => write!(f, "absent"),
      CacheMiss::Expired => write!(f, "expired"),
      CacheMiss::InvalidKey => write!(f, "invalid key"),
    }
  }
}

impl std::error::Error for CacheMiss {}

/// The resolved value of one relation edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Related {
  /// One-to-one; `None` when the foreign key is empty or the target is gone
  One(Option<Document>),
  /// One-to-many or inverse; only targets that exist remotely
  Many(Vec<Document>),
  /// Output of a custom resolver
  Opaque(Value),
}

impl Related {
  /// The empty value for a relation of this shape.
  pub fn empty_like(&self) -> Related {
    match self {
      Related::One(_) => Related::One(None),
      Related::Many(_) => Related::Many(Vec::new()),
      Related::Opaque(_) => Related::Opaque(Value::Null),
    }
  }

  pub fn is_empty(&self) -> bool {
    match self {
      Related::One(doc) => doc.is_none(),
      Related::Many(docs) => docs.is_empty(),
      Related::Opaque(v) => v.is_null(),
    }
  }

  pub fn as_one(&self) -> Option<&Document> {
    match self {
      Related::One(doc) => doc.as_ref(),
      _ => None,
    }
  }

  pub fn as_many(&self) -> &[Document] {
    match self {
      Related::Many(docs) => docs,
      _ => &[],
    }
  }

  /// Every document carried by this value.
  pub fn documents(&self) -> Vec<&Document> {
    match self {
      Related::One(doc) => doc.iter().collect(),
      Related::Many(docs) => docs.iter().collect(),
      Related::Opaque(_) => Vec::new(),
    }
  }
}
