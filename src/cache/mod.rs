//! In-memory entity cache
//!
//! Provides the shared cache layer of the data layer with:
//! - Entity, query-result, relation and key/value partitions
//! - Per-collection TTLs with lazy expiry and a periodic sweep
//! - Oldest-first forced eviction above an item ceiling
//! - Hit/miss telemetry per key

pub mod config;
mod entry;
mod key;
mod store;
mod telemetry;

pub use config::{format_duration, parse_duration, CacheConfig, CachePolicy};
pub use entry::{CacheEntry, CacheMiss, Related};
pub use key::{EntityKey, QueryKey, RelationKey};
pub use store::CacheStore;
pub use telemetry::{AccessTelemetry, CacheStats, KeyAccess, TelemetryReport};
