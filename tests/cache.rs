mod common;

use common::{settle, ScriptedStore};
use encore::cache::{CacheConfig, CacheMiss, CacheStore, QueryKey, RelationKey, Related};
use encore::{EntityFetcher, ObserveOptions};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use types::{Document, FieldFilter, OrderDirection, QueryOptions};

fn contact(id: &str, name: &str) -> Document {
  Document::new("contacts", id, json!({ "name": name }))
}

fn minutes(n: u64) -> Duration {
  Duration::from_secs(n * 60)
}

// =============================================================================
// Entity partition
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_entity_read_back_until_ttl() {
  let cache = CacheStore::default();
  let doc = contact("c1", "Ada");
  assert!(cache.set_entity("contacts", "c1", doc.clone()));
  assert_eq!(cache.get_entity("contacts", "c1"), Ok(doc.clone()));

  tokio::time::advance(minutes(4)).await;
  assert_eq!(cache.get_entity("contacts", "c1"), Ok(doc));

  tokio::time::advance(minutes(2)).await;
  assert_eq!(cache.get_entity("contacts", "c1"), Err(CacheMiss::Expired));
  // The expired entry was evicted by the lookup.
  assert_eq!(cache.get_entity("contacts", "c1"), Err(CacheMiss::Absent));

  let stats = cache.stats();
  assert_eq!(stats.hits, 2);
  assert_eq!(stats.misses, 2);
  assert_eq!(stats.expired, 1);
  assert_eq!(stats.size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_collection_ttls_differ() {
  let cache = CacheStore::default();
  cache.set_entity("concerts", "k1", Document::new("concerts", "k1", json!({})));
  cache.set_entity("structures", "s1", Document::new("structures", "s1", json!({})));
  cache.set_entity("unknown", "u1", Document::new("unknown", "u1", json!({})));

  tokio::time::advance(Duration::from_secs(61)).await;
  assert!(!cache.contains_entity("concerts", "k1"));
  assert!(cache.contains_entity("structures", "s1"));
  assert!(cache.contains_entity("unknown", "u1"));

  tokio::time::advance(Duration::from_secs(60)).await;
  assert!(!cache.contains_entity("unknown", "u1"));
  assert!(cache.contains_entity("structures", "s1"));
}

#[tokio::test(start_paused = true)]
async fn test_expired_contact_is_fetched_again() {
  let store = ScriptedStore::seeded(json!({
    "contacts": [{ "id": "c1", "name": "Ada" }]
  }));
  let cache = Arc::new(CacheStore::default());
  let fetcher = EntityFetcher::new(store.clone(), cache.clone());

  let first = fetcher.observe("contacts", "c1", ObserveOptions::one_shot());
  first.settled().await;
  assert_eq!(store.gets(), 1);
  drop(first);

  tokio::time::advance(minutes(4)).await;
  let second = fetcher.observe("contacts", "c1", ObserveOptions::one_shot());
  settle().await;
  assert_eq!(second.entity().map(|d| d.id), Some("c1".to_string()));
  assert_eq!(store.gets(), 1);
  drop(second);

  tokio::time::advance(minutes(2)).await;
  let third = fetcher.observe("contacts", "c1", ObserveOptions::one_shot());
  let state = third.settled().await;
  assert_eq!(state.entity.map(|d| d.id), Some("c1".to_string()));
  assert_eq!(store.gets(), 2);
}

#[test]
fn test_cached_values_are_copies() {
  let cache = CacheStore::default();
  let mut doc = contact("c1", "Ada");
  cache.set_entity("contacts", "c1", doc.clone());
  doc.data["name"] = json!("Changed");
  assert_eq!(
    cache.get_entity("contacts", "c1").unwrap().data["name"],
    json!("Ada")
  );
}

// =============================================================================
// Query and relation partitions
// =============================================================================

#[test]
fn test_query_key_ignores_filter_order() {
  let a = QueryOptions::new()
    .filter(FieldFilter::eq("city", "Lyon"))
    .filter(FieldFilter::gte("capacity", 500))
    .order_by("name", OrderDirection::Asc);
  let b = QueryOptions::new()
    .filter(FieldFilter::gte("capacity", 500))
    .filter(FieldFilter::eq("city", "Lyon"))
    .order_by("name", OrderDirection::Asc);
  assert_eq!(
    QueryKey::new("venues", &a, &["name", "city"]),
    QueryKey::new("venues", &b, &["city", "name"])
  );
  assert_ne!(
    QueryKey::new("venues", &a, &[]),
    QueryKey::new("venues", &a.clone().limit(5), &[])
  );
}

#[test]
fn test_invalidate_entity_clears_queries() {
  let cache = CacheStore::default();
  cache.set_entity("contacts", "c1", contact("c1", "Ada"));
  cache.set_entity("contacts", "c2", contact("c2", "Bob"));
  let key = QueryKey::new("contacts", &QueryOptions::new(), &[]).unwrap();
  cache.set_query_result(&key, vec![contact("c1", "Ada")]);
  let other = QueryKey::new("venues", &QueryOptions::new(), &[]).unwrap();
  cache.set_query_result(&other, vec![]);

  cache.invalidate("contacts", Some("c1"));

  assert!(cache.get_entity("contacts", "c1").is_err());
  assert!(cache.get_query_result(&key).is_err());
  assert!(cache.get_query_result(&other).is_err());
  assert!(cache.get_entity("contacts", "c2").is_ok());
}

#[test]
fn test_invalidate_collection() {
  let cache = CacheStore::default();
  cache.set_entity("contacts", "c1", contact("c1", "Ada"));
  cache.set_entity("venues", "v1", Document::new("venues", "v1", json!({})));
  let edge = RelationKey::new("venues", "v1", "contacts").unwrap();
  cache.set_relation(&edge, Related::Many(vec![contact("c1", "Ada")]));

  let removed = cache.invalidate("contacts", None);
  assert_eq!(removed, 2);
  assert!(cache.get_relation(&edge).is_err());
  assert!(cache.contains_entity("venues", "v1"));
}

#[test]
fn test_invalidate_relations_from_one_source() {
  let cache = CacheStore::default();
  let from_c1 = RelationKey::new("contacts", "c1", "structures").unwrap();
  let from_c2 = RelationKey::new("contacts", "c2", "structures").unwrap();
  cache.set_relation(&from_c1, Related::One(None));
  cache.set_relation(&from_c2, Related::One(None));

  assert_eq!(cache.invalidate_relations_from("contacts", "c1"), 1);
  assert!(cache.get_relation(&from_c1).is_err());
  assert_eq!(cache.get_relation(&from_c2), Ok(Related::One(None)));
}

// =============================================================================
// Key/value partition
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_values_use_their_own_ttl() {
  let cache = CacheStore::default();
  assert!(cache.set_value("settings:theme", json!("dark"), Some(Duration::from_secs(10))));
  assert!(cache.set_value("settings:lang", json!("fr"), None));

  tokio::time::advance(Duration::from_secs(11)).await;
  assert_eq!(cache.get_value("settings:theme"), Err(CacheMiss::Expired));
  assert_eq!(cache.get_value("settings:lang"), Ok(json!("fr")));

  assert!(cache.remove_value("settings:lang"));
  assert!(!cache.remove_value("settings:lang"));
}

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_ceiling_keeps_newest_entries() {
  let cache = CacheStore::from_config(&CacheConfig::default().with_max_items(20));
  for i in 0..50 {
    cache.set_entity("contacts", &format!("c{}", i), contact(&format!("c{}", i), "x"));
    tokio::time::advance(Duration::from_millis(10)).await;
    assert!(cache.len() <= 20);
  }
  assert!(cache.contains_entity("contacts", "c49"));
  assert!(cache.contains_entity("contacts", "c48"));
  assert!(!cache.contains_entity("contacts", "c0"));
  assert!(cache.stats().evictions >= 30);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_sweeps_expired() {
  let cache = CacheStore::default();
  cache.set_entity("concerts", "k1", Document::new("concerts", "k1", json!({})));
  cache.set_entity("settings", "s1", Document::new("settings", "s1", json!({})));

  tokio::time::advance(minutes(2)).await;
  assert_eq!(cache.cleanup(), 1);
  assert_eq!(cache.len(), 1);
  let stats = cache.stats();
  assert_eq!(stats.expired, 1);
  assert_eq!(stats.last_cleanup_age_seconds, 0);

  tokio::time::advance(Duration::from_secs(30)).await;
  assert_eq!(cache.stats().last_cleanup_age_seconds, 30);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_runs_periodically() {
  let cache = Arc::new(CacheStore::default());
  cache.set_entity("concerts", "k1", Document::new("concerts", "k1", json!({})));
  let handle = cache.spawn_sweeper(Duration::from_secs(90));
  settle().await;
  assert_eq!(cache.len(), 1);

  tokio::time::sleep(Duration::from_secs(91)).await;
  settle().await;
  assert_eq!(cache.len(), 0);
  handle.abort();
}

// =============================================================================
// Telemetry
// =============================================================================

#[test]
fn test_report_lists_hottest_keys() {
  let cache = CacheStore::default();
  cache.set_entity("contacts", "c1", contact("c1", "Ada"));
  for _ in 0..3 {
    let _ = cache.get_entity("contacts", "c1");
  }
  let _ = cache.get_entity("contacts", "c2");

  let report = cache.report(1);
  assert_eq!(report.hits, 3);
  assert_eq!(report.misses, 1);
  assert_eq!(report.tracked_keys, 2);
  assert_eq!(report.hottest.len(), 1);
  assert_eq!(report.hottest[0].key, "entity:contacts/c1");

  let access = cache.telemetry().key("entity:contacts/c2").unwrap();
  assert_eq!((access.hits, access.misses), (0, 1));
  assert_eq!(cache.stats().hit_rate_percent(), "75%");

  cache.clear();
  let stats = cache.stats();
  assert_eq!((stats.hits, stats.misses, stats.size), (0, 0, 0));
}
