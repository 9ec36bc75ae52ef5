//! Configuration loading and building a data layer from it

use encore::config::DataLayerConfig;
use encore::{DataLayer, EntityKind, InMemoryStore, ObserveOptions, SearchOptions};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn test_defaults() {
  let config = DataLayerConfig::default();
  assert_eq!(config.cache.max_items, 1000);
  assert_eq!(config.cache.cleanup_interval(), Duration::from_secs(900));
  assert_eq!(config.fetch.timeout(), Some(Duration::from_secs(30)));
  assert_eq!(config.fetch.coalesce_window(), Duration::from_millis(250));
  assert_eq!(config.search.debounce(), Duration::from_millis(300));
  assert_eq!(config.search.min_length, 2);
  assert_eq!(config.logging.level, "info");
}

#[test]
fn test_empty_document_uses_defaults() {
  let config = DataLayerConfig::from_yaml("{}").unwrap();
  assert_eq!(config.cache.max_items, 1000);
  assert_eq!(config.search.max_results, 10);
}

#[test]
fn test_partial_sections() {
  let yaml = r#"
cache:
  max_items: 250
  ttls:
    concerts: 30s
fetch:
  timeout: "0"
search:
  debounce: 150ms
  history_size: 3
logging:
  level: debug
"#;

  let config = DataLayerConfig::from_yaml(yaml).unwrap();
  let policy = config.cache.policy();
  assert_eq!(policy.max_items, 250);
  assert_eq!(policy.entity_ttl("concerts"), Duration::from_secs(30));
  // A ttls map replaces the built-in one.
  assert_eq!(policy.entity_ttl("structures"), policy.default_ttl);
  assert_eq!(policy.query_ttl, Duration::from_secs(60));

  assert_eq!(config.fetch.timeout(), None);
  assert_eq!(config.fetch.coalesce_window(), Duration::from_millis(250));
  assert_eq!(config.search.debounce(), Duration::from_millis(150));
  assert_eq!(config.search.history_size, 3);
  assert_eq!(config.search.min_length, 2);
  assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_environment_variables_are_expanded() {
  std::env::set_var("ENCORE_CONFIG_TEST_MAX", "64");
  std::env::set_var("ENCORE_CONFIG_TEST_LEVEL", "trace");
  let yaml = r#"
cache:
  max_items: ${ENCORE_CONFIG_TEST_MAX}
logging:
  level: $ENCORE_CONFIG_TEST_LEVEL
"#;

  let config = DataLayerConfig::from_yaml(yaml).unwrap();
  assert_eq!(config.cache.max_items, 64);
  assert_eq!(config.logging.level, "trace");
}

#[test]
fn test_malformed_yaml_is_an_error() {
  assert!(DataLayerConfig::from_yaml("cache: [unclosed").is_err());
  assert!(DataLayerConfig::from_yaml("cache:\n  max_items: lots").is_err());
}

#[test]
fn test_from_file() {
  let mut file = tempfile::NamedTempFile::new().unwrap();
  writeln!(file, "search:\n  min_length: 3\n  max_results: 5").unwrap();

  let config = DataLayerConfig::from_file(file.path()).unwrap();
  assert_eq!(config.search.min_length, 3);
  assert_eq!(config.search.max_results, 5);

  assert!(DataLayerConfig::from_file("/nonexistent/encore.yaml").is_err());
}

#[test]
fn test_yaml_round_trip_keeps_values() {
  let mut config = DataLayerConfig::default();
  config.cache.max_items = 42;
  config.search.debounce = "1s".into();
  let yaml = serde_yaml::to_string(&config).unwrap();

  let parsed = DataLayerConfig::from_yaml(&yaml).unwrap();
  assert_eq!(parsed.cache.max_items, 42);
  assert_eq!(parsed.search.debounce(), Duration::from_secs(1));
  assert_eq!(parsed.cache.ttls, config.cache.ttls);
}

// =============================================================================
// Data layer
// =============================================================================

fn layer(yaml: &str) -> DataLayer {
  let store = InMemoryStore::from_seed(&json!({
    "venues": [
      { "id": "v1", "name": "La Cigale", "nameLowercase": "la cigale" }
    ]
  }))
  .unwrap();
  DataLayer::new(Arc::new(store), DataLayerConfig::from_yaml(yaml).unwrap())
}

#[tokio::test]
async fn test_layer_shares_one_cache() {
  let layer = layer("cache:\n  max_items: 50");
  assert_eq!(layer.cache().policy().max_items, 50);

  let observer = layer.observe_entity("venues", "v1", ObserveOptions::one_shot());
  let state = observer.settled().await;
  assert_eq!(state.entity.map(|d| d.id), Some("v1".to_string()));
  assert!(layer.cache().contains_entity("venues", "v1"));
  assert_eq!(layer.cache_stats().size, 1);

  layer
    .mutate()
    .update("venues", "v1", json!({ "city": "Paris" }))
    .await
    .unwrap();
  assert!(!layer.cache().contains_entity("venues", "v1"));

  layer.clear_cache();
  assert_eq!(layer.cache_report(5).tracked_keys, 0);
}

#[tokio::test(start_paused = true)]
async fn test_layer_search_uses_configured_section() {
  let layer = layer("search:\n  debounce: 50ms\n  min_length: 1");
  let options = layer.search_options(SearchOptions::remote("venues", EntityKind::Venue));
  assert_eq!(options.debounce, Duration::from_millis(50));
  assert_eq!(options.min_length, 1);

  let search = layer.search(options);
  search.set_term("l");
  let mut rx = search.subscribe();
  let state = rx.wait_for(|s| !s.is_searching()).await.unwrap().clone();
  assert_eq!(state.results.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_starts_and_restarts() {
  let mut layer = layer("cache:\n  cleanup_interval: 10s\n  ttls:\n    venues: 5s");
  layer.start_sweeper();
  layer.start_sweeper();

  let observer = layer.observe_entity("venues", "v1", ObserveOptions::one_shot());
  observer.settled().await;
  assert_eq!(layer.cache().len(), 1);

  tokio::time::sleep(Duration::from_secs(11)).await;
  for _ in 0..10 {
    tokio::task::yield_now().await;
  }
  assert_eq!(layer.cache().len(), 0);
}
