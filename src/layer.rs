//! Composition root: one store, one cache, and everything built on them

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{CacheStats, CacheStore, TelemetryReport};
use crate::config::DataLayerConfig;
use crate::fetch::{EntityFetcher, EntityObserver, ObserveOptions};
use crate::mutation::MutationCoordinator;
use crate::relations::RelatedEntityLoader;
use crate::search::{SearchController, SearchOptions};
use crate::store::DocumentStore;

/// The data layer as consumed by views, forms and tables.
///
/// Owns the process-wide [`CacheStore`] and hands the same instance to every
/// observer, loader and search box it builds.
pub struct DataLayer {
  config: DataLayerConfig,
  store: Arc<dyn DocumentStore>,
  cache: Arc<CacheStore>,
  mutations: Arc<MutationCoordinator>,
  fetcher: EntityFetcher,
  sweeper: Option<JoinHandle<()>>,
}

impl DataLayer {
  pub fn new(store: Arc<dyn DocumentStore>, config: DataLayerConfig) -> Self {
    let cache = Arc::new(CacheStore::from_config(&config.cache));
    Self::with_cache(store, cache, config)
  }

  /// Build on an existing cache, for sharing one cache between layers.
  pub fn with_cache(
    store: Arc<dyn DocumentStore>,
    cache: Arc<CacheStore>,
    config: DataLayerConfig,
  ) -> Self {
    let timeout = config.fetch.timeout();
    let mutations = Arc::new(
      MutationCoordinator::new(store.clone(), cache.clone()).with_timeout(timeout),
    );
    let fetcher = EntityFetcher::new(store.clone(), cache.clone())
      .with_timeout(timeout)
      .with_coalesce_window(config.fetch.coalesce_window())
      .with_mutations(mutations.clone());

    Self {
      config,
      store,
      cache,
      mutations,
      fetcher,
      sweeper: None,
    }
  }

  /// Start the periodic cache sweep. Requires a Tokio runtime; calling it
  /// twice restarts the sweep.
  pub fn start_sweeper(&mut self) {
    if let Some(handle) = self.sweeper.take() {
      handle.abort();
    }
    let interval = self.config.cache.cleanup_interval();
    info!(interval = ?interval, "Starting cache sweeper");
    self.sweeper = Some(self.cache.spawn_sweeper(interval));
  }

  pub fn config(&self) -> &DataLayerConfig {
    &self.config
  }

  pub fn store(&self) -> &Arc<dyn DocumentStore> {
    &self.store
  }

  pub fn cache(&self) -> &Arc<CacheStore> {
    &self.cache
  }

  pub fn fetcher(&self) -> &EntityFetcher {
    &self.fetcher
  }

  /// Observe one entity. Requires a Tokio runtime.
  pub fn observe_entity(&self, collection: &str, id: &str, options: ObserveOptions) -> EntityObserver {
    self.fetcher.observe(collection, id, options)
  }

  pub fn mutate(&self) -> &Arc<MutationCoordinator> {
    &self.mutations
  }

  /// A search box over `options.collection`.
  pub fn search(&self, options: SearchOptions) -> SearchController {
    SearchController::new(
      options,
      self.store.clone(),
      self.cache.clone(),
      self.mutations.clone(),
    )
    .with_timeout(self.config.fetch.timeout())
  }

  /// Apply the configured search section to `options`.
  pub fn search_options(&self, options: SearchOptions) -> SearchOptions {
    options.with_config(&self.config.search)
  }

  /// A standalone relation loader sharing this layer's cache.
  pub fn loader(&self) -> RelatedEntityLoader {
    RelatedEntityLoader::new(self.store.clone(), self.cache.clone())
      .with_coalesce_window(self.config.fetch.coalesce_window())
      .with_timeout(self.config.fetch.timeout())
  }

  pub fn cache_stats(&self) -> CacheStats {
    self.cache.stats()
  }

  pub fn cache_report(&self, top_n: usize) -> TelemetryReport {
    self.cache.report(top_n)
  }

  pub fn clear_cache(&self) {
    self.cache.clear();
  }
}

impl Drop for DataLayer {
  fn drop(&mut self) {
    if let Some(handle) = self.sweeper.take() {
      handle.abort();
    }
  }
}
