//! Entity fetch orchestration
//!
//! [`EntityFetcher::observe`] returns an [`EntityObserver`]: cache first-look,
//! a one-shot read or a live subscription, relation loading, and a
//! [`FetchSession`] that keeps stale responses out of the observable state.

mod observer;
mod session;

pub use observer::EntityObserver;
pub use session::{FetchSession, Issue, Ticket};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use types::Document;

use crate::cache::{CacheStore, Related};
use crate::error::DataError;
use crate::mutation::MutationCoordinator;
use crate::relations::RelationDescriptor;
use crate::store::DocumentStore;

/// Post-processing applied to every fetched root entity before it is cached
/// and published.
pub type Transform = Arc<dyn Fn(Document) -> Document + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
  /// A single read per id
  #[default]
  OneShot,
  /// A subscription that republishes every remote change
  Live,
}

#[derive(Clone)]
pub struct ObserveOptions {
  pub mode: FetchMode,
  pub relations: Vec<RelationDescriptor>,
  /// Load every non-lazy relation whenever the root entity is published
  pub auto_load_related: bool,
  pub transform: Option<Transform>,
  /// Read and write the shared cache; off, every read goes to the store
  pub cache: bool,
  /// TTL of this observer's cache writes instead of the collection's
  pub cache_ttl: Option<Duration>,
}

impl Default for ObserveOptions {
  fn default() -> Self {
    Self {
      mode: FetchMode::OneShot,
      relations: Vec::new(),
      auto_load_related: true,
      transform: None,
      cache: true,
      cache_ttl: None,
    }
  }
}

impl ObserveOptions {
  pub fn one_shot() -> Self {
    Self::default()
  }

  pub fn live() -> Self {
    Self {
      mode: FetchMode::Live,
      ..Self::default()
    }
  }

  pub fn relation(mut self, descriptor: RelationDescriptor) -> Self {
    self.relations.push(descriptor);
    self
  }

  pub fn auto_load_related(mut self, enabled: bool) -> Self {
    self.auto_load_related = enabled;
    self
  }

  pub fn transform(mut self, f: impl Fn(Document) -> Document + Send + Sync + 'static) -> Self {
    self.transform = Some(Arc::new(f));
    self
  }

  pub fn cache(mut self, enabled: bool) -> Self {
    self.cache = enabled;
    self
  }

  pub fn cache_ttl(mut self, ttl: Duration) -> Self {
    self.cache_ttl = Some(ttl);
    self
  }

  pub fn descriptor(&self, name: &str) -> Option<&RelationDescriptor> {
    self.relations.iter().find(|d| d.name == name)
  }
}

impl std::fmt::Debug for ObserveOptions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ObserveOptions")
      .field("mode", &self.mode)
      .field("relations", &self.relations)
      .field("auto_load_related", &self.auto_load_related)
      .field("transform", &self.transform.is_some())
      .field("cache", &self.cache)
      .field("cache_ttl", &self.cache_ttl)
      .finish()
  }
}

/// Load state of one named relation.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RelatedState {
  #[default]
  Idle,
  Loading,
  Ready(Related),
}

impl RelatedState {
  pub fn is_loading(&self) -> bool {
    matches!(self, RelatedState::Loading)
  }

  pub fn value(&self) -> Option<&Related> {
    match self {
      RelatedState::Ready(related) => Some(related),
      _ => None,
    }
  }
}

/// What an observer publishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityState {
  /// Id currently observed
  pub id: Option<String>,
  pub entity: Option<Document>,
  pub loading: bool,
  pub error: Option<DataError>,
  pub related: HashMap<String, RelatedState>,
}

impl EntityState {
  pub fn is_not_found(&self) -> bool {
    self.error.as_ref().is_some_and(DataError::is_not_found)
  }

  pub fn related(&self, name: &str) -> RelatedState {
    self.related.get(name).cloned().unwrap_or_default()
  }

  /// Whether anything, root or relation, is still loading.
  pub fn is_busy(&self) -> bool {
    self.loading || self.related.values().any(RelatedState::is_loading)
  }
}

/// Builds observers sharing one store, cache and mutation coordinator.
#[derive(Clone)]
pub struct EntityFetcher {
  store: Arc<dyn DocumentStore>,
  cache: Arc<CacheStore>,
  mutations: Option<Arc<MutationCoordinator>>,
  timeout: Option<Duration>,
  coalesce_window: Duration,
}

impl EntityFetcher {
  pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<CacheStore>) -> Self {
    Self {
      store,
      cache,
      mutations: None,
      timeout: None,
      coalesce_window: Duration::from_millis(250),
    }
  }

  /// Bound every read; `None` waits indefinitely.
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_coalesce_window(mut self, window: Duration) -> Self {
    self.coalesce_window = window;
    self
  }

  /// Coordinator used by [`EntityObserver::update`].
  pub fn with_mutations(mut self, mutations: Arc<MutationCoordinator>) -> Self {
    self.mutations = Some(mutations);
    self
  }

  /// Start observing `collection/id`. Must be called inside a Tokio runtime.
  pub fn observe(&self, collection: &str, id: &str, options: ObserveOptions) -> EntityObserver {
    let observer = EntityObserver::new(
      collection,
      options,
      self.store.clone(),
      self.cache.clone(),
      self.mutations.clone(),
      self.timeout,
      self.coalesce_window,
    );
    observer.set_id(id);
    observer
  }
}
