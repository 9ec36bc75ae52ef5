//! Search session state machine

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use types::{Document, FieldFilter, OrderDirection, QueryOptions};

use super::{rank, SearchMode, SearchOptions, SearchPhase, SearchState};
use crate::cache::{CacheStore, QueryKey};
use crate::error::{DataError, DataResult, Operation};
use crate::mutation::MutationCoordinator;
use crate::store::{bounded, DocumentStore};

/// Upper bound of a remote prefix range.
const PREFIX_END: char = '\u{f8ff}';

/// The debounce timer or running search, if any. Bumping `generation`
/// revokes its right to commit.
#[derive(Default)]
struct Pending {
  generation: u64,
  task: Option<JoinHandle<()>>,
  torn_down: bool,
}

impl Pending {
  fn supersede(&mut self) -> u64 {
    self.generation += 1;
    if let Some(task) = self.task.take() {
      task.abort();
    }
    self.generation
  }
}

struct Inner {
  options: SearchOptions,
  store: Arc<dyn DocumentStore>,
  cache: Arc<CacheStore>,
  mutations: Arc<MutationCoordinator>,
  timeout: Option<Duration>,
  snapshot: RwLock<Vec<Document>>,
  state: watch::Sender<SearchState>,
  pending: Mutex<Pending>,
}

/// Debounced, cancellable search over one collection.
///
/// Idle → Debouncing → Searching → Idle. Every [`set_term`](Self::set_term)
/// restarts the debounce and supersedes any search already running; only the
/// latest search commits its results.
pub struct SearchController {
  inner: Arc<Inner>,
}

impl SearchController {
  pub fn new(
    options: SearchOptions,
    store: Arc<dyn DocumentStore>,
    cache: Arc<CacheStore>,
    mutations: Arc<MutationCoordinator>,
  ) -> Self {
    let (state, _) = watch::channel(SearchState::default());
    Self {
      inner: Arc::new(Inner {
        options,
        store,
        cache,
        mutations,
        timeout: None,
        snapshot: RwLock::new(Vec::new()),
        state,
        pending: Mutex::new(Pending::default()),
      }),
    }
  }

  /// Bound each remote query. Must be called before the controller is shared.
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    if let Some(inner) = Arc::get_mut(&mut self.inner) {
      inner.timeout = timeout;
    }
    self
  }

  pub fn options(&self) -> &SearchOptions {
    &self.inner.options
  }

  pub fn state(&self) -> SearchState {
    self.inner.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<SearchState> {
    self.inner.state.subscribe()
  }

  pub fn term(&self) -> String {
    self.inner.state.borrow().term.clone()
  }

  pub fn results(&self) -> Vec<Document> {
    self.inner.state.borrow().results.clone()
  }

  pub fn is_searching(&self) -> bool {
    self.inner.state.borrow().is_searching()
  }

  pub fn selected(&self) -> Option<Document> {
    self.inner.state.borrow().selected.clone()
  }

  /// Replace the snapshot searched in local mode.
  pub fn set_snapshot(&self, documents: Vec<Document>) {
    *self.inner.snapshot.write() = documents;
  }

  /// Load the local snapshot from the store, scoped to the tenant if one is
  /// configured. Returns the number of documents loaded.
  pub async fn load_snapshot(&self) -> DataResult<usize> {
    let inner = &self.inner;
    let options = inner.scoped(QueryOptions::new());
    let documents = bounded(
      inner.timeout,
      Operation::Query,
      &inner.options.collection,
      "*",
      inner.store.get_many(&inner.options.collection, &options),
    )
    .await?;
    let count = documents.len();
    self.set_snapshot(documents);
    Ok(count)
  }

  /// Update the term. Terms shorter than the minimum length clear the
  /// results without searching.
  pub fn set_term(&self, term: &str) {
    let inner = &self.inner;
    let mut pending = inner.pending.lock();
    if pending.torn_down {
      return;
    }
    let generation = pending.supersede();

    if term.trim().chars().count() < inner.options.min_length {
      inner.state.send_modify(|s| {
        s.term = term.to_string();
        s.results.clear();
        s.phase = SearchPhase::Idle;
        s.error = None;
      });
      return;
    }

    inner.state.send_modify(|s| {
      s.term = term.to_string();
      s.phase = SearchPhase::Debouncing;
    });

    let task_inner = inner.clone();
    let term = term.to_string();
    pending.task = Some(tokio::spawn(async move {
      tokio::time::sleep(task_inner.options.debounce).await;
      task_inner.run(generation, term).await;
    }));
  }

  /// Pick a result. Pending searches are cancelled and the result list
  /// cleared.
  pub fn select(&self, document: Document) {
    let inner = &self.inner;
    let mut pending = inner.pending.lock();
    pending.supersede();
    inner.state.send_modify(|s| {
      s.selected = Some(document);
      s.results.clear();
      s.phase = SearchPhase::Idle;
    });
  }

  pub fn clear_selection(&self) {
    self.inner.state.send_modify(|s| s.selected = None);
  }

  /// Create an entity from the current term plus the kind's default fields
  /// and `extra` (which wins on conflicts), then select it.
  pub async fn create_from_term(&self, extra: Value) -> DataResult<Document> {
    let inner = &self.inner;
    if !inner.options.allow_create {
      return Err(DataError::Validation(format!(
        "creating {} from search is not allowed",
        inner.options.collection
      )));
    }
    let term = self.term().trim().to_string();
    if term.is_empty() {
      return Err(DataError::Validation("search term is empty".into()));
    }

    let mut body = inner.options.kind.defaults(&term);
    if let Value::Object(extra) = extra {
      body.extend(extra);
    }
    if let Some((field, value)) = &inner.options.tenant {
      body.insert(field.clone(), Value::String(value.clone()));
    }

    let created = inner
      .mutations
      .create(&inner.options.collection, Value::Object(body))
      .await?;
    debug!(
      collection = %inner.options.collection,
      id = %created.id,
      "Created entity from search term"
    );
    let torn_down = inner.pending.lock().torn_down;
    if !torn_down {
      inner.cache.set_entity(&created.collection, &created.id, created.clone());
      self.select(created.clone());
    }
    Ok(created)
  }

  /// Cancel everything; later calls are ignored.
  pub fn teardown(&self) {
    let mut pending = self.inner.pending.lock();
    pending.supersede();
    pending.torn_down = true;
  }
}

impl Drop for SearchController {
  fn drop(&mut self) {
    self.teardown();
  }
}

impl Inner {
  async fn run(self: Arc<Self>, generation: u64, term: String) {
    {
      let pending = self.pending.lock();
      if pending.generation != generation {
        return;
      }
      self.state.send_modify(|s| s.phase = SearchPhase::Searching);
    }

    let outcome = self.search(&term).await;

    let pending = self.pending.lock();
    if pending.generation != generation {
      debug!(term = %term, "Discarding superseded search");
      return;
    }
    match outcome {
      Ok(results) => {
        let history_size = self.options.history_size;
        self.state.send_modify(|s| {
          s.results = results;
          s.phase = SearchPhase::Idle;
          s.error = None;
          let entry = term.trim().to_string();
          s.history.retain(|h| *h != entry);
          s.history.insert(0, entry);
          s.history.truncate(history_size);
        });
      }
      Err(err) => {
        warn!(
          collection = %self.options.collection,
          term = %term,
          error = %err,
          "Search failed"
        );
        self.state.send_modify(|s| {
          s.results.clear();
          s.phase = SearchPhase::Idle;
          s.error = Some(err);
        });
      }
    }
  }

  async fn search(&self, term: &str) -> DataResult<Vec<Document>> {
    let options = &self.options;
    let needle = term.trim().to_lowercase();

    let query = match &options.mode {
      // The snapshot is already in memory and can be replaced at any time;
      // its rankings are never cached.
      SearchMode::Local => {
        let tenant = self.scoped(QueryOptions::new());
        let candidates: Vec<Document> = self
          .snapshot
          .read()
          .iter()
          .filter(|doc| tenant.matches(doc))
          .cloned()
          .collect();
        return Ok(self.finish(term, candidates));
      }
      SearchMode::Prefix { field } => self.scoped(
        QueryOptions::new()
          .filter(FieldFilter::gte(field.as_str(), needle.as_str()))
          .filter(FieldFilter::lte(
            field.as_str(),
            format!("{}{}", needle, PREFIX_END),
          ))
          .limit(options.max_results.saturating_mul(2).max(1)),
      ),
      SearchMode::Recent { order_field, window } => self.scoped(
        QueryOptions::new()
          .order_by(order_field.as_str(), OrderDirection::Desc)
          .limit((*window).max(1)),
      ),
    };

    let key = self.cache_key(&query, &needle);
    if let Some(key) = &key {
      if let Ok(hit) = self.cache.get_query_result(key) {
        return Ok(hit);
      }
    }
    let candidates = self.remote(&query).await?;
    let results = self.finish(term, candidates);
    if let Some(key) = &key {
      self.cache.set_query_result(key, results.clone());
    }
    Ok(results)
  }

  /// Rank candidates and prime the entity cache with what is kept.
  fn finish(&self, term: &str, candidates: Vec<Document>) -> Vec<Document> {
    let options = &self.options;
    let results = rank(term, candidates, &options.search_fields, options.max_results);
    if options.prime_cache {
      for doc in &results {
        self.cache.set_entity(&doc.collection, &doc.id, doc.clone());
      }
    }
    results
  }

  async fn remote(&self, query: &QueryOptions) -> DataResult<Vec<Document>> {
    bounded(
      self.timeout,
      Operation::Query,
      &self.options.collection,
      "*",
      self.store.get_many(&self.options.collection, query),
    )
    .await
  }

  /// Add the tenant filter, if any.
  fn scoped(&self, query: QueryOptions) -> QueryOptions {
    match &self.options.tenant {
      Some((field, value)) => query.filter(FieldFilter::eq(field.as_str(), value.as_str())),
      None => query,
    }
  }

  /// Result-list key: the remote query (collection, mode, tenant) plus
  /// everything ranking depends on.
  fn cache_key(&self, query: &QueryOptions, needle: &str) -> Option<QueryKey> {
    let fields: Vec<&str> = self.options.search_fields.iter().map(String::as_str).collect();
    let base = QueryKey::new(&self.options.collection, query, &fields)?;
    let name = format!(
      "search:{}:{}:{}",
      base.fingerprint(),
      self.options.max_results,
      needle
    );
    QueryKey::named(&self.options.collection, &name)
  }
}
