//! One consumer's observation of one entity

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use types::Document;

use super::session::{FetchSession, Issue, Ticket};
use super::{EntityState, FetchMode, ObserveOptions, RelatedState};
use crate::cache::{CacheMiss, CacheStore, Related};
use crate::error::{DataError, DataResult, Operation};
use crate::mutation::MutationCoordinator;
use crate::relations::{RelatedEntityLoader, RelationDescriptor};
use crate::store::{bounded, DocumentStore, Snapshot};

struct Shared {
  collection: String,
  options: ObserveOptions,
  store: Arc<dyn DocumentStore>,
  cache: Arc<CacheStore>,
  mutations: Option<Arc<MutationCoordinator>>,
  loader: RelatedEntityLoader,
  timeout: Option<Duration>,
  session: Mutex<FetchSession>,
  state: watch::Sender<EntityState>,
  /// Task following the live subscription, if any
  live: Mutex<Option<JoinHandle<()>>>,
  /// Bumped whenever relation loads already running stop being wanted
  relation_epoch: AtomicU64,
}

/// Handle on an observed entity.
///
/// State is published through a watch channel; [`subscribe`](Self::subscribe)
/// to follow it. Dropping the observer tears it down.
pub struct EntityObserver {
  shared: Arc<Shared>,
}

impl EntityObserver {
  pub(super) fn new(
    collection: &str,
    options: ObserveOptions,
    store: Arc<dyn DocumentStore>,
    cache: Arc<CacheStore>,
    mutations: Option<Arc<MutationCoordinator>>,
    timeout: Option<Duration>,
    coalesce_window: Duration,
  ) -> Self {
    let loader = RelatedEntityLoader::new(store.clone(), cache.clone())
      .with_coalesce_window(coalesce_window)
      .with_timeout(timeout)
      .with_cache(options.cache);
    let (state, _) = watch::channel(EntityState::default());
    Self {
      shared: Arc::new(Shared {
        collection: collection.to_string(),
        options,
        store,
        cache,
        mutations,
        loader,
        timeout,
        session: Mutex::new(FetchSession::new()),
        state,
        live: Mutex::new(None),
        relation_epoch: AtomicU64::new(0),
      }),
    }
  }

  pub fn collection(&self) -> &str {
    &self.shared.collection
  }

  pub fn state(&self) -> EntityState {
    self.shared.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<EntityState> {
    self.shared.state.subscribe()
  }

  pub fn entity(&self) -> Option<Document> {
    self.shared.state.borrow().entity.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.shared.state.borrow().loading
  }

  pub fn error(&self) -> Option<DataError> {
    self.shared.state.borrow().error.clone()
  }

  pub fn related(&self, name: &str) -> RelatedState {
    self.shared.state.borrow().related(name)
  }

  /// Sequence number of the latest observe, for diagnostics.
  pub fn sequence(&self) -> u64 {
    self.shared.session.lock().sequence()
  }

  /// Observe another id. Observing the id already observed only coalesces
  /// with the request in flight, if there is one.
  pub fn set_id(&self, id: &str) {
    self.shared.observe_id(id);
  }

  /// Drop the cached copy and fetch again.
  pub fn refresh(&self) {
    let shared = &self.shared;
    let mut session = shared.session.lock();
    let Some(id) = session.current_id().map(str::to_string) else {
      return;
    };
    if !session.is_mounted() {
      return;
    }
    shared.cache.invalidate(&shared.collection, Some(&id));
    shared.cache.invalidate_relations_from(&shared.collection, &id);
    shared.restart_relations(&id);
    shared.reissue(&mut session);
  }

  /// Issue the request again after a failure. Does nothing while a request
  /// is outstanding or before any id was observed.
  pub fn retry(&self) {
    let shared = &self.shared;
    let mut session = shared.session.lock();
    if !session.is_mounted() || session.current_id().is_none() {
      return;
    }
    if shared.options.mode == FetchMode::OneShot && session.has_in_flight() {
      return;
    }
    shared.reissue(&mut session);
  }

  /// Wait until neither the root entity nor any relation is loading.
  pub async fn settled(&self) -> EntityState {
    let mut rx = self.shared.state.subscribe();
    let settled = match rx.wait_for(|s| !s.is_busy()).await {
      Ok(state) => state.clone(),
      Err(_) => self.state(),
    };
    settled
  }

  /// Load one relation on demand, lazy or not.
  pub async fn load_related(&self, name: &str) -> DataResult<Related> {
    let shared = &self.shared;
    let descriptor = shared.descriptor(name)?;
    let Some(root) = self.entity() else {
      return Ok(descriptor.empty());
    };
    shared.mark_loading(&[descriptor.clone()]);
    let related = shared.loader.load_one(&descriptor, &root).await;
    shared.publish_related(&root.id, vec![(descriptor.name.clone(), related.clone())], None);
    Ok(related)
  }

  /// Resolve a relation for an explicit target id, e.g. one just picked by
  /// the user before the root entity was saved.
  pub async fn load_related_by_id(&self, name: &str, target_id: &str) -> DataResult<Related> {
    let shared = &self.shared;
    let descriptor = shared.descriptor(name)?;
    let Some(root) = self.entity() else {
      return Ok(descriptor.empty());
    };
    shared.mark_loading(&[descriptor.clone()]);
    match shared.loader.load_by_id(&descriptor, &root, target_id).await {
      Ok(related) => {
        shared.publish_related(&root.id, vec![(descriptor.name.clone(), related.clone())], None);
        Ok(related)
      }
      Err(err) => {
        shared.publish_related(&root.id, vec![(descriptor.name.clone(), descriptor.empty())], None);
        Err(err)
      }
    }
  }

  /// Show `related` for a relation without loading anything, e.g. a target
  /// the user just picked. Its documents are cached as entities; the root's
  /// foreign key is left alone.
  pub fn set_related(&self, name: &str, related: Related) -> DataResult<()> {
    let shared = &self.shared;
    let descriptor = shared.descriptor(name)?;
    if !descriptor.accepts(&related) {
      return Err(DataError::Validation(format!(
        "value does not fit relation '{}'",
        name
      )));
    }
    let id = shared.observed_id()?;
    if shared.options.cache {
      for doc in related.documents() {
        shared.cache.set_entity(&doc.collection, &doc.id, doc.clone());
      }
    }
    shared.publish_related(&id, vec![(descriptor.name, related)], None);
    Ok(())
  }

  /// Show a relation as empty until it is next loaded.
  pub fn clear_related(&self, name: &str) -> DataResult<()> {
    let shared = &self.shared;
    let descriptor = shared.descriptor(name)?;
    let id = shared.observed_id()?;
    let empty = descriptor.empty();
    shared.publish_related(&id, vec![(descriptor.name, empty)], None);
    Ok(())
  }

  /// Optimistic update: the merged entity is published at once, committed
  /// through the mutation coordinator, and rolled back if the write fails.
  pub async fn update(&self, patch: Value) -> DataResult<Document> {
    let shared = &self.shared;
    let mutations = shared
      .mutations
      .clone()
      .ok_or_else(|| DataError::Validation("observer has no mutation coordinator".into()))?;
    let (id, previous) = {
      let state = shared.state.borrow();
      (state.id.clone(), state.entity.clone())
    };
    let id = id.ok_or_else(|| DataError::InvalidKey("no entity observed".into()))?;
    let previous = previous.ok_or_else(|| DataError::not_found(&shared.collection, &id))?;

    shared.publish_entity(&id, previous.merged(&patch));

    match mutations.update(&shared.collection, &id, patch).await {
      Ok(confirmed) => {
        let confirmed = shared.finish_doc(confirmed);
        shared.cache_entity(&id, confirmed.clone());
        shared.publish_entity(&id, confirmed.clone());
        Ok(confirmed)
      }
      Err(err) => {
        warn!(
          collection = %shared.collection,
          id = %id,
          error = %err,
          "Optimistic update failed, rolling back"
        );
        shared.publish_entity(&id, previous);
        Err(err)
      }
    }
  }

  /// Stop observing. Live subscriptions are released and responses still in
  /// flight are discarded when they arrive.
  pub fn teardown(&self) {
    let mut session = self.shared.session.lock();
    if session.is_mounted() {
      session.teardown();
      self.shared.stop_live();
      debug!(collection = %self.shared.collection, "Observer torn down");
    }
  }
}

impl Drop for EntityObserver {
  fn drop(&mut self) {
    self.teardown();
  }
}

impl Shared {
  fn observe_id(self: &Arc<Self>, id: &str) {
    let mut session = self.session.lock();
    if !session.is_mounted() {
      return;
    }

    if id.is_empty() {
      session.release();
      self.stop_live();
      self.state.send_replace(EntityState {
        error: Some(DataError::InvalidKey(format!("{}/<empty id>", self.collection))),
        ..EntityState::default()
      });
      return;
    }

    if session.switch_to(id) {
      self.stop_live();
      // A load started under an earlier observation of this id may have been
      // discarded; never coalesce with it.
      self.restart_relations(id);
      let cached = if self.options.cache {
        self.cache.get_entity(&self.collection, id)
      } else {
        Err(CacheMiss::Absent)
      };
      match cached {
        Ok(doc) => {
          session.remember(&doc);
          let descriptors = self.auto_relations();
          self.state.send_replace(EntityState {
            id: Some(id.to_string()),
            entity: Some(doc.clone()),
            related: descriptors
              .iter()
              .map(|d| (d.name.clone(), RelatedState::Loading))
              .collect(),
            ..EntityState::default()
          });
          self.spawn_relations(doc, descriptors);
          if self.options.mode == FetchMode::OneShot {
            return;
          }
        }
        Err(_) => {
          self.state.send_replace(EntityState {
            id: Some(id.to_string()),
            entity: session.recall(id),
            loading: true,
            ..EntityState::default()
          });
        }
      }
    } else if !session.has_in_flight() {
      return;
    }

    self.issue(&mut session);
  }

  fn reissue(self: &Arc<Self>, session: &mut FetchSession) {
    session.reset_guards();
    self.stop_live();
    self.state.send_modify(|s| {
      s.loading = true;
      s.error = None;
    });
    self.issue(session);
  }

  fn issue(self: &Arc<Self>, session: &mut FetchSession) {
    match session.issue() {
      Issue::Fetch(ticket) => {
        let shared = self.clone();
        match self.options.mode {
          FetchMode::OneShot => {
            // Not tracked: a one-shot read always completes, and the session
            // decides whether its result still applies.
            tokio::spawn(async move { shared.fetch_once(ticket).await });
          }
          FetchMode::Live => {
            let handle = tokio::spawn(async move { shared.follow(ticket).await });
            if let Some(previous) = self.live.lock().replace(handle) {
              previous.abort();
            }
          }
        }
      }
      Issue::Coalesced => {
        debug!(
          collection = %self.collection,
          id = ?session.current_id(),
          sequence = session.sequence(),
          "Observe coalesced with the request in flight"
        );
      }
      Issue::Idle => {}
    }
  }

  async fn fetch_once(self: Arc<Self>, ticket: Ticket) {
    let result = bounded(
      self.timeout,
      Operation::Get,
      &self.collection,
      &ticket.id,
      self.store.get(&self.collection, &ticket.id),
    )
    .await;
    let result = match result {
      Ok(doc) => Ok(Some(doc)),
      Err(DataError::NotFound { .. }) => Ok(None),
      Err(err) => Err(err),
    };
    self.apply(&ticket, result, true);
  }

  async fn follow(self: Arc<Self>, ticket: Ticket) {
    let subscribed = bounded(
      self.timeout,
      Operation::Subscribe,
      &self.collection,
      &ticket.id,
      self.store.subscribe(&self.collection, &ticket.id),
    )
    .await;
    let mut subscription = match subscribed {
      Ok(subscription) => subscription,
      Err(err) => {
        self.apply(&ticket, Err(err), true);
        return;
      }
    };

    while let Some(event) = subscription.recv().await {
      let (result, last) = match event {
        Ok(Snapshot::Document(doc)) => (Ok(doc), false),
        Ok(Snapshot::Query(_)) => continue,
        Err(err) => (
          Err(DataError::from_store(
            Operation::Subscribe,
            &self.collection,
            &ticket.id,
            err,
          )),
          true,
        ),
      };
      if !self.apply(&ticket, result, last) || last {
        break;
      }
    }
    self.session.lock().finish(&ticket);
  }

  /// Apply one response if the session still wants it. Returns whether it
  /// was applied.
  fn apply(
    self: &Arc<Self>,
    ticket: &Ticket,
    result: DataResult<Option<Document>>,
    finish: bool,
  ) -> bool {
    let mut session = self.session.lock();
    let accepted = if finish {
      session.finish(ticket)
    } else {
      session.accepts(ticket)
    };
    if !accepted {
      debug!(
        collection = %self.collection,
        id = %ticket.id,
        ticket = ticket.number,
        "Discarding stale response"
      );
      return false;
    }

    match result {
      Ok(Some(doc)) => {
        let doc = self.finish_doc(doc);
        let changed = self
          .state
          .borrow()
          .entity
          .as_ref()
          .is_some_and(|shown| *shown != doc);
        if changed {
          // The new version may point elsewhere; cached edges and loads
          // started for the old one no longer apply.
          self
            .cache
            .invalidate_relations_from(&self.collection, &ticket.id);
          self.restart_relations(&ticket.id);
        }
        self.cache_entity(&ticket.id, doc.clone());
        session.remember(&doc);
        // Relations must read as loading before the root stops loading.
        let descriptors = self.auto_relations();
        self.mark_loading(&descriptors);
        self.state.send_modify(|s| {
          s.entity = Some(doc.clone());
          s.loading = false;
          s.error = None;
        });
        self.spawn_relations(doc, descriptors);
      }
      Ok(None) => {
        self.cache.invalidate(&self.collection, Some(&ticket.id));
        let err = DataError::not_found(&self.collection, &ticket.id);
        self.state.send_modify(|s| {
          s.entity = None;
          s.loading = false;
          s.error = Some(err);
          s.related.clear();
        });
      }
      Err(err) => {
        debug!(
          collection = %self.collection,
          id = %ticket.id,
          error = %err,
          "Fetch failed"
        );
        self.state.send_modify(|s| {
          s.loading = false;
          s.error = Some(err);
        });
      }
    }
    true
  }

  /// Relations loaded whenever the root entity is published.
  fn auto_relations(&self) -> Vec<RelationDescriptor> {
    if !self.options.auto_load_related {
      return Vec::new();
    }
    self
      .options
      .relations
      .iter()
      .filter(|d| !d.lazy)
      .cloned()
      .collect()
  }

  fn spawn_relations(self: &Arc<Self>, root: Document, descriptors: Vec<RelationDescriptor>) {
    if descriptors.is_empty() {
      return;
    }
    let shared = self.clone();
    let epoch = self.relation_epoch.load(Ordering::SeqCst);
    tokio::spawn(async move {
      if let Some(results) = shared.loader.load_all(&root, &descriptors).await {
        shared.publish_related(&root.id, results.into_iter().collect(), Some(epoch));
      }
    });
  }

  /// Let the next relation load for `id` run instead of coalescing, and
  /// discard the results of loads already running.
  fn restart_relations(&self, id: &str) {
    self.loader.reset(&self.collection, id);
    self.relation_epoch.fetch_add(1, Ordering::SeqCst);
  }

  /// Mark relations that have no value yet as loading. Relations with a
  /// value keep showing it until the new one lands.
  fn mark_loading(&self, descriptors: &[RelationDescriptor]) {
    self.state.send_modify(|s| {
      for d in descriptors {
        let entry = s.related.entry(d.name.clone()).or_default();
        if *entry == RelatedState::Idle {
          *entry = RelatedState::Loading;
        }
      }
    });
  }

  /// Publish relation values for `root_id`. With an epoch, they are only
  /// published if no restart happened since it was read.
  fn publish_related(&self, root_id: &str, results: Vec<(String, Related)>, epoch: Option<u64>) {
    let session = self.session.lock();
    if epoch.is_some_and(|e| e != self.relation_epoch.load(Ordering::SeqCst)) {
      debug!(
        collection = %self.collection,
        id = %root_id,
        "Discarding relations loaded for an older version"
      );
      return;
    }
    if !session.is_mounted() || session.current_id() != Some(root_id) {
      debug!(
        collection = %self.collection,
        id = %root_id,
        "Discarding relations of an entity no longer observed"
      );
      return;
    }
    self.state.send_modify(|s| {
      for (name, related) in results {
        s.related.insert(name, RelatedState::Ready(related));
      }
    });
  }

  fn publish_entity(&self, id: &str, doc: Document) {
    let mut session = self.session.lock();
    if !session.is_mounted() || session.current_id() != Some(id) {
      return;
    }
    session.remember(&doc);
    self.state.send_modify(|s| s.entity = Some(doc));
  }

  fn observed_id(&self) -> DataResult<String> {
    self
      .session
      .lock()
      .current_id()
      .map(str::to_string)
      .ok_or_else(|| DataError::InvalidKey("no entity observed".into()))
  }

  /// Cache the root entity as this observer's options say.
  fn cache_entity(&self, id: &str, doc: Document) {
    if !self.options.cache {
      return;
    }
    match self.options.cache_ttl {
      Some(ttl) => self
        .cache
        .set_entity_with_ttl(&self.collection, id, doc, ttl),
      None => self.cache.set_entity(&self.collection, id, doc),
    };
  }

  fn descriptor(&self, name: &str) -> DataResult<RelationDescriptor> {
    self
      .options
      .descriptor(name)
      .cloned()
      .ok_or_else(|| DataError::Validation(format!("unknown relation '{}'", name)))
  }

  fn finish_doc(&self, doc: Document) -> Document {
    match &self.options.transform {
      Some(transform) => transform(doc),
      None => doc,
    }
  }

  fn stop_live(&self) {
    if let Some(handle) = self.live.lock().take() {
      handle.abort();
    }
  }
}
