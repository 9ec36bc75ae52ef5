//! Debounced entity search with local ranking and create-on-miss

mod controller;
mod kind;

pub use controller::SearchController;
pub use kind::{CustomKind, EntityKind, LOWERCASE_SUFFIX};

use std::collections::HashSet;
use std::time::Duration;
use types::Document;

use crate::config::SearchSection;
use crate::error::DataError;

/// Where candidates come from.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchMode {
  /// Prefix range over a lowercase field of the remote collection
  Prefix { field: String },
  /// The `window` most recent remote documents by `order_field`, filtered
  /// locally
  Recent { order_field: String, window: usize },
  /// A snapshot held by the controller
  Local,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
  pub collection: String,
  pub kind: EntityKind,
  pub mode: SearchMode,
  /// Fields the term is matched against
  pub search_fields: Vec<String>,
  /// `(field, value)` every candidate must match
  pub tenant: Option<(String, String)>,
  pub debounce: Duration,
  pub min_length: usize,
  pub max_results: usize,
  pub history_size: usize,
  pub allow_create: bool,
  /// Write every result into the entity cache
  pub prime_cache: bool,
}

impl SearchOptions {
  /// Remote prefix search on the kind's lowercase name field.
  pub fn remote(collection: &str, kind: EntityKind) -> Self {
    let mode = SearchMode::Prefix {
      field: kind.lowercase_field(),
    };
    Self::new(collection, kind, mode)
  }

  /// Remote search over the most recently ordered documents, for
  /// collections without a lowercase shadow field.
  pub fn recent(collection: &str, kind: EntityKind, order_field: &str, window: usize) -> Self {
    let mode = SearchMode::Recent {
      order_field: order_field.to_string(),
      window,
    };
    Self::new(collection, kind, mode)
  }

  /// Search over a snapshot loaded once.
  pub fn local(collection: &str, kind: EntityKind) -> Self {
    Self::new(collection, kind, SearchMode::Local)
  }

  fn new(collection: &str, kind: EntityKind, mode: SearchMode) -> Self {
    let section = SearchSection::default();
    Self {
      collection: collection.to_string(),
      search_fields: kind.search_fields(),
      kind,
      mode,
      tenant: None,
      debounce: section.debounce(),
      min_length: section.min_length,
      max_results: section.max_results,
      history_size: section.history_size,
      allow_create: false,
      prime_cache: true,
    }
  }

  /// Take debounce, lengths and history size from configuration.
  pub fn with_config(mut self, section: &SearchSection) -> Self {
    self.debounce = section.debounce();
    self.min_length = section.min_length;
    self.max_results = section.max_results;
    self.history_size = section.history_size;
    self
  }

  /// Match these fields in addition to the kind's defaults.
  pub fn also_search(mut self, fields: &[&str]) -> Self {
    for field in fields {
      if !self.search_fields.iter().any(|f| f == field) {
        self.search_fields.push(field.to_string());
      }
    }
    self
  }

  pub fn tenant(mut self, field: &str, value: &str) -> Self {
    self.tenant = Some((field.to_string(), value.to_string()));
    self
  }

  pub fn debounce(mut self, debounce: Duration) -> Self {
    self.debounce = debounce;
    self
  }

  pub fn min_length(mut self, min_length: usize) -> Self {
    self.min_length = min_length;
    self
  }

  pub fn max_results(mut self, max_results: usize) -> Self {
    self.max_results = max_results;
    self
  }

  pub fn allow_create(mut self, allow: bool) -> Self {
    self.allow_create = allow;
    self
  }

  pub fn prime_cache(mut self, prime: bool) -> Self {
    self.prime_cache = prime;
    self
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchPhase {
  #[default]
  Idle,
  /// Waiting for the term to stop changing
  Debouncing,
  /// Query issued, results pending
  Searching,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchState {
  pub term: String,
  pub results: Vec<Document>,
  pub phase: SearchPhase,
  pub selected: Option<Document>,
  /// Last search failure; results are empty when set
  pub error: Option<DataError>,
  /// Most recent committed terms, newest first
  pub history: Vec<String>,
}

impl SearchState {
  pub fn is_searching(&self) -> bool {
    self.phase != SearchPhase::Idle
  }
}

/// Keep candidates matching `term` on any of `fields`, best first: prefix
/// matches, then substring matches, each alphabetical by display name.
/// Duplicate ids are dropped and the list is cut to `limit`.
pub fn rank(term: &str, candidates: Vec<Document>, fields: &[String], limit: usize) -> Vec<Document> {
  let needle = term.trim().to_lowercase();
  let mut seen = HashSet::new();
  let mut scored: Vec<(u8, String, Document)> = candidates
    .into_iter()
    .filter(|doc| seen.insert(doc.id.clone()))
    .filter_map(|doc| {
      let score = fields
        .iter()
        .filter_map(|f| doc.str_field(f))
        .map(str::to_lowercase)
        .filter_map(|value| {
          if value.starts_with(&needle) {
            Some(0)
          } else if value.contains(&needle) {
            Some(1)
          } else {
            None
          }
        })
        .min()?;
      Some((score, doc.display_name().to_lowercase(), doc))
    })
    .collect();

  scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
  scored.truncate(limit);
  scored.into_iter().map(|(_, _, doc)| doc).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn venue(id: &str, name: &str, city: &str) -> Document {
    Document::new("venues", id, json!({ "name": name, "city": city }))
  }

  #[test]
  fn prefix_matches_rank_before_substring_matches() {
    let candidates = vec![
      venue("v1", "Le Bikini", "Toulouse"),
      venue("v2", "Bikini Bar", "Nice"),
      venue("v3", "Atelier Bikini", "Lyon"),
      venue("v1", "Le Bikini", "Toulouse"),
      venue("v4", "La Cigale", "Paris"),
    ];
    let fields = vec!["name".to_string(), "city".to_string()];
    let ranked = rank("bik", candidates, &fields, 10);
    let ids: Vec<&str> = ranked.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["v2", "v3", "v1"]);
  }

  #[test]
  fn rank_truncates_and_matches_secondary_fields() {
    let candidates = vec![
      venue("v1", "Le Rex", "Paris"),
      venue("v2", "La Cigale", "Paris"),
      venue("v3", "Le Trianon", "Paris"),
    ];
    let fields = vec!["name".to_string(), "city".to_string()];
    let ranked = rank("PAR", candidates, &fields, 2);
    assert_eq!(ranked.len(), 2);
    assert_eq!(ranked[0].id, "v2");
  }
}
