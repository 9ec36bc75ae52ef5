//! Dependency checks run before a delete

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use types::{Document, FieldFilter, QueryOptions};

use crate::error::{DataResult, DependencyBlock, Operation, StoreError};
use crate::store::{bounded, DocumentStore};

/// Referencing documents kept in a [`DependencyBlock`].
pub const SAMPLE_SIZE: usize = 5;

/// How documents of the checked collection point at the entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
  /// `field` holds the id
  Direct,
  /// `field` is an array containing the id
  Array,
  /// `field` is an object whose `path` holds the id (`venue.id`)
  Nested { path: String },
}

/// Finds referencing documents in ways a field filter cannot express.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
  async fn find(&self, store: &dyn DocumentStore, id: &str) -> Result<Vec<Document>, StoreError>;
}

#[derive(Clone)]
enum Lookup {
  Field { field: String, reference: Reference },
  Probe(Arc<dyn DependencyProbe>),
}

/// One "related collection + field" check. The first check that finds
/// referencing documents blocks the delete.
#[derive(Clone)]
pub struct DependencyCheck {
  pub collection: String,
  lookup: Lookup,
  message: Option<String>,
}

impl DependencyCheck {
  pub fn direct(collection: &str, field: &str) -> Self {
    Self::field(collection, field, Reference::Direct)
  }

  pub fn array(collection: &str, field: &str) -> Self {
    Self::field(collection, field, Reference::Array)
  }

  pub fn nested(collection: &str, field: &str, path: &str) -> Self {
    Self::field(
      collection,
      field,
      Reference::Nested {
        path: path.to_string(),
      },
    )
  }

  pub fn custom(collection: &str, probe: Arc<dyn DependencyProbe>) -> Self {
    Self {
      collection: collection.to_string(),
      lookup: Lookup::Probe(probe),
      message: None,
    }
  }

  /// Message reported instead of the generated one.
  pub fn with_message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }

  fn field(collection: &str, field: &str, reference: Reference) -> Self {
    Self {
      collection: collection.to_string(),
      lookup: Lookup::Field {
        field: field.to_string(),
        reference,
      },
      message: None,
    }
  }

  fn query(&self, id: &str) -> Option<QueryOptions> {
    let Lookup::Field { field, reference } = &self.lookup else {
      return None;
    };
    let filter = match reference {
      Reference::Direct => FieldFilter::eq(field.as_str(), id),
      Reference::Array => FieldFilter::array_contains(field.as_str(), id),
      Reference::Nested { path } => FieldFilter::eq(format!("{}.{}", field, path), id),
    };
    Some(QueryOptions::new().filter(filter))
  }

  /// Look for documents referencing `id`. `Ok(None)` means nothing blocks.
  pub async fn evaluate(
    &self,
    store: &dyn DocumentStore,
    timeout: Option<Duration>,
    id: &str,
  ) -> DataResult<Option<DependencyBlock>> {
    let found = match (&self.lookup, self.query(id)) {
      (Lookup::Probe(probe), _) => {
        bounded(
          timeout,
          Operation::Query,
          &self.collection,
          id,
          probe.find(store, id),
        )
        .await?
      }
      (Lookup::Field { .. }, Some(options)) => {
        bounded(
          timeout,
          Operation::Query,
          &self.collection,
          id,
          store.get_many(&self.collection, &options),
        )
        .await?
      }
      (Lookup::Field { .. }, None) => Vec::new(),
    };

    if found.is_empty() {
      return Ok(None);
    }
    let count = found.len();
    let message = self.message.clone().unwrap_or_else(|| {
      format!(
        "cannot delete: {} document(s) in {} still reference it",
        count, self.collection
      )
    });
    Ok(Some(DependencyBlock {
      collection: self.collection.clone(),
      count,
      sample: found.into_iter().take(SAMPLE_SIZE).collect(),
      message,
    }))
  }
}

impl std::fmt::Debug for DependencyCheck {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let lookup = match &self.lookup {
      Lookup::Field { field, reference } => format!("{} ({:?})", field, reference),
      Lookup::Probe(_) => "custom".to_string(),
    };
    f.debug_struct("DependencyCheck")
      .field("collection", &self.collection)
      .field("lookup", &lookup)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::InMemoryStore;
  use serde_json::json;

  #[tokio::test]
  async fn nested_reference_is_found_and_sampled() {
    let store = InMemoryStore::new();
    for i in 0..7 {
      store
        .insert(
          "concerts",
          &format!("k{i}"),
          json!({ "venue": { "id": "v1", "name": "Le Sonar" } }),
        )
        .unwrap();
    }
    let check = DependencyCheck::nested("concerts", "venue", "id");
    let block = check.evaluate(&store, None, "v1").await.unwrap().unwrap();
    assert_eq!(block.count, 7);
    assert_eq!(block.sample.len(), SAMPLE_SIZE);
    assert!(block.message.contains("concerts"));

    assert!(check.evaluate(&store, None, "v2").await.unwrap().is_none());
  }
}
