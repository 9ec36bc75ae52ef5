//! Declarative relations between entities and the loader that resolves them

mod loader;

pub use loader::RelatedEntityLoader;

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use types::Document;

use crate::cache::Related;
use crate::error::StoreError;
use crate::store::DocumentStore;

/// Resolves a relation that none of the built-in kinds can express.
#[async_trait]
pub trait RelationResolver: Send + Sync {
  async fn resolve(&self, root: &Document, store: &dyn DocumentStore)
    -> Result<Value, StoreError>;
}

/// Adapts an async closure into a [`RelationResolver`].
pub struct FnResolver<F>(F);

#[async_trait]
impl<F, Fut> RelationResolver for FnResolver<F>
where
  F: Fn(Document) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Value, StoreError>> + Send,
{
  async fn resolve(
    &self,
    root: &Document,
    _store: &dyn DocumentStore,
  ) -> Result<Value, StoreError> {
    (self.0)(root.clone()).await
  }
}

/// How a relation's targets are found from the root entity.
#[derive(Clone)]
pub enum RelationKind {
  /// `root[foreign_key]` holds one target id
  OneToOne { foreign_key: String },
  /// `root[foreign_key]` holds a list of target ids (a scalar counts as one)
  OneToMany { foreign_key: String },
  /// Targets whose `field` equals the root id, or contains it when
  /// `contains` is set and the field is an array
  Inverse { field: String, contains: bool },
  /// Anything else; the result is cached as opaque data
  Custom(Arc<dyn RelationResolver>),
}

impl std::fmt::Debug for RelationKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      RelationKind::OneToOne { foreign_key } => write!(f, "OneToOne({})", foreign_key),
      RelationKind::OneToMany { foreign_key } => write!(f, "OneToMany({})", foreign_key),
      RelationKind::Inverse { field, contains } => {
        write!(f, "Inverse({}, contains={})", field, contains)
      }
      RelationKind::Custom(_) => write!(f, "Custom"),
    }
  }
}

/// One named relation of a root entity.
#[derive(Debug, Clone)]
pub struct RelationDescriptor {
  pub name: String,
  /// Collection the targets live in
  pub collection: String,
  pub kind: RelationKind,
  /// Skipped by automatic loading; loaded on demand only
  pub lazy: bool,
}

impl RelationDescriptor {
  pub fn one_to_one(name: &str, collection: &str, foreign_key: &str) -> Self {
    Self::new(
      name,
      collection,
      RelationKind::OneToOne {
        foreign_key: foreign_key.to_string(),
      },
    )
  }

  pub fn one_to_many(name: &str, collection: &str, foreign_key: &str) -> Self {
    Self::new(
      name,
      collection,
      RelationKind::OneToMany {
        foreign_key: foreign_key.to_string(),
      },
    )
  }

  pub fn inverse(name: &str, collection: &str, field: &str) -> Self {
    Self::new(
      name,
      collection,
      RelationKind::Inverse {
        field: field.to_string(),
        contains: false,
      },
    )
  }

  pub fn inverse_contains(name: &str, collection: &str, field: &str) -> Self {
    Self::new(
      name,
      collection,
      RelationKind::Inverse {
        field: field.to_string(),
        contains: true,
      },
    )
  }

  pub fn custom(name: &str, collection: &str, resolver: Arc<dyn RelationResolver>) -> Self {
    Self::new(name, collection, RelationKind::Custom(resolver))
  }

  /// Custom relation from an async closure.
  pub fn custom_fn<F, Fut>(name: &str, collection: &str, resolve: F) -> Self
  where
    F: Fn(Document) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StoreError>> + Send + 'static,
  {
    Self::custom(name, collection, Arc::new(FnResolver(resolve)))
  }

  pub fn lazy(mut self) -> Self {
    self.lazy = true;
    self
  }

  fn new(name: &str, collection: &str, kind: RelationKind) -> Self {
    Self {
      name: name.to_string(),
      collection: collection.to_string(),
      kind,
      lazy: false,
    }
  }

  /// The value this relation resolves to when there is nothing to load.
  pub fn empty(&self) -> Related {
    match self.kind {
      RelationKind::OneToOne { .. } => Related::One(None),
      RelationKind::OneToMany { .. } | RelationKind::Inverse { .. } => Related::Many(Vec::new()),
      RelationKind::Custom(_) => Related::Opaque(Value::Null),
    }
  }

  /// Whether a cached value has the shape this relation produces.
  pub(crate) fn accepts(&self, related: &Related) -> bool {
    matches!(
      (&self.kind, related),
      (RelationKind::OneToOne { .. }, Related::One(_))
        | (RelationKind::OneToMany { .. }, Related::Many(_))
        | (RelationKind::Inverse { .. }, Related::Many(_))
        | (RelationKind::Custom(_), Related::Opaque(_))
    )
  }

  /// Whether a cached value still answers for `root`: its targets must be
  /// the ones the root points at now. Custom results cannot be checked and
  /// are taken as they are.
  pub(crate) fn is_current(&self, related: &Related, root: &Document) -> bool {
    match (&self.kind, related) {
      (RelationKind::OneToOne { foreign_key }, Related::One(Some(doc))) => {
        foreign_ids(root.field(foreign_key)).first() == Some(&doc.id)
      }
      // A missing target is never trusted from the cache.
      (RelationKind::OneToOne { .. }, Related::One(None)) => false,
      (RelationKind::OneToMany { foreign_key }, Related::Many(docs)) => {
        let ids = foreign_ids(root.field(foreign_key));
        ids.len() == docs.len() && ids.iter().zip(docs).all(|(id, doc)| *id == doc.id)
      }
      (RelationKind::Inverse { field, contains }, Related::Many(docs)) => docs
        .iter()
        .all(|doc| refers_to(doc.field(field), &root.id, *contains)),
      (RelationKind::Custom(_), Related::Opaque(_)) => true,
      _ => false,
    }
  }
}

fn refers_to(value: Option<&Value>, id: &str, contains: bool) -> bool {
  match value {
    Some(Value::Array(items)) if contains => items.iter().any(|v| v.as_str() == Some(id)),
    Some(v) => v.as_str() == Some(id),
    None => false,
  }
}

/// Target ids held in a foreign-key field: a string, a number, or an array
/// of them. Empty strings and nulls are skipped and duplicates dropped.
pub fn foreign_ids(value: Option<&Value>) -> Vec<String> {
  fn one(v: &Value) -> Option<String> {
    match v {
      Value::String(s) if !s.is_empty() => Some(s.clone()),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
    }
  }

  let mut ids: Vec<String> = match value {
    Some(Value::Array(items)) => items.iter().filter_map(one).collect(),
    Some(v) => one(v).into_iter().collect(),
    None => Vec::new(),
  };
  let mut seen = std::collections::HashSet::new();
  ids.retain(|id| seen.insert(id.clone()));
  ids
}
