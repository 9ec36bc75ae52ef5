//! Cache keys for the entity, query-result and relation partitions

use std::fmt;
use types::QueryOptions;

/// `(collection, id)`: one cached entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
  pub collection: String,
  pub id: String,
}

impl EntityKey {
  /// `None` when either part is empty.
  pub fn new(collection: &str, id: &str) -> Option<Self> {
    if collection.is_empty() || id.is_empty() {
      return None;
    }
    Some(Self {
      collection: collection.to_string(),
      id: id.to_string(),
    })
  }
}

impl fmt::Display for EntityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.collection, self.id)
  }
}

/// Stable serialization of `(collection, query options, projected fields)`.
///
/// Two keys built from option sets that differ only in filter order, or from
/// field lists that differ only in order, are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
  pub collection: String,
  fingerprint: String,
}

impl QueryKey {
  pub fn new(collection: &str, options: &QueryOptions, fields: &[&str]) -> Option<Self> {
    if collection.is_empty() {
      return None;
    }
    let mut fields: Vec<&str> = fields.to_vec();
    fields.sort_unstable();
    fields.dedup();
    let fingerprint = serde_json::to_string(&(options.canonical(), fields)).ok()?;
    Some(Self {
      collection: collection.to_string(),
      fingerprint,
    })
  }

  /// A key for a result list that is not described by query options, such
  /// as a locally ranked search result.
  pub fn named(collection: &str, name: &str) -> Option<Self> {
    if collection.is_empty() || name.is_empty() {
      return None;
    }
    Some(Self {
      collection: collection.to_string(),
      fingerprint: name.to_string(),
    })
  }

  pub fn fingerprint(&self) -> &str {
    &self.fingerprint
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}?{}", self.collection, self.fingerprint)
  }
}

/// `(source collection, source id, target collection)`: one relation edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationKey {
  pub source_collection: String,
  pub source_id: String,
  pub target_collection: String,
}

impl RelationKey {
  pub fn new(source_collection: &str, source_id: &str, target_collection: &str) -> Option<Self> {
    if source_collection.is_empty() || source_id.is_empty() || target_collection.is_empty() {
      return None;
    }
    Some(Self {
      source_collection: source_collection.to_string(),
      source_id: source_id.to_string(),
      target_collection: target_collection.to_string(),
    })
  }

  /// True when either side of the edge is `collection`.
  pub fn touches(&self, collection: &str) -> bool {
    self.source_collection == collection || self.target_collection == collection
  }
}

impl fmt::Display for RelationKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}/{}->{}",
      self.source_collection, self.source_id, self.target_collection
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use types::FieldFilter;

  #[test]
  fn empty_parts_are_rejected() {
    assert!(EntityKey::new("", "c1").is_none());
    assert!(EntityKey::new("contacts", "").is_none());
    assert!(RelationKey::new("contacts", "c1", "").is_none());
    assert!(QueryKey::new("", &QueryOptions::new(), &[]).is_none());
  }

  #[test]
  fn query_key_is_order_insensitive() {
    let a = QueryOptions::new()
      .filter(FieldFilter::eq("city", "Lyon"))
      .filter(FieldFilter::eq("type", "club"));
    let b = QueryOptions::new()
      .filter(FieldFilter::eq("type", "club"))
      .filter(FieldFilter::eq("city", "Lyon"));
    assert_eq!(
      QueryKey::new("venues", &a, &["name", "city"]),
      QueryKey::new("venues", &b, &["city", "name"])
    );
    assert_ne!(
      QueryKey::new("venues", &a, &[]),
      QueryKey::new("contacts", &a, &[])
    );
  }
}
