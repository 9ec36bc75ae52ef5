use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::Document;

/// Comparison operators supported by the store's query primitive.
///
/// Equality and range comparisons on one field, plus membership tests. There
/// is deliberately no substring operator: callers that need "contains"
/// semantics query a prefix range and filter locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
  Eq,
  Lt,
  Lte,
  Gt,
  Gte,
  /// Field is an array containing the value
  ArrayContains,
  /// Field equals one of the values (value must be an array)
  In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
  pub field: String,
  pub op: FilterOp,
  pub value: Value,
}

impl FieldFilter {
  pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
    Self {
      field: field.into(),
      op,
      value,
    }
  }

  pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::new(field, FilterOp::Eq, value.into())
  }

  pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::new(field, FilterOp::Gte, value.into())
  }

  pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::new(field, FilterOp::Lte, value.into())
  }

  pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::new(field, FilterOp::ArrayContains, value.into())
  }

  pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
    Self::new(field, FilterOp::In, Value::Array(values))
  }

  /// Evaluate this filter against a document. Missing fields never match.
  pub fn matches(&self, doc: &Document) -> bool {
    let Some(actual) = doc.value_of(&self.field) else {
      return false;
    };
    match self.op {
      FilterOp::Eq => actual == self.value,
      FilterOp::Lt => compare_values(&actual, &self.value) == Some(Ordering::Less),
      FilterOp::Lte => matches!(
        compare_values(&actual, &self.value),
        Some(Ordering::Less | Ordering::Equal)
      ),
      FilterOp::Gt => compare_values(&actual, &self.value) == Some(Ordering::Greater),
      FilterOp::Gte => matches!(
        compare_values(&actual, &self.value),
        Some(Ordering::Greater | Ordering::Equal)
      ),
      FilterOp::ArrayContains => actual
        .as_array()
        .map(|items| items.contains(&self.value))
        .unwrap_or(false),
      FilterOp::In => self
        .value
        .as_array()
        .map(|candidates| candidates.contains(&actual))
        .unwrap_or(false),
    }
  }
}

/// Compare two JSON scalars of the same kind. Values of different kinds (or
/// non-scalars) are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
    (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
    (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
    (Value::Null, Value::Null) => Some(Ordering::Equal),
    _ => None,
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
  #[default]
  Asc,
  Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBySpec {
  pub field: String,
  #[serde(default)]
  pub direction: OrderDirection,
}

/// Options for a collection query: filters (all must hold), one sort key and
/// an optional result-count limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
  #[serde(default)]
  pub filters: Vec<FieldFilter>,
  #[serde(default)]
  pub order_by: Option<OrderBySpec>,
  #[serde(default)]
  pub limit: Option<usize>,
}

impl QueryOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn filter(mut self, filter: FieldFilter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
    self.order_by = Some(OrderBySpec {
      field: field.into(),
      direction,
    });
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn matches(&self, doc: &Document) -> bool {
    self.filters.iter().all(|f| f.matches(doc))
  }

  /// Filter, sort and truncate a set of documents the way a store would.
  /// Documents missing the sort field sort last.
  pub fn apply(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
    let mut out: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();
    if let Some(order) = &self.order_by {
      out.sort_by(|a, b| {
        let ord = match (a.value_of(&order.field), b.value_of(&order.field)) {
          (Some(x), Some(y)) => compare_values(&x, &y).unwrap_or(Ordering::Equal),
          (Some(_), None) => return Ordering::Less,
          (None, Some(_)) => return Ordering::Greater,
          (None, None) => Ordering::Equal,
        };
        match order.direction {
          OrderDirection::Asc => ord,
          OrderDirection::Desc => ord.reverse(),
        }
      });
    }
    if let Some(limit) = self.limit {
      out.truncate(limit);
    }
    out
  }

  /// Filters sorted by field then operator, so two option sets that differ
  /// only in filter order produce the same cache key.
  pub fn canonical(&self) -> QueryOptions {
    let mut filters = self.filters.clone();
    filters.sort_by(|a, b| {
      a.field
        .cmp(&b.field)
        .then_with(|| format!("{:?}", a.op).cmp(&format!("{:?}", b.op)))
        .then_with(|| a.value.to_string().cmp(&b.value.to_string()))
    });
    QueryOptions {
      filters,
      order_by: self.order_by.clone(),
      limit: self.limit,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn doc(id: &str, data: Value) -> Document {
    Document::new("venues", id, data)
  }

  #[test]
  fn deserialize_query_options() {
    let json = r#"{
      "filters": [{"field": "city", "op": "eq", "value": "Lyon"}],
      "order_by": {"field": "name"},
      "limit": 10
    }"#;
    let options: QueryOptions = serde_json::from_str(json).unwrap();
    assert_eq!(options.filters.len(), 1);
    assert_eq!(options.filters[0].op, FilterOp::Eq);
    assert_eq!(options.order_by.unwrap().direction, OrderDirection::Asc);
    assert_eq!(options.limit, Some(10));
  }

  #[test]
  fn prefix_range_matches_like_the_store() {
    let options = QueryOptions::new()
      .filter(FieldFilter::gte("name_lower", "la"))
      .filter(FieldFilter::lte("name_lower", "la\u{f8ff}"));
    assert!(options.matches(&doc("1", json!({"name_lower": "la cigale"}))));
    assert!(!options.matches(&doc("2", json!({"name_lower": "le trianon"}))));
    assert!(!options.matches(&doc("3", json!({}))));
  }

  #[test]
  fn array_contains_and_in() {
    let d = doc("1", json!({"artists": ["a1", "a2"], "status": "confirmed"}));
    assert!(FieldFilter::array_contains("artists", "a2").matches(&d));
    assert!(!FieldFilter::array_contains("artists", "a3").matches(&d));
    assert!(FieldFilter::is_in("status", vec![json!("draft"), json!("confirmed")]).matches(&d));
  }

  #[test]
  fn apply_sorts_and_limits() {
    let docs = vec![
      doc("1", json!({"capacity": 300})),
      doc("2", json!({"capacity": 1200})),
      doc("3", json!({})),
      doc("4", json!({"capacity": 50})),
    ];
    let out = QueryOptions::new()
      .order_by("capacity", OrderDirection::Desc)
      .limit(3)
      .apply(docs);
    let ids: Vec<_> = out.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "1", "4"]);
  }

  #[test]
  fn canonical_ignores_filter_order() {
    let a = QueryOptions::new()
      .filter(FieldFilter::eq("b", 1))
      .filter(FieldFilter::eq("a", 2));
    let b = QueryOptions::new()
      .filter(FieldFilter::eq("a", 2))
      .filter(FieldFilter::eq("b", 1));
    assert_eq!(a.canonical(), b.canonical());
  }
}
