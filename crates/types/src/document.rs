use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields tried, in order, when a document needs a human-readable label.
pub const DISPLAY_NAME_FIELDS: [&str; 3] = ["name", "title", "label"];

/// A remote document: its collection, id and JSON body.
///
/// The body is expected to be a JSON object. The id is not duplicated inside
/// the body; use [`Document::to_json`] when a flat representation is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id: String,
  pub collection: String,
  pub data: Value,
}

impl Document {
  pub fn new(collection: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
    Self {
      id: id.into(),
      collection: collection.into(),
      data,
    }
  }

  /// Look up a field, following dotted paths into nested objects
  /// (`"venue.id"`). The pseudo-field `"id"` resolves to the document id
  /// when the body has no `id` key of its own.
  pub fn field(&self, path: &str) -> Option<&Value> {
    let mut current = &self.data;
    for part in path.split('.') {
      current = current.as_object()?.get(part)?;
    }
    Some(current)
  }

  /// Field value as an owned JSON value, with `"id"` falling back to the
  /// document id.
  pub fn value_of(&self, path: &str) -> Option<Value> {
    match self.field(path) {
      Some(v) => Some(v.clone()),
      None if path == "id" => Some(Value::String(self.id.clone())),
      None => None,
    }
  }

  pub fn str_field(&self, path: &str) -> Option<&str> {
    self.field(path).and_then(Value::as_str)
  }

  /// The first non-empty string among [`DISPLAY_NAME_FIELDS`], or the id.
  pub fn display_name(&self) -> &str {
    DISPLAY_NAME_FIELDS
      .iter()
      .filter_map(|f| self.str_field(f))
      .find(|s| !s.is_empty())
      .unwrap_or(self.id.as_str())
  }

  /// Shallow merge of `patch`'s top-level keys over this document's body.
  /// A non-object patch leaves the body untouched.
  pub fn merged(&self, patch: &Value) -> Document {
    let mut data = self.data.clone();
    if let (Some(target), Some(source)) = (data.as_object_mut(), patch.as_object()) {
      for (k, v) in source {
        target.insert(k.clone(), v.clone());
      }
    }
    Document {
      id: self.id.clone(),
      collection: self.collection.clone(),
      data,
    }
  }

  /// The body with `id` inserted, as consumers of the original store expect.
  pub fn to_json(&self) -> Value {
    let mut data = self.data.clone();
    if let Some(obj) = data.as_object_mut() {
      obj.insert("id".to_string(), Value::String(self.id.clone()));
    }
    data
  }
}
