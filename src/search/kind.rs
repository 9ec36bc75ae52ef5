//! Entity kinds a search box can look up and create

use serde_json::{json, Map, Value};

/// Suffix of the lowercase copy of a kind's name field, written on create so
/// remote prefix queries can be case-insensitive.
pub const LOWERCASE_SUFFIX: &str = "Lowercase";

/// A kind not covered by the built-in ones.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomKind {
  pub name_field: String,
  pub search_fields: Vec<String>,
  /// Fields every created entity starts with
  pub defaults: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
  Contact,
  Venue,
  Artist,
  Structure,
  Concert,
  Custom(CustomKind),
}

impl EntityKind {
  /// Field holding the entity's display name.
  pub fn name_field(&self) -> &str {
    match self {
      EntityKind::Concert => "title",
      EntityKind::Custom(custom) => &custom.name_field,
      _ => "name",
    }
  }

  /// Lowercase shadow of [`name_field`](Self::name_field).
  pub fn lowercase_field(&self) -> String {
    format!("{}{}", self.name_field(), LOWERCASE_SUFFIX)
  }

  /// Fields matched against the search term by default.
  pub fn search_fields(&self) -> Vec<String> {
    let fields: &[&str] = match self {
      EntityKind::Contact => &["name", "firstName", "email"],
      EntityKind::Venue => &["name", "city"],
      EntityKind::Artist => &["name", "genre"],
      EntityKind::Structure => &["name", "legalName", "city"],
      EntityKind::Concert => &["title", "venueName"],
      EntityKind::Custom(custom) => return custom.search_fields.clone(),
    };
    fields.iter().map(|f| f.to_string()).collect()
  }

  /// Body of an entity created from a search term.
  pub fn defaults(&self, term: &str) -> Map<String, Value> {
    let mut body = match self {
      EntityKind::Contact => json!({
        "firstName": "",
        "email": "",
        "phone": "",
      }),
      EntityKind::Venue => json!({
        "address": "",
        "postalCode": "",
        "city": "",
        "capacity": null,
      }),
      EntityKind::Artist => json!({
        "genre": "",
        "members": [],
      }),
      EntityKind::Structure => json!({
        "legalName": term,
        "type": "",
        "city": "",
      }),
      EntityKind::Concert => json!({
        "date": null,
        "status": "draft",
      }),
      EntityKind::Custom(custom) => Value::Object(custom.defaults.clone()),
    };

    let mut map = match body.take() {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    map.insert(self.name_field().to_string(), Value::String(term.to_string()));
    map.insert(self.lowercase_field(), Value::String(term.to_lowercase()));
    map
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_carry_name_and_lowercase_shadow() {
    let body = EntityKind::Venue.defaults("La Cigale");
    assert_eq!(body["name"], "La Cigale");
    assert_eq!(body["nameLowercase"], "la cigale");
    assert!(body.contains_key("city"));

    let concert = EntityKind::Concert.defaults("Release Party");
    assert_eq!(concert["title"], "Release Party");
    assert_eq!(concert["titleLowercase"], "release party");
    assert_eq!(concert["status"], "draft");
  }

  #[test]
  fn custom_kind_uses_its_own_fields() {
    let kind = EntityKind::Custom(CustomKind {
      name_field: "label".into(),
      search_fields: vec!["label".into(), "code".into()],
      defaults: Map::new(),
    });
    assert_eq!(kind.lowercase_field(), "labelLowercase");
    assert_eq!(kind.search_fields(), vec!["label", "code"]);
  }
}
