use serde::{Deserialize, Serialize};

use crate::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
  Insert,
  Update,
  Delete,
}

impl std::str::FromStr for ChangeOperation {
  type Err = String;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "INSERT" => Ok(Self::Insert),
      "UPDATE" => Ok(Self::Update),
      "DELETE" => Ok(Self::Delete),
      _ => Err(format!("Unknown operation: {}", s)),
    }
  }
}

/// A single change emitted by a document store's change feed.
///
/// `document` carries the new state for inserts and updates and the last
/// known state for deletes (when the store still has it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChange {
  pub collection: String,
  pub id: String,
  pub operation: ChangeOperation,
  pub document: Option<Document>,
}

impl DocumentChange {
  pub fn upsert(operation: ChangeOperation, document: Document) -> Self {
    Self {
      collection: document.collection.clone(),
      id: document.id.clone(),
      operation,
      document: Some(document),
    }
  }

  pub fn delete(collection: &str, id: &str, last: Option<Document>) -> Self {
    Self {
      collection: collection.to_string(),
      id: id.to_string(),
      operation: ChangeOperation::Delete,
      document: last,
    }
  }

  pub fn is_delete(&self) -> bool {
    self.operation == ChangeOperation::Delete
  }
}
