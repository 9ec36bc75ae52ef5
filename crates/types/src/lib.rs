mod change;
mod document;
mod filter;

pub use change::{ChangeOperation, DocumentChange};
pub use document::{Document, DISPLAY_NAME_FIELDS};
pub use filter::{
  compare_values, FieldFilter, FilterOp, OrderBySpec, OrderDirection, QueryOptions,
};
