//! Cached, relation-aware entity data layer
//!
//! A [`DataLayer`] wires one [`DocumentStore`] and one [`CacheStore`] into
//! entity observers, relation loading, mutations and search boxes.

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod layer;
pub mod mutation;
pub mod relations;
pub mod search;
pub mod store;

pub use cache::{CacheConfig, CacheStats, CacheStore, Related};
pub use config::DataLayerConfig;
pub use error::{DataError, DataResult, DependencyBlock, Operation, StoreError};
pub use fetch::{EntityFetcher, EntityObserver, EntityState, FetchMode, ObserveOptions, RelatedState};
pub use layer::DataLayer;
pub use mutation::{DependencyCheck, Mutation, MutationCoordinator};
pub use relations::{RelatedEntityLoader, RelationDescriptor, RelationKind};
pub use search::{EntityKind, SearchController, SearchOptions, SearchState};
pub use store::{DocumentStore, InMemoryStore, Snapshot, Subscription};
pub use types::{Document, FieldFilter, OrderDirection, QueryOptions};
