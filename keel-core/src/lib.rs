//! KEEL Core - Entity, Query and Error Types
//!
//! Data types shared by every KEEL crate. Nothing in here performs I/O or
//! touches a cache; execution lives in `keel-storage`.

pub mod config;
pub mod entity;
pub mod error;
pub mod filter;
pub mod identity;
pub mod paging;
pub mod query;

pub use config::{CacheConfig, CachePriority, KeelConfig};
pub use entity::Entity;
pub use error::{ConfigError, KeelError, KeelResult, StateError, StorageError, ValidationError};
pub use filter::{compare_values, lookup_path, FilterExpr, FilterOperator, Predicate};
pub use identity::{new_entity_id, EntityId, Timestamp};
pub use paging::PagedResult;
pub use query::{GroupBy, Include, OrderBy, Projection, Query};
