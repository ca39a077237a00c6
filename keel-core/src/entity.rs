//! The entity marker trait.

use serde::{de::DeserializeOwned, Serialize};

use crate::EntityId;

/// A persisted record with exactly one identity field.
///
/// Repositories, the change tracker and the result cache are all generic over
/// this trait. Entities cross the storage boundary as `serde_json::Value`, so
/// field names used in predicates, orderings and projections are the
/// serialised field names.
///
/// # Implementation Requirements
///
/// - `entity_id()` must return the value of the identity field
/// - `entity_type()` must return the same value for every instance; it is
///   used as the cache invalidation group and as the cache key suffix
/// - Implementations must be `Send + Sync + 'static` for async compatibility
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Get the unique identifier for this entity.
    fn entity_id(&self) -> EntityId;

    /// Fully-qualified name of the entity type.
    fn entity_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}
