//! Query result caching.
//!
//! - [`CacheKey`]: SHA-256 key derived from a rendered query, its entity type
//!   and its result type
//! - [`LiveKeyRegistry`]: populated keys grouped by entity type
//! - [`CacheBackend`] / [`InMemoryCacheBackend`]: exact-key storage with
//!   absolute and sliding expiration
//! - [`ResultCache`]: get-or-compute over the above, with invalidation per
//!   entity type
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(ResultCache::new(&CacheConfig::default()));
//! let context = DataContext::with_cache(store, cache.clone(), KeelConfig::default())?;
//! ```

pub mod key;
pub mod memory_backend;
pub mod registry;
pub mod result_cache;
pub mod traits;

pub use key::CacheKey;
pub use memory_backend::InMemoryCacheBackend;
pub use registry::LiveKeyRegistry;
pub use result_cache::ResultCache;
pub use traits::{CacheBackend, CacheStats, EntryPolicy};
