//! KEEL Storage - Caching Generic Repository
//!
//! Repositories read through a shared [`ResultCache`] and stage writes in a
//! per-session [`ChangeTracker`]; a [`UnitOfWork`] commits those writes
//! atomically through a [`Store`]. [`InMemoryStore`] is the bundled store.

pub mod cache;
pub mod context;
pub mod memory;
pub mod queryable;
pub mod repository;
pub mod store;
pub mod tracking;
pub mod unit_of_work;

pub use cache::{
    CacheBackend, CacheKey, CacheStats, EntryPolicy, InMemoryCacheBackend, LiveKeyRegistry,
    ResultCache,
};
pub use context::DataContext;
pub use memory::InMemoryStore;
pub use queryable::Queryable;
pub use repository::{Repository, RepositoryOptions};
pub use store::{NavigationKind, Store};
pub use tracking::{Change, ChangeKind, ChangeSet, ChangeTracker, EntityState};
pub use unit_of_work::UnitOfWork;
