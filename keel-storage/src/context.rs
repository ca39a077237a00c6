//! Data context: shared store and cache, one unit of work per operation.

use std::sync::Arc;

use keel_core::{KeelConfig, KeelResult};

use crate::cache::ResultCache;
use crate::repository::RepositoryOptions;
use crate::store::Store;
use crate::unit_of_work::UnitOfWork;

/// Long-lived owner of the store and the process-wide result cache.
pub struct DataContext<S: Store> {
    store: Arc<S>,
    cache: Arc<ResultCache>,
    config: KeelConfig,
}

impl<S: Store> DataContext<S> {
    /// Context with a fresh cache built from `config.cache`.
    pub fn new(store: S, config: KeelConfig) -> KeelResult<Self> {
        config.validate()?;
        let cache = Arc::new(ResultCache::new(&config.cache));
        Ok(Self {
            store: Arc::new(store),
            cache,
            config,
        })
    }

    /// Context over an existing store and cache, e.g. one cache shared by
    /// several contexts.
    pub fn with_cache(store: Arc<S>, cache: Arc<ResultCache>, config: KeelConfig) -> KeelResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            cache,
            config,
        })
    }

    /// Open a new unit of work.
    pub fn begin(&self) -> UnitOfWork<S> {
        UnitOfWork::new(
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            RepositoryOptions::from(&self.config),
        )
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn config(&self) -> &KeelConfig {
        &self.config
    }
}

impl<S: Store> Clone for DataContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            config: self.config.clone(),
        }
    }
}
