//! Read-through LRU cache in front of an operation catalog
//!
//! Only public catalog reads go through the cache. Completion reads operation
//! coefficients inside its own transaction and never sees cached entries.

use async_trait::async_trait;
use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use super::traits::OperationCatalog;
use crate::{
    models::{NewOperation, Operation, OperationFilter, OperationId, OperationPatch},
    Result,
};

struct Entries {
    lru: LruCache<OperationId, Operation>,
    /// Bumped on every invalidation; a miss only fills the cache if no
    /// write landed while it was reading.
    generation: u64,
}

pub struct CachedCatalog {
    inner: Arc<dyn OperationCatalog>,
    cache: Option<Mutex<Entries>>,
}

impl CachedCatalog {
    /// A capacity of zero disables caching.
    pub fn new(inner: Arc<dyn OperationCatalog>, capacity: usize) -> Self {
        Self {
            inner,
            cache: NonZeroUsize::new(capacity).map(|cap| {
                Mutex::new(Entries {
                    lru: LruCache::new(cap),
                    generation: 0,
                })
            }),
        }
    }

    fn cached(&self, id: OperationId) -> (Option<Operation>, Option<u64>) {
        match self.cache.as_ref().map(|c| c.lock()) {
            Some(Ok(mut entries)) => {
                let generation = entries.generation;
                (entries.lru.get(&id).cloned(), Some(generation))
            }
            _ => (None, None),
        }
    }

    fn remember(&self, operation: &Operation) {
        if let Some(Ok(mut entries)) = self.cache.as_ref().map(|c| c.lock()) {
            entries.lru.put(operation.id, operation.clone());
        }
    }

    fn remember_if_current(&self, operation: &Operation, seen: u64) {
        if let Some(Ok(mut entries)) = self.cache.as_ref().map(|c| c.lock()) {
            if entries.generation == seen {
                entries.lru.put(operation.id, operation.clone());
            }
        }
    }

    fn forget(&self, id: OperationId) {
        if let Some(Ok(mut entries)) = self.cache.as_ref().map(|c| c.lock()) {
            entries.lru.pop(&id);
            entries.generation = entries.generation.wrapping_add(1);
        }
    }
}

#[async_trait]
impl OperationCatalog for CachedCatalog {
    async fn get(&self, id: OperationId) -> Result<Option<Operation>> {
        let (hit, generation) = self.cached(id);
        if let Some(hit) = hit {
            return Ok(Some(hit));
        }
        let found = self.inner.get(id).await?;
        if let (Some(operation), Some(seen)) = (&found, generation) {
            self.remember_if_current(operation, seen);
        }
        Ok(found)
    }

    async fn list(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        self.inner.list(filter).await
    }

    async fn create(&self, operation: NewOperation) -> Result<Operation> {
        let created = self.inner.create(operation).await?;
        self.remember(&created);
        Ok(created)
    }

    async fn update(&self, id: OperationId, patch: &OperationPatch) -> Result<Option<Operation>> {
        self.forget(id);
        let updated = self.inner.update(id, patch).await?;
        self.forget(id);
        if let Some(operation) = &updated {
            self.remember(operation);
        }
        Ok(updated)
    }

    async fn archive(&self, id: OperationId) -> Result<Option<Operation>> {
        self.forget(id);
        let archived = self.inner.archive(id).await?;
        self.forget(id);
        if let Some(operation) = &archived {
            self.remember(operation);
        }
        Ok(archived)
    }
}
