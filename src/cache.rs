//! Key-scoped cache of resolved endpoints.
//!
//! Each key owns a `OnceCell`, so concurrent first lookups for the same key
//! run the initializer once while lookups for other keys proceed untouched.
//! The keys of every resource are tracked so a whole resource can be evicted
//! without scanning or prefix matching.

use std::{collections::HashSet, future::Future, sync::Arc};

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::endpoint::{CacheKey, ExternalEndpoint, ResourceId};

/// A handle whose underlying session must be closed on eviction.
pub trait Releasable: Send + Sync {
    fn release(&self);
}

#[derive(Debug)]
pub struct CacheEntry<H> {
    pub endpoint: ExternalEndpoint,
    pub handle: Option<H>,
}

impl<H> CacheEntry<H> {
    pub const fn new(endpoint: ExternalEndpoint, handle: Option<H>) -> Self {
        Self { endpoint, handle }
    }
}

type Slot<H> = Arc<OnceCell<CacheEntry<H>>>;

pub struct EndpointCache<H> {
    entries: DashMap<CacheKey, Slot<H>>,
    by_resource: DashMap<ResourceId, HashSet<CacheKey>>,
}

impl<H> Default for EndpointCache<H> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            by_resource: DashMap::new(),
        }
    }
}

impl<H: Releasable> EndpointCache<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<ExternalEndpoint> {
        let slot = self.entries.get(key)?.value().clone();
        slot.get().map(|entry| entry.endpoint.clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.get(key).is_some()
    }

    /// Number of resolved entries.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached endpoint for `key`, running `init` to produce it on
    /// a miss. Concurrent callers for one key share a single `init` run; a
    /// failed `init` leaves the key unresolved for the next caller.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        key: &CacheKey,
        init: F,
    ) -> Result<ExternalEndpoint, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry<H>, E>>,
    {
        let slot = self.slot(key);
        let entry = slot.get_or_try_init(init).await?;
        let endpoint = entry.endpoint.clone();

        // Evicted while the initializer ran: nobody can release this entry
        // through the cache anymore, so release it here.
        let current = self
            .entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current.value(), &slot));
        if !current {
            if let Some(handle) = &entry.handle {
                handle.release();
            }
            debug!(message = "Cache entry evicted during resolution.", key = %key);
        }
        Ok(endpoint)
    }

    fn slot(&self, key: &CacheKey) -> Slot<H> {
        let slot = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();
        self.by_resource
            .entry(key.resource.clone())
            .or_default()
            .insert(key.clone());
        slot
    }

    /// Evicts one key, releasing its handle. Returns whether a resolved entry
    /// was removed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        if let Some(mut keys) = self.by_resource.get_mut(&key.resource) {
            keys.remove(key);
        }
        self.by_resource
            .remove_if(&key.resource, |_, keys| keys.is_empty());
        self.evict(key)
    }

    /// Evicts every key of a resource. Returns the number of resolved entries
    /// removed.
    pub fn invalidate_resource(&self, resource: &ResourceId) -> usize {
        let Some((_, keys)) = self.by_resource.remove(resource) else {
            return 0;
        };
        keys.iter().filter(|key| self.evict(key)).count()
    }

    fn evict(&self, key: &CacheKey) -> bool {
        let Some((_, slot)) = self.entries.remove(key) else {
            return false;
        };
        match slot.get() {
            Some(entry) => {
                if let Some(handle) = &entry.handle {
                    handle.release();
                }
                true
            }
            None => false,
        }
    }
}
