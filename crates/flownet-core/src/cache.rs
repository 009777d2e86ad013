//! Read-through, time-to-live cache of network-wide resource state.
//!
//! The cache never owns authoritative values. Every read returns a copy;
//! stale or missing entries are recomputed from the graph store.

use crate::fixed::Ticks;
use crate::graph::GraphStore;
use crate::id::ResourceType;
use crate::resource::ResourceState;
use std::collections::HashMap;

/// A cached aggregate with its expiry tick.
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    state: ResourceState,
    expires_at: Ticks,
}

/// Hit/miss counters, useful for tuning the TTL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Per-resource-type aggregate state with a fixed TTL.
#[derive(Debug, Clone)]
pub struct ResourceStateCache {
    ttl: Ticks,
    entries: HashMap<ResourceType, CacheEntry>,
    stats: CacheStats,
}

impl ResourceStateCache {
    pub fn new(ttl: Ticks) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn ttl(&self) -> Ticks {
        self.ttl
    }

    /// Change the TTL. Existing entries keep their original expiry.
    pub fn set_ttl(&mut self, ttl: Ticks) {
        self.ttl = ttl;
    }

    /// Return the fresh cached state for `resource`, if any. Never recomputes.
    pub fn peek(&self, resource: &ResourceType, now: Ticks) -> Option<ResourceState> {
        self.entries
            .get(resource)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.state)
    }

    /// Read through the cache. On a fresh hit the cached copy is returned;
    /// otherwise the aggregate is recomputed from `graph` and stored. Returns
    /// `None` when no active node holds the type.
    pub fn get_state(
        &mut self,
        resource: &ResourceType,
        now: Ticks,
        graph: &GraphStore,
    ) -> Option<ResourceState> {
        if let Some(state) = self.peek(resource, now) {
            self.stats.hits += 1;
            return Some(state);
        }
        self.stats.misses += 1;

        match graph.aggregate_resource(resource) {
            Some(state) => {
                self.set_state(resource.clone(), state, now);
                Some(state)
            }
            None => {
                self.entries.remove(resource);
                None
            }
        }
    }

    /// Store a state for `resource`, fresh for one TTL from `now`.
    pub fn set_state(&mut self, resource: ResourceType, state: ResourceState, now: Ticks) {
        self.entries.insert(
            resource,
            CacheEntry {
                state,
                expires_at: now.saturating_add(self.ttl),
            },
        );
    }

    /// Drop the entry for `resource` so the next read recomputes it.
    pub fn invalidate(&mut self, resource: &ResourceType) {
        if self.entries.remove(resource).is_some() {
            self.stats.invalidations += 1;
        }
    }

    /// Drop every entry whose type the graph reports as changed.
    pub fn sync_with(&mut self, graph: &mut GraphStore) {
        for resource in graph.take_dirty_types() {
            self.invalidate(&resource);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
