use crate::id::ResourceType;
use std::collections::BTreeSet;

/// Tracks which resource types have changed since the cache last synced.
///
/// The graph store marks types as it mutates; the engine drains the set into
/// the resource state cache before any cached read.
#[derive(Debug, Clone, Default)]
pub struct DirtyTracker {
    dirty_types: BTreeSet<ResourceType>,
}

impl DirtyTracker {
    /// Create a new tracker with nothing dirty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a single resource type as changed.
    pub fn mark_type(&mut self, resource: &ResourceType) {
        if !self.dirty_types.contains(resource) {
            self.dirty_types.insert(resource.clone());
        }
    }

    /// Mark every type yielded by the iterator as changed.
    pub fn mark_types<'a>(&mut self, resources: impl IntoIterator<Item = &'a ResourceType>) {
        for resource in resources {
            self.mark_type(resource);
        }
    }

    /// Returns `true` if any type is waiting to be invalidated.
    pub fn is_dirty(&self) -> bool {
        !self.dirty_types.is_empty()
    }

    /// Returns `true` if the given type is waiting to be invalidated.
    pub fn is_type_dirty(&self, resource: &ResourceType) -> bool {
        self.dirty_types.contains(resource)
    }

    /// Drain the dirty set, leaving the tracker clean.
    pub fn take_dirty_types(&mut self) -> BTreeSet<ResourceType> {
        std::mem::take(&mut self.dirty_types)
    }
}
