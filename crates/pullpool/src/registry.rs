//! Instance registry - bookkeeping for every live resource instance.
//!
//! Entries own their instance while free. While busy the instance is lent
//! to exactly one dispatch worker and the entry holds `None`, which makes
//! double-lending impossible by construction.

/// Unique identity of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ResourceId(uuid::Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) struct ResourceEntry<T> {
    id: ResourceId,
    instance: Option<T>,
    busy: bool,
}

/// What a dispatch worker received from [`Registry::acquire`].
pub(crate) enum Lease<T> {
    /// A free instance, already marked busy.
    Reused { id: ResourceId, instance: T },
    /// Capacity reserved for a new instance; the worker runs the constructor
    /// and then calls [`Registry::register_busy`] or [`Registry::abandon_creation`].
    Create,
}

pub(crate) struct Registry<T> {
    entries: Vec<ResourceEntry<T>>,
    /// Constructors currently running. Counted against the limit so the
    /// registry cannot overshoot while a creation is suspended.
    creating: usize,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            creating: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn creating(&self) -> usize {
        self.creating
    }

    pub fn busy_count(&self) -> usize {
        self.entries.iter().filter(|e| e.busy).count()
    }

    /// Every entry is free and no constructor is running.
    pub fn is_quiescent(&self) -> bool {
        self.creating == 0 && self.entries.iter().all(|e| !e.busy)
    }

    /// Whether [`acquire`](Self::acquire) would succeed under `limit`.
    pub fn can_acquire(&self, limit: usize) -> bool {
        self.entries.iter().any(|e| !e.busy) || self.entries.len() + self.creating < limit
    }

    /// Obtain an instance for a dispatch worker.
    ///
    /// A free entry is always preferred over creating a new one. Returns
    /// `None` when every entry is busy and the registry is full.
    pub fn acquire(&mut self, limit: usize) -> Option<Lease<T>> {
        if let Some(entry) = self.entries.iter_mut().find(|e| !e.busy) {
            let instance = entry.instance.take()?;
            entry.busy = true;
            return Some(Lease::Reused {
                id: entry.id,
                instance,
            });
        }

        if self.entries.len() + self.creating < limit {
            self.creating += 1;
            return Some(Lease::Create);
        }

        None
    }

    /// Register a freshly constructed instance. The caller keeps the
    /// instance, so the new entry starts out busy.
    pub fn register_busy(&mut self) -> ResourceId {
        self.creating = self.creating.saturating_sub(1);
        let id = ResourceId::new();
        self.entries.push(ResourceEntry {
            id,
            instance: None,
            busy: true,
        });
        id
    }

    /// Release a reservation whose constructor failed.
    pub fn abandon_creation(&mut self) {
        self.creating = self.creating.saturating_sub(1);
    }

    /// Return a lent instance and mark its entry free.
    ///
    /// If the entry is unknown (already removed), the instance is handed
    /// back to the caller.
    pub fn mark_free(&mut self, id: ResourceId, instance: T) -> Result<(), T> {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.instance = Some(instance);
                entry.busy = false;
                Ok(())
            }
            None => Err(instance),
        }
    }

    /// Remove a free entry and return its instance.
    pub fn evict(&mut self, id: ResourceId) -> Option<T> {
        let pos = self.entries.iter().position(|e| e.id == id && !e.busy)?;
        self.entries.remove(pos).instance
    }

    /// Drop the bookkeeping for a busy entry whose instance the caller holds.
    pub fn unregister(&mut self, id: ResourceId) {
        self.entries.retain(|e| e.id != id);
    }

    /// Snapshot and clear the registry, yielding every held instance.
    pub fn drain(&mut self) -> Vec<(ResourceId, T)> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .filter_map(|e| e.instance.map(|instance| (e.id, instance)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_id<T>(lease: &Lease<T>) -> Option<ResourceId> {
        match lease {
            Lease::Reused { id, .. } => Some(*id),
            Lease::Create => None,
        }
    }

    #[test]
    fn resource_ids_are_unique() {
        assert_ne!(ResourceId::new(), ResourceId::new());
    }

    #[test]
    fn empty_registry_reserves_creation() {
        let mut registry: Registry<u32> = Registry::new();
        assert!(registry.can_acquire(1));
        assert!(matches!(registry.acquire(1), Some(Lease::Create)));
        assert_eq!(registry.creating(), 1);

        // Reservation counts against the limit.
        assert!(!registry.can_acquire(1));
        assert!(registry.acquire(1).is_none());
    }

    #[test]
    fn free_entry_preferred_over_creation() {
        let mut registry = Registry::new();
        assert!(matches!(registry.acquire(2), Some(Lease::Create)));
        let id = registry.register_busy();
        registry.mark_free(id, 10_u32).unwrap();

        let lease = registry.acquire(2).unwrap();
        assert_eq!(lease_id(&lease), Some(id));
        if let Lease::Reused { instance, .. } = lease {
            assert_eq!(instance, 10);
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.busy_count(), 1);
    }

    #[test]
    fn full_registry_with_busy_entries_is_unavailable() {
        let mut registry: Registry<u32> = Registry::new();
        registry.acquire(1);
        registry.register_busy();

        assert!(registry.acquire(1).is_none());
        assert!(!registry.is_quiescent());
    }

    #[test]
    fn abandoned_creation_frees_capacity() {
        let mut registry: Registry<u32> = Registry::new();
        registry.acquire(1);
        registry.abandon_creation();

        assert_eq!(registry.creating(), 0);
        assert!(registry.is_empty());
        assert!(registry.can_acquire(1));
    }

    #[test]
    fn evict_only_removes_free_entries() {
        let mut registry = Registry::new();
        registry.acquire(2);
        let busy = registry.register_busy();
        assert!(registry.evict(busy).is_none());

        registry.mark_free(busy, 5_u32).unwrap();
        assert_eq!(registry.evict(busy), Some(5));
        assert!(registry.is_empty());
    }

    #[test]
    fn mark_free_unknown_entry_returns_instance() {
        let mut registry = Registry::new();
        assert_eq!(registry.mark_free(ResourceId::new(), 3_u32), Err(3));
    }

    #[test]
    fn drain_takes_all_free_instances() {
        let mut registry = Registry::new();
        for value in [1_u32, 2] {
            registry.acquire(2);
            let id = registry.register_busy();
            registry.mark_free(id, value).unwrap();
        }
        assert!(registry.is_quiescent());

        let mut drained: Vec<u32> = registry.drain().into_iter().map(|(_, v)| v).collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert!(registry.is_empty());
    }
}
