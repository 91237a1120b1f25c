/*
 * Created on Sun Jul 26 2026
*/

//! The NodeID indirection table. Every logical node is addressed
//! by a small integer resolved through this table rather than a raw
//! pointer, so that a Bw-Tree delta chain can be atomically replaced
//! (consolidation, split, merge) without rewriting every pointer that
//! refers to it by identity.

use {
    crate::sync::{atm::Atomic, stack::Stack},
    crossbeam_epoch::{Guard, Owned, Pointable, Shared},
    std::sync::atomic::{AtomicU64, Ordering},
};

/// A logical node identifier. `INVALID_ID` marks "no right sibling"
/// (rightmost node) or an unused slot.
pub type NodeId = u64;
pub const INVALID_ID: NodeId = u64::MAX;

/// Fixed-capacity mapping table: NodeID -> current delta-chain head.
///
/// `CAP` must be a power of two; callers validate this once at
/// `IndexOptions::build()` time (see [`crate::error::ConfigError`]),
/// this type itself just indexes with a mask.
pub(crate) struct MappingTable<N: Pointable> {
    slots: Box<[Atomic<N>]>,
    mask: u64,
    next_id: AtomicU64,
    free_ids: Stack<NodeId>,
}

impl<N: Pointable> MappingTable<N> {
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Atomic::null());
        }
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity as u64 - 1,
            next_id: AtomicU64::new(0),
            free_ids: Stack::new(),
        }
    }

    #[inline(always)]
    fn slot(&self, id: NodeId) -> &Atomic<N> {
        &self.slots[(id & self.mask) as usize]
    }

    /// Allocates a fresh id, preferring a recycled one over growing the
    /// monotonic counter. Panics if the table is exhausted (a
    /// misconfiguration: `mapping_table_capacity` too small for the
    /// working set).
    pub(crate) fn alloc_id(&self, g: &Guard) -> NodeId {
        if let Some(id) = self.free_ids.pop(g) {
            return id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        assert!(
            id <= self.mask,
            "mapping table exhausted: increase mapping_table_capacity"
        );
        id
    }

    /// Publishes the initial chain for a freshly allocated id. Only
    /// legal when the slot is currently null.
    pub(crate) fn install_new<'g>(&self, id: NodeId, ptr: Owned<N>, g: &'g Guard) {
        let shared = ptr.into_shared(g);
        self.slot(id).store(shared, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn load<'g>(&self, id: NodeId, g: &'g Guard) -> Shared<'g, N> {
        self.slot(id).ld_acq(g)
    }

    /// The sole linearization point for every structural mutation:
    /// exactly-once CAS on a mapping-table slot.
    pub(crate) fn cas_replace<'g>(
        &self,
        id: NodeId,
        old: Shared<'g, N>,
        new: Owned<N>,
        g: &'g Guard,
    ) -> Result<Shared<'g, N>, Owned<N>> {
        self.slot(id)
            .cx(old, new, Ordering::Release, Ordering::Relaxed, g)
            .map_err(|e| e.new)
    }

    /// CAS where the replacement is an already-published `Shared` rather
    /// than freshly allocated `Owned` memory. Used to undo a transient
    /// marker (e.g. an `InnerAbort`) back onto the chain it sat over,
    /// without fabricating a second owner for memory that's already live.
    pub(crate) fn cas_replace_shared<'g>(
        &self,
        id: NodeId,
        old: Shared<'g, N>,
        new: Shared<'g, N>,
        g: &'g Guard,
    ) -> Result<Shared<'g, N>, Shared<'g, N>> {
        self.slot(id)
            .cx(old, new, Ordering::Release, Ordering::Relaxed, g)
            .map_err(|e| e.new)
    }

    /// Marks a slot unused. Only called by the reclaimer once the
    /// epoch that retired the chain at `id` has fully drained; pushes
    /// the id onto the free list so a future `alloc_id` can reuse it.
    pub(crate) fn invalidate(&self, id: NodeId, g: &Guard) {
        self.slot(id).store(Shared::null(), Ordering::Release);
        self.free_ids.push(id, g);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::pin;

    #[test]
    fn alloc_is_monotonic_then_recycles() {
        let t: MappingTable<u64> = MappingTable::new(8);
        let g = pin();
        let a = t.alloc_id(&g);
        let b = t.alloc_id(&g);
        assert_ne!(a, b);
        t.invalidate(a, &g);
        let c = t.alloc_id(&g);
        assert_eq!(c, a, "freed ids are preferred over growing the counter");
    }

    #[test]
    fn install_and_load_round_trips() {
        let t: MappingTable<u64> = MappingTable::new(8);
        let g = pin();
        let id = t.alloc_id(&g);
        t.install_new(id, Owned::new(42u64), &g);
        let loaded = t.load(id, &g);
        assert_eq!(unsafe { *loaded.deref() }, 42);
    }
}
