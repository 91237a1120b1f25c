/*
 * Created on Sun Jul 26 2026
*/

//! Leaf delta-chain records.

use {
    crate::{bloom::BloomFilter, common::Bound, common::KeyComparator, mapping::NodeId, sync::atm::Atomic},
    crossbeam_epoch::{Guard, Owned, Shared},
};

/// The consolidated base of a leaf chain: a sorted-by-key item list plus
/// the key range this node claims.
#[derive(Clone)]
pub(crate) struct LeafBase<K, V> {
    pub(crate) low: Bound<K>,
    pub(crate) high: Bound<K>,
    /// Right sibling; `INVALID_ID` if this is the rightmost leaf.
    pub(crate) next: NodeId,
    /// Sorted by key; among equal keys, insertion order is preserved.
    pub(crate) items: Vec<(K, V)>,
}

/// One record in a leaf's delta chain. Every variant but `Base` and
/// `Remove` carries a `child` pointer to the record it patches.
pub(crate) enum LeafRecord<K, V> {
    Base(LeafBase<K, V>),
    Insert {
        key: K,
        value: V,
        child: Atomic<LeafRecord<K, V>>,
    },
    Delete {
        key: K,
        value: V,
        child: Atomic<LeafRecord<K, V>>,
    },
    /// Posted once this node outgrows its upper item-count threshold.
    /// Readers whose search key falls at or past `split_key` must jump
    /// to `new_right` directly rather than continue down `child`.
    Split {
        split_key: K,
        new_right: NodeId,
        child: Atomic<LeafRecord<K, V>>,
    },
    /// A completed merge: the right sibling's base is embedded by value
    /// (cloned once, at merge time) rather than aliased through a raw
    /// pointer with a lifetime that would outlive any single epoch
    /// guard — see DESIGN.md's resolution of the cyclic-pointer note.
    Merge {
        merge_key: K,
        right: Box<LeafBase<K, V>>,
        removed_id: NodeId,
        child: Atomic<LeafRecord<K, V>>,
    },
    /// Terminal: this NodeID is logically destroyed. Carries the base
    /// the chain consolidated to right before removal, since once this
    /// becomes the chain head nothing else is reachable through it —
    /// the help-along merge step needs that snapshot as its source.
    Remove {
        removed_id: NodeId,
        base: Box<LeafBase<K, V>>,
    },
}

impl<K, V> LeafRecord<K, V> {
    fn child<'g>(&self, g: &'g Guard) -> Option<Shared<'g, LeafRecord<K, V>>> {
        match self {
            Self::Base(_) | Self::Remove { .. } => None,
            Self::Insert { child, .. }
            | Self::Delete { child, .. }
            | Self::Split { child, .. }
            | Self::Merge { child, .. } => Some(child.ld_acq(g)),
        }
    }
}

/// `Some(removed_id)` iff `head` is itself a terminal `Remove` marker:
/// the caller must jump to the left sibling and help finish the merge
/// rather than read this chain directly.
pub(crate) fn as_remove<K, V>(head: Shared<'_, LeafRecord<K, V>>) -> Option<NodeId> {
    match unsafe { head.as_ref() } {
        Some(LeafRecord::Remove { removed_id, .. }) => Some(*removed_id),
        _ => None,
    }
}

/// If `head`'s chain carries a `Split` whose `split_key <= search_key`,
/// returns the right sibling `search_key` now belongs to. The caller
/// must re-resolve (and retry, since the sibling's own chain might
/// itself have split again) rather than read `head` directly.
pub(crate) fn split_redirect<'g, K, V, C: KeyComparator<K>>(
    head: Shared<'g, LeafRecord<K, V>>,
    search_key: &K,
    cmp: &C,
    g: &'g Guard,
) -> Option<NodeId> {
    let mut cur = head;
    loop {
        let node = unsafe {
            match cur.as_ref() {
                Some(n) => n,
                None => return None,
            }
        };
        if let LeafRecord::Split { split_key, new_right, .. } = node {
            if matches!(cmp.compare(search_key, split_key), std::cmp::Ordering::Greater | std::cmp::Ordering::Equal) {
                return Some(*new_right);
            }
        }
        match node.child(g) {
            Some(next) => cur = next,
            None => return None,
        }
    }
}

/// Returns the first `Split` delta's key and target found while walking
/// `head` toward the base, if any. Used by a caller that already knows
/// (via [`split_redirect`]) that a split exists somewhere in this chain
/// and wants to help post its separator to the parent.
pub(crate) fn first_split<'g, K, V>(head: Shared<'g, LeafRecord<K, V>>, g: &'g Guard) -> Option<(&'g K, NodeId)> {
    let mut cur = head;
    loop {
        let node = unsafe { cur.as_ref()? };
        if let LeafRecord::Split { split_key, new_right, .. } = node {
            return Some((split_key, *new_right));
        }
        match node.child(g) {
            Some(next) => cur = next,
            None => return None,
        }
    }
}

/// Appends every value stored under `key` into `out`, walking the chain
/// from `head` toward its base. A present/deleted bloom pair ensures a
/// key inserted once and deleted once (or vice versa, repeatedly) is
/// reported at most once.
pub(crate) fn collect_values<'g, K: Eq + std::hash::Hash, V: Clone + std::hash::Hash>(
    head: Shared<'g, LeafRecord<K, V>>,
    key: &K,
    seed: u64,
    out: &mut Vec<V>,
    g: &'g Guard,
) {
    let mut present = BloomFilter::new();
    let mut deleted = BloomFilter::new();
    let mut cur = head;
    loop {
        let node = unsafe {
            // the chain is append-only and this guard outlives the walk
            match cur.as_ref() {
                Some(n) => n,
                None => return,
            }
        };
        match node {
            LeafRecord::Insert { key: k, value, .. } if k == key => {
                if !deleted.contains(value, seed) && !present.contains(value, seed) {
                    present.insert(value, seed);
                    out.push(value.clone());
                }
            }
            LeafRecord::Delete { key: k, value, .. } if k == key => {
                if !present.contains(value, seed) {
                    deleted.insert(value, seed);
                }
            }
            LeafRecord::Merge { right, .. } => {
                for (k, v) in right.items.iter() {
                    if k == key && !deleted.contains(v, seed) && !present.contains(v, seed) {
                        present.insert(v, seed);
                        out.push(v.clone());
                    }
                }
            }
            LeafRecord::Base(base) => {
                for (k, v) in base.items.iter() {
                    if k == key && !deleted.contains(v, seed) && !present.contains(v, seed) {
                        out.push(v.clone());
                    }
                }
                return;
            }
            _ => {}
        }
        match node.child(g) {
            Some(next) => cur = next,
            None => return,
        }
    }
}

/// Returns true iff `(key, value)` is live at `head`.
pub(crate) fn contains_pair<'g, K: Eq, V: Eq>(
    head: Shared<'g, LeafRecord<K, V>>,
    key: &K,
    value: &V,
    g: &'g Guard,
) -> bool {
    let mut cur = head;
    loop {
        let node = unsafe {
            match cur.as_ref() {
                Some(n) => n,
                None => return false,
            }
        };
        match node {
            LeafRecord::Insert { key: k, value: v, .. } if k == key && v == value => return true,
            LeafRecord::Delete { key: k, value: v, .. } if k == key && v == value => return false,
            LeafRecord::Merge { right, .. } => {
                if right.items.iter().any(|(k, v)| k == key && v == value) {
                    return true;
                }
            }
            LeafRecord::Base(base) => return base.items.iter().any(|(k, v)| k == key && v == value),
            _ => {}
        }
        match node.child(g) {
            Some(next) => cur = next,
            None => return false,
        }
    }
}

/// Depth of the chain from `head` down to (and including) the base.
pub(crate) fn chain_depth<'g, K, V>(head: Shared<'g, LeafRecord<K, V>>, g: &'g Guard) -> usize {
    let mut cur = head;
    let mut depth = 0;
    loop {
        depth += 1;
        let node = unsafe { cur.deref() };
        match node.child(g) {
            Some(next) => cur = next,
            None => return depth,
        }
    }
}

/// Replays the chain from `head` into a fresh, fully consolidated base.
/// Bloom filters keep replay O(depth) rather than O(depth^2).
pub(crate) fn consolidate<'g, K: Clone + Ord + std::hash::Hash, V: Clone + Eq + std::hash::Hash>(
    head: Shared<'g, LeafRecord<K, V>>,
    seed: u64,
    g: &'g Guard,
) -> LeafBase<K, V> {
    let mut present = BloomFilter::new();
    let mut deleted = BloomFilter::new();
    let mut inserts: Vec<(K, V)> = vec![];
    let mut carried: Vec<(K, V)> = vec![];
    let mut high: Option<Bound<K>> = None;
    let mut next: Option<NodeId> = None;
    let mut cur = head;
    let base = loop {
        let node = unsafe { cur.deref() };
        match node {
            LeafRecord::Insert { key, value, .. } => {
                let k = (key.clone(), value.clone());
                if !deleted.contains(&k, seed) && !present.contains(&k, seed) {
                    present.insert(&k, seed);
                    inserts.push(k);
                }
            }
            LeafRecord::Delete { key, value, .. } => {
                let k = (key.clone(), value.clone());
                if !present.contains(&k, seed) {
                    deleted.insert(&k, seed);
                }
            }
            LeafRecord::Split { split_key, new_right, .. } => {
                if high.is_none() {
                    high = Some(Bound::Key(split_key.clone()));
                    next = Some(*new_right);
                }
            }
            LeafRecord::Merge { right, .. } => {
                carried.extend(right.items.iter().cloned());
                if high.is_none() {
                    high = Some(right.high.clone());
                    next = Some(right.next);
                }
            }
            LeafRecord::Remove { .. } => {}
            LeafRecord::Base(b) => break b,
        }
        match node.child(g) {
            Some(n) => cur = n,
            None => unreachable!("chain must terminate in Base"),
        }
    };
    let low = base.low.clone();
    let high = high.unwrap_or_else(|| base.high.clone());
    let next = next.unwrap_or(base.next);
    // base items (plus anything folded in by a Merge) survive unless a
    // delta in this chain deleted them, and must fall below a tightened
    // high key left behind by a Split; bloom membership and the bound
    // check are the sole tests
    let mut items: Vec<(K, V)> = Vec::with_capacity(base.items.len() + carried.len() + inserts.len());
    for (k, v) in base.items.iter().chain(carried.iter()) {
        let pair = (k.clone(), v.clone());
        if deleted.contains(&pair, seed) {
            continue;
        }
        if matches!(&high, Bound::Key(h) if k >= h) {
            continue;
        }
        items.push(pair);
    }
    items.extend(inserts);
    items.sort_by(|a, b| a.0.cmp(&b.0));
    LeafBase {
        low,
        high,
        next,
        items,
    }
}

/// Allocates a fresh `Insert` delta owning `child` as its next pointer.
pub(crate) fn new_insert<K, V>(key: K, value: V, child: Shared<'_, LeafRecord<K, V>>) -> Owned<LeafRecord<K, V>> {
    Owned::new(LeafRecord::Insert {
        key,
        value,
        child: Atomic::from(child),
    })
}

pub(crate) fn new_delete<K, V>(key: K, value: V, child: Shared<'_, LeafRecord<K, V>>) -> Owned<LeafRecord<K, V>> {
    Owned::new(LeafRecord::Delete {
        key,
        value,
        child: Atomic::from(child),
    })
}

/// Allocates a `Split` delta; `child` is the chain it sits on top of.
pub(crate) fn new_split<K, V>(split_key: K, new_right: NodeId, child: Shared<'_, LeafRecord<K, V>>) -> Owned<LeafRecord<K, V>> {
    Owned::new(LeafRecord::Split {
        split_key,
        new_right,
        child: Atomic::from(child),
    })
}

/// Allocates a `Merge` delta, folding `right`'s content into this chain.
pub(crate) fn new_merge<K, V>(
    merge_key: K,
    right: LeafBase<K, V>,
    removed_id: NodeId,
    child: Shared<'_, LeafRecord<K, V>>,
) -> Owned<LeafRecord<K, V>> {
    Owned::new(LeafRecord::Merge {
        merge_key,
        right: Box::new(right),
        removed_id,
        child: Atomic::from(child),
    })
}

/// Allocates the terminal `Remove` marker, snapshotting `base` for the
/// help-along merge step to read back.
pub(crate) fn new_remove<K, V>(removed_id: NodeId, base: LeafBase<K, V>) -> Owned<LeafRecord<K, V>> {
    Owned::new(LeafRecord::Remove {
        removed_id,
        base: Box::new(base),
    })
}

/// Checks whether `key` falls in `[low, high)` using the tree's comparator.
pub(crate) fn key_in_range<K, C: KeyComparator<K>>(key: &K, low: &Bound<K>, high: &Bound<K>, cmp: &C) -> bool {
    use std::cmp::Ordering::*;
    let low_ok = match low {
        Bound::NegInf => true,
        Bound::PosInf => false,
        Bound::Key(k) => matches!(cmp.compare(k, key), Less | Equal),
    };
    let high_ok = match high {
        Bound::PosInf => true,
        Bound::NegInf => false,
        Bound::Key(k) => matches!(cmp.compare(key, k), Less),
    };
    low_ok && high_ok
}
