/*
 * Created on Sun Jul 26 2026
*/

//! Inner delta-chain records.

use {
    crate::{common::Bound, common::KeyComparator, mapping::NodeId, sync::atm::Atomic},
    crossbeam_epoch::{Guard, Owned, Shared},
};

/// A separator: everything in `[key, next_key)` routes to `child_id`.
/// The first entry in a base's `seps` always carries `key = Bound::NegInf`,
/// which is never actually compared against.
#[derive(Clone)]
pub(crate) struct Separator<K> {
    pub(crate) key: Bound<K>,
    pub(crate) child_id: NodeId,
}

#[derive(Clone)]
pub(crate) struct InnerBase<K> {
    pub(crate) low: Bound<K>,
    pub(crate) high: Bound<K>,
    pub(crate) next: NodeId,
    /// Sorted ascending by `key`; index 0's key is always `NegInf`.
    pub(crate) seps: Vec<Separator<K>>,
}

pub(crate) enum InnerRecord<K> {
    Base(InnerBase<K>),
    Insert {
        sep: Separator<K>,
        next_sep_key: Bound<K>,
        child: Atomic<InnerRecord<K>>,
    },
    Delete {
        deleted_key: Bound<K>,
        prev: Separator<K>,
        next_key: Bound<K>,
        child: Atomic<InnerRecord<K>>,
    },
    /// Posted once this node outgrows its upper separator-count
    /// threshold. Readers whose search key is at or past `split_key`
    /// must jump to `new_right` directly rather than continue down
    /// `child`.
    Split {
        split_key: K,
        new_right: NodeId,
        child: Atomic<InnerRecord<K>>,
    },
    Merge {
        merge_key: K,
        right: Box<InnerBase<K>>,
        removed_id: NodeId,
        child: Atomic<InnerRecord<K>>,
    },
    /// Terminal: this NodeID is logically destroyed. Carries the base
    /// the chain consolidated to right before removal; the help-along
    /// merge step reads it back since nothing else reaches it once this
    /// is the chain head.
    Remove {
        removed_id: NodeId,
        base: Box<InnerBase<K>>,
    },
    /// Transient: blocks the parent while a child's remove+merge is in
    /// flight so no second thread starts the same SMO concurrently.
    Abort {
        child: Atomic<InnerRecord<K>>,
    },
}

impl<K> InnerRecord<K> {
    fn child<'g>(&self, g: &'g Guard) -> Option<Shared<'g, InnerRecord<K>>> {
        match self {
            Self::Base(_) | Self::Remove { .. } => None,
            Self::Insert { child, .. }
            | Self::Delete { child, .. }
            | Self::Split { child, .. }
            | Self::Merge { child, .. }
            | Self::Abort { child, .. } => Some(child.ld_acq(g)),
        }
    }
}

/// `Some(removed_id)` iff `head` is itself a terminal `Remove` marker:
/// the caller must not call [`navigate`] on it (it has no child to walk)
/// and must instead jump to the left sibling and help finish the merge.
pub(crate) fn as_remove<K>(head: Shared<'_, InnerRecord<K>>) -> Option<NodeId> {
    match unsafe { head.as_ref() } {
        Some(InnerRecord::Remove { removed_id, .. }) => Some(*removed_id),
        _ => None,
    }
}

/// Walks the chain from `head`, returning the NodeID `search_key`
/// routes to. Encountering `Split` with `search_key >= split_key`
/// instructs the caller to jump to the new right sibling instead, by
/// returning that sibling's id directly rather than pushing a parent
/// frame onto some traversal stack.
pub(crate) fn navigate<'g, K, C: KeyComparator<K>>(
    head: Shared<'g, InnerRecord<K>>,
    search_key: &K,
    cmp: &C,
    g: &'g Guard,
) -> NodeId {
    let mut cur = head;
    loop {
        let node = unsafe { cur.deref() };
        match node {
            InnerRecord::Insert {
                sep,
                next_sep_key,
                ..
            } => {
                if in_range(&sep.key, next_sep_key, search_key, cmp) {
                    return sep.child_id;
                }
            }
            InnerRecord::Delete {
                prev, next_key, ..
            } => {
                if in_range(&prev.key, next_key, search_key, cmp) {
                    return prev.child_id;
                }
            }
            InnerRecord::Split {
                split_key,
                new_right,
                ..
            } => {
                if matches!(cmp.compare(search_key, split_key), std::cmp::Ordering::Greater | std::cmp::Ordering::Equal) {
                    return *new_right;
                }
            }
            InnerRecord::Merge {
                merge_key, right, ..
            } => {
                if matches!(cmp.compare(search_key, merge_key), std::cmp::Ordering::Greater | std::cmp::Ordering::Equal) {
                    return floor_sep(&right.seps, search_key, cmp).child_id;
                }
            }
            InnerRecord::Abort { .. } => {}
            InnerRecord::Remove { .. } => {
                unreachable!("caller must check as_remove before navigating")
            }
            InnerRecord::Base(base) => {
                return floor_sep(&base.seps, search_key, cmp).child_id;
            }
        }
        match node.child(g) {
            Some(n) => cur = n,
            None => unreachable!("chain must terminate in Base"),
        }
    }
}

/// Mirrors [`crate::delta::leaf::first_split`] at the inner level.
pub(crate) fn first_split<'g, K>(head: Shared<'g, InnerRecord<K>>, g: &'g Guard) -> Option<(&'g K, NodeId)> {
    let mut cur = head;
    loop {
        let node = unsafe { cur.as_ref()? };
        if let InnerRecord::Split { split_key, new_right, .. } = node {
            return Some((split_key, *new_right));
        }
        match node.child(g) {
            Some(next) => cur = next,
            None => return None,
        }
    }
}

fn in_range<K, C: KeyComparator<K>>(lo: &Bound<K>, hi: &Bound<K>, search: &K, cmp: &C) -> bool {
    use std::cmp::Ordering::*;
    let lo_ok = match lo {
        Bound::NegInf => true,
        Bound::PosInf => false,
        Bound::Key(k) => matches!(cmp.compare(k, search), Less | Equal),
    };
    let hi_ok = match hi {
        Bound::PosInf => true,
        Bound::NegInf => false,
        Bound::Key(k) => matches!(cmp.compare(search, k), Less),
    };
    lo_ok && hi_ok
}

/// Binary-searches the floor separator (the rightmost whose key is <=
/// `search_key`), skipping index 0's sentinel key during comparison.
fn floor_sep<'a, K, C: KeyComparator<K>>(seps: &'a [Separator<K>], search: &K, cmp: &C) -> &'a Separator<K> {
    debug_assert!(!seps.is_empty());
    let mut lo = 0usize;
    let mut hi = seps.len();
    while lo + 1 < hi {
        let mid = lo + (hi - lo) / 2;
        let take_right = match &seps[mid].key {
            Bound::Key(k) => matches!(cmp.compare(k, search), std::cmp::Ordering::Less | std::cmp::Ordering::Equal),
            Bound::NegInf => true,
            Bound::PosInf => false,
        };
        if take_right {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    &seps[lo]
}

/// Depth of the chain from `head` to (and including) the base.
pub(crate) fn chain_depth<'g, K>(head: Shared<'g, InnerRecord<K>>, g: &'g Guard) -> usize {
    let mut cur = head;
    let mut depth = 0;
    loop {
        depth += 1;
        let node = unsafe { cur.deref() };
        match node.child(g) {
            Some(n) => cur = n,
            None => return depth,
        }
    }
}

/// Replays the chain into a fresh consolidated base.
pub(crate) fn consolidate<'g, K: Clone + Ord>(head: Shared<'g, InnerRecord<K>>, g: &'g Guard) -> InnerBase<K> {
    enum Op<K> {
        Insert(Separator<K>),
        Delete(Bound<K>),
    }
    let mut ops: Vec<Op<K>> = vec![];
    let mut carried: Vec<Separator<K>> = vec![];
    let mut high: Option<Bound<K>> = None;
    let mut next: Option<NodeId> = None;
    let mut cur = head;
    let base = loop {
        let node = unsafe { cur.deref() };
        match node {
            InnerRecord::Insert { sep, .. } => ops.push(Op::Insert(sep.clone())),
            InnerRecord::Delete { deleted_key, .. } => ops.push(Op::Delete(deleted_key.clone())),
            InnerRecord::Split { split_key, new_right, .. } => {
                if high.is_none() {
                    high = Some(Bound::Key(split_key.clone()));
                    next = Some(*new_right);
                }
            }
            InnerRecord::Merge { right, .. } => {
                carried.extend(right.seps.iter().cloned());
                if high.is_none() {
                    high = Some(right.high.clone());
                    next = Some(right.next);
                }
            }
            InnerRecord::Remove { .. } | InnerRecord::Abort { .. } => {}
            InnerRecord::Base(b) => break b,
        }
        match node.child(g) {
            Some(n) => cur = n,
            None => unreachable!("chain must terminate in Base"),
        }
    };
    let low = base.low.clone();
    let high = high.unwrap_or_else(|| base.high.clone());
    let next = next.unwrap_or(base.next);
    let mut seps: Vec<Separator<K>> = base.seps.clone();
    if !carried.is_empty() {
        // a merge folds the absorbed sibling's separators onto the end,
        // then index 0's unused sentinel key is the only overlap risk
        carried.retain(|s| !matches!(&s.key, Bound::NegInf));
        seps.extend(carried);
    }
    if let Bound::Key(h) = &high {
        seps.retain(|s| !matches!(&s.key, Bound::Key(k) if k >= h));
    }
    // apply oldest-to-newest so a later op on the same key wins
    for op in ops.into_iter().rev() {
        match op {
            Op::Insert(sep) => {
                match seps.binary_search_by(|s| bound_key_cmp(&s.key, &sep.key)) {
                    Ok(idx) => seps[idx] = sep,
                    Err(idx) => seps.insert(idx, sep),
                }
            }
            Op::Delete(key) => {
                seps.retain(|s| bound_key_cmp(&s.key, &key) != std::cmp::Ordering::Equal);
            }
        }
    }
    InnerBase {
        low,
        high,
        next,
        seps,
    }
}

fn bound_key_cmp<K: Ord>(a: &Bound<K>, b: &Bound<K>) -> std::cmp::Ordering {
    use std::cmp::Ordering::*;
    match (a, b) {
        (Bound::NegInf, Bound::NegInf) => Equal,
        (Bound::NegInf, _) => Less,
        (_, Bound::NegInf) => Greater,
        (Bound::PosInf, Bound::PosInf) => Equal,
        (Bound::PosInf, _) => Greater,
        (_, Bound::PosInf) => Less,
        (Bound::Key(x), Bound::Key(y)) => x.cmp(y),
    }
}

pub(crate) fn new_split<K>(split_key: K, new_right: NodeId, child: Shared<'_, InnerRecord<K>>) -> Owned<InnerRecord<K>> {
    Owned::new(InnerRecord::Split {
        split_key,
        new_right,
        child: Atomic::from(child),
    })
}

pub(crate) fn new_insert<K>(sep: Separator<K>, next_sep_key: Bound<K>, child: Shared<'_, InnerRecord<K>>) -> Owned<InnerRecord<K>> {
    Owned::new(InnerRecord::Insert {
        sep,
        next_sep_key,
        child: Atomic::from(child),
    })
}

pub(crate) fn new_delete<K>(
    deleted_key: Bound<K>,
    prev: Separator<K>,
    next_key: Bound<K>,
    child: Shared<'_, InnerRecord<K>>,
) -> Owned<InnerRecord<K>> {
    Owned::new(InnerRecord::Delete {
        deleted_key,
        prev,
        next_key,
        child: Atomic::from(child),
    })
}

pub(crate) fn new_merge<K>(
    merge_key: K,
    right: InnerBase<K>,
    removed_id: NodeId,
    child: Shared<'_, InnerRecord<K>>,
) -> Owned<InnerRecord<K>> {
    Owned::new(InnerRecord::Merge {
        merge_key,
        right: Box::new(right),
        removed_id,
        child: Atomic::from(child),
    })
}

pub(crate) fn new_remove<K>(removed_id: NodeId, base: InnerBase<K>) -> Owned<InnerRecord<K>> {
    Owned::new(InnerRecord::Remove {
        removed_id,
        base: Box::new(base),
    })
}

pub(crate) fn new_abort<K>(child: Shared<'_, InnerRecord<K>>) -> Owned<InnerRecord<K>> {
    Owned::new(InnerRecord::Abort {
        child: Atomic::from(child),
    })
}
