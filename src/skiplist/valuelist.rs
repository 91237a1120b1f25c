/*
 * Created on Sun Jul 26 2026
*/

//! Per-key value list: a lock-free singly-linked list sharing the
//! tower's mark-bit-via-pointer-tag discipline, so a key whose list empties
//! can be torn down the same way a tower's levels are unlinked.

use {
    crate::sync::atm::Atomic,
    crossbeam_epoch::{Guard, Owned, Shared},
    std::sync::atomic::Ordering,
};

struct ValueNode<V> {
    value: V,
    next: Atomic<ValueNode<V>>,
}

/// Tag bit 1 on a `next` pointer marks the node it points *away from* as
/// logically deleted — mirroring [`super::Tower`]'s convention so both
/// structures retry on the same `DeleteMarkSet` / `PtrMismatch` outcomes.
pub(crate) struct ValueList<V> {
    head: Atomic<ValueNode<V>>,
}

fn is_marked<T>(ptr: Shared<'_, T>) -> bool {
    ptr.tag() & 1 != 0
}

impl<V> ValueList<V> {
    pub(crate) fn new() -> Self {
        Self {
            head: Atomic::null(),
        }
    }

    /// Appends `value` after walking to the current tail. Always
    /// succeeds; concurrent appends simply retry past each other.
    pub(crate) fn append(&self, value: V, g: &Guard) {
        let mut new = Owned::new(ValueNode {
            value,
            next: Atomic::null(),
        });
        loop {
            let (pred_slot, _) = self.find_tail(g);
            match pred_slot.cx(Shared::null(), new, Ordering::Release, Ordering::Relaxed, g) {
                Ok(_) => return,
                Err(e) => new = e.new,
            }
        }
    }

    fn find_tail<'g>(&self, g: &'g Guard) -> (&Atomic<ValueNode<V>>, Shared<'g, ValueNode<V>>) {
        let mut pred = &self.head;
        loop {
            let cur = pred.ld_acq(g);
            if cur.is_null() {
                return (pred, cur);
            }
            let node = unsafe { cur.deref() };
            pred = &node.next;
        }
    }

    /// Collects every live (unmarked) value, in list order.
    pub(crate) fn collect(&self, out: &mut Vec<V>, g: &Guard)
    where
        V: Clone,
    {
        let mut cur = self.head.ld_acq(g);
        while let Some(node) = unsafe { cur.as_ref() } {
            if !is_marked(node.next.ld_acq(g)) {
                out.push(node.value.clone());
            }
            cur = node.next.ld_acq(g).with_tag(0);
        }
    }

    pub(crate) fn any<F: Fn(&V) -> bool>(&self, pred: F, g: &Guard) -> bool {
        let mut cur = self.head.ld_acq(g);
        while let Some(node) = unsafe { cur.as_ref() } {
            let next = node.next.ld_acq(g);
            if !is_marked(next) && pred(&node.value) {
                return true;
            }
            cur = next.with_tag(0);
        }
        false
    }

    /// Removes the first live node matching `pred`. Returns the raw
    /// address of the unlinked node for the caller to hand to its own
    /// epoch reclaimer via [`free_value_node_addr`] — this list has no
    /// reclaimer of its own, only the tower (and the tree above it)
    /// does.
    pub(crate) fn remove<F: Fn(&V) -> bool>(&self, pred: F, g: &Guard) -> Option<usize> {
        loop {
            let mut prev = &self.head;
            let mut cur = prev.ld_acq(g);
            loop {
                let node = match unsafe { cur.as_ref() } {
                    Some(n) => n,
                    None => return None,
                };
                let next = node.next.ld_acq(g);
                if is_marked(next) {
                    // help unlink an already-marked node we stumbled on
                    let unmarked_next = next.with_tag(0);
                    let _ = prev.cx(cur, unmarked_next, Ordering::AcqRel, Ordering::Relaxed, g);
                    cur = prev.ld_acq(g);
                    continue;
                }
                if pred(&node.value) {
                    let marked = next.with_tag(1);
                    if node
                        .next
                        .cx(next, marked, Ordering::AcqRel, Ordering::Relaxed, g)
                        .is_err()
                    {
                        break; // lost the mark race; restart from head
                    }
                    let _ = prev.cx(cur, next, Ordering::AcqRel, Ordering::Relaxed, g);
                    return Some(cur.as_raw() as usize);
                }
                prev = &node.next;
                cur = next;
            }
        }
    }

    pub(crate) fn is_empty(&self, g: &Guard) -> bool {
        let mut cur = self.head.ld_acq(g);
        while let Some(node) = unsafe { cur.as_ref() } {
            if !is_marked(node.next.ld_acq(g)) {
                return false;
            }
            cur = node.next.ld_acq(g).with_tag(0);
        }
        true
    }

    /// Frees every node unconditionally. Only safe when no other thread
    /// can observe `self` any longer (owning tower's destructor path).
    pub(crate) unsafe fn drain_owned(&self, g: &Guard) {
        let mut cur = self.head.ld_acq(g).with_tag(0);
        while !cur.is_null() {
            let next = unsafe { cur.deref() }.next.ld_acq(g).with_tag(0);
            drop(unsafe { cur.into_owned() });
            cur = next;
        }
    }
}

/// Frees a node previously unlinked by [`ValueList::remove`], once the
/// reclaimer has determined no reader can still be holding it.
pub(crate) unsafe fn free_value_node_addr<V>(addr: usize) {
    drop(Box::from_raw(addr as *mut ValueNode<V>));
}

unsafe impl<V: Send> Send for ValueList<V> {}
unsafe impl<V: Send> Sync for ValueList<V> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::pin;

    #[test]
    fn append_then_collect_preserves_order() {
        let l = ValueList::new();
        let g = pin();
        l.append(1, &g);
        l.append(2, &g);
        l.append(3, &g);
        let mut out = vec![];
        l.collect(&mut out, &g);
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn remove_drops_matching_value_only() {
        let l = ValueList::new();
        let g = pin();
        l.append(1, &g);
        l.append(2, &g);
        let addr = l.remove(|v| *v == 1, &g).expect("present");
        unsafe { free_value_node_addr::<i32>(addr) };
        let mut out = vec![];
        l.collect(&mut out, &g);
        assert_eq!(out, vec![2]);
        assert!(l.remove(|v| *v == 1, &g).is_none());
    }

    #[test]
    fn empties_report_is_empty() {
        let l: ValueList<i32> = ValueList::new();
        let g = pin();
        assert!(l.is_empty(&g));
        l.append(9, &g);
        assert!(!l.is_empty(&g));
        if let Some(addr) = l.remove(|v| *v == 9, &g) {
            unsafe { free_value_node_addr::<i32>(addr) };
        }
        assert!(l.is_empty(&g));
    }
}
