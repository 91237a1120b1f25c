/*
 * Created on Sun Jul 26 2026
*/

//! A lock-free Treiber stack, used by the mapping table to recycle freed
//! NodeIDs.

use {
    super::atm::Atomic,
    crossbeam_epoch::{Guard, Owned},
    std::sync::atomic::Ordering,
};

struct SNode<T> {
    data: T,
    next: Atomic<Self>,
}

/// Many-producer many-consumer lock-free stack (LIFO).
///
/// Used for NodeID recycling: a freed id is pushed once its retiring
/// epoch has drained, and `pop` hands the most recently freed id back
/// out first, which keeps the mapping table's hot working set small.
pub(crate) struct Stack<T> {
    head: Atomic<SNode<T>>,
}

impl<T> Stack<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: Atomic::null(),
        }
    }
    pub(crate) fn push(&self, data: T, g: &Guard) {
        let mut new = Owned::new(SNode {
            data,
            next: Atomic::null(),
        });
        loop {
            let head = self.head.ld_acq(g);
            new.next.store(head, Ordering::Relaxed);
            match self.head.cx_rel(head, new, g) {
                Ok(_) => return,
                Err(e) => new = e.new,
            }
        }
    }
    pub(crate) fn pop(&self, g: &Guard) -> Option<T> {
        loop {
            let head = self.head.ld_acq(g);
            let head_ref = unsafe {
                // the epoch guard `g` keeps `head` alive for the duration of this match
                match head.as_ref() {
                    Some(h) => h,
                    None => return None,
                }
            };
            let next = head_ref.next.ld_acq(g);
            if self
                .head
                .cx(head, next, Ordering::Release, Ordering::Relaxed, g)
                .is_ok()
            {
                unsafe {
                    // head is now unreachable from any future load; safe to defer-destroy
                    g.defer_destroy(head);
                    return Some(std::ptr::read(&head_ref.data));
                }
            }
        }
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        let g = unsafe { crossbeam_epoch::unprotected() };
        while self.pop(g).is_some() {}
    }
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::pin;

    #[test]
    fn empty_pop() {
        let s: Stack<u64> = Stack::new();
        let g = pin();
        assert_eq!(s.pop(&g), None);
    }

    #[test]
    fn push_pop_lifo() {
        let s = Stack::new();
        let g = pin();
        s.push(1u64, &g);
        s.push(2, &g);
        s.push(3, &g);
        assert_eq!(s.pop(&g), Some(3));
        assert_eq!(s.pop(&g), Some(2));
        assert_eq!(s.pop(&g), Some(1));
        assert_eq!(s.pop(&g), None);
    }

    #[test]
    fn concurrent_push_pop() {
        use std::{sync::Arc, thread};
        const N: usize = 500;
        let s = Arc::new(Stack::new());
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let s = s.clone();
                thread::spawn(move || {
                    let g = pin();
                    for i in 0..N {
                        s.push((t * N + i) as u64, &g);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        let g = pin();
        let mut popped = vec![];
        while let Some(v) = s.pop(&g) {
            popped.push(v);
        }
        assert_eq!(popped.len(), 4 * N);
    }
}
