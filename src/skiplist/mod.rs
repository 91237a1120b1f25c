/*
 * Created on Sun Jul 26 2026
*/

//! The lock-free skip list engine.
//!
//! Grounded on `sync::stack`'s CAS-retry splice for the general shape of
//! "walk, CAS, retry on contention", generalized from one pointer to a
//! per-level array and extended with the mark-bit-via-pointer-tag
//! deletion protocol the source describes. The tag lives in
//! `crossbeam_epoch::Shared`'s own low pointer bits (`with_tag`/`tag`),
//! so no hand-rolled bit-packing is needed here the way the source
//! hand-packs a mark into a raw pointer word.
//!
//! Only the bottom level (level 0) is load-bearing for correctness —
//! it is where every search, insert and delete linearizes. Levels
//! above it are a best-effort expressway: a lost race while splicing
//! an upper level simply leaves that tower one level shorter than
//! planned, which costs search speed, never correctness.

pub(crate) mod valuelist;

use {
    crate::{
        common::IndexConfig,
        sync::{atm::Atomic, epoch::EpochReclaimer, Backoff},
    },
    crossbeam_epoch::{self as epoch, Guard, Owned, Shared},
    rand::Rng,
    std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    },
    valuelist::ValueList,
};

fn is_marked<T>(ptr: Shared<'_, T>) -> bool {
    ptr.tag() & 1 != 0
}

struct Tower<K, V> {
    key: K,
    height: usize,
    values: ValueList<V>,
    next: Box<[Atomic<Tower<K, V>>]>,
}

impl<K, V> Tower<K, V> {
    fn new(key: K, height: usize) -> Self {
        let mut next = Vec::with_capacity(height);
        for _ in 0..height {
            next.push(Atomic::null());
        }
        Self {
            key,
            height,
            values: ValueList::new(),
            next: next.into_boxed_slice(),
        }
    }
}

pub struct SkipListOptions {
    pub tower_levels: usize,
    pub unique_key_mode: bool,
    pub epoch_interval_ms: u64,
}

impl Default for SkipListOptions {
    fn default() -> Self {
        Self {
            tower_levels: 10,
            unique_key_mode: false,
            epoch_interval_ms: 16,
        }
    }
}

pub struct SkipList<K, V, C> {
    head: Box<[Atomic<Tower<K, V>>]>,
    max_levels: usize,
    len: AtomicUsize,
    reclaimer: EpochReclaimer,
    config: C,
    unique_key_mode: bool,
}

impl<K, V, C> SkipList<K, V, C>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
    C: IndexConfig<K, V>,
{
    pub fn new(config: C, opts: SkipListOptions) -> Self {
        let mut head = Vec::with_capacity(opts.tower_levels);
        for _ in 0..opts.tower_levels {
            head.push(Atomic::null());
        }
        Self {
            head: head.into_boxed_slice(),
            max_levels: opts.tower_levels,
            len: AtomicUsize::new(0),
            reclaimer: EpochReclaimer::new(Duration::from_millis(opts.epoch_interval_ms)),
            config,
            unique_key_mode: opts.unique_key_mode,
        }
    }

    fn random_height(&self) -> usize {
        let mut h = 1;
        let mut rng = rand::thread_rng();
        while h < self.max_levels && rng.gen_bool(0.5) {
            h += 1;
        }
        h
    }

    /// Reads the per-level successor of `pred` (or of the head
    /// sentinel, when `pred` is `None`). Kept as a single call rather
    /// than handing back the `&Atomic` slot itself: the slot behind
    /// `Some(p)` lives as long as the epoch protecting `p`, not as long
    /// as `&self`, so the two cases can't share a borrowed reference
    /// type — only the loaded `Shared`, tied to the guard, can.
    fn pred_load<'g>(&self, pred: Option<Shared<'g, Tower<K, V>>>, level: usize, g: &'g Guard) -> Shared<'g, Tower<K, V>> {
        match pred {
            None => self.head[level].ld_acq(g),
            Some(p) => unsafe { p.deref() }.next[level].ld_acq(g),
        }
    }

    fn pred_cx_shared<'g>(
        &self,
        pred: Option<Shared<'g, Tower<K, V>>>,
        level: usize,
        old: Shared<'g, Tower<K, V>>,
        new: Shared<'g, Tower<K, V>>,
        g: &'g Guard,
    ) -> bool {
        let r = match pred {
            None => self.head[level].cx(old, new, Ordering::AcqRel, Ordering::Relaxed, g),
            Some(p) => unsafe { p.deref() }.next[level].cx(old, new, Ordering::AcqRel, Ordering::Relaxed, g),
        };
        r.is_ok()
    }

    fn pred_cx_owned<'g>(
        &self,
        pred: Option<Shared<'g, Tower<K, V>>>,
        level: usize,
        old: Shared<'g, Tower<K, V>>,
        new: Owned<Tower<K, V>>,
        g: &'g Guard,
    ) -> Result<Shared<'g, Tower<K, V>>, Owned<Tower<K, V>>> {
        match pred {
            None => self.head[level]
                .cx(old, new, Ordering::Release, Ordering::Relaxed, g)
                .map_err(|e| e.new),
            Some(p) => unsafe { p.deref() }
                .next[level]
                .cx(old, new, Ordering::Release, Ordering::Relaxed, g)
                .map_err(|e| e.new),
        }
    }

    /// Per-level predecessor/successor path around `key`, helping unlink
    /// any marked node it steps over along the way.
    fn find<'g>(
        &self,
        key: &K,
        g: &'g Guard,
    ) -> (Vec<Option<Shared<'g, Tower<K, V>>>>, Vec<Shared<'g, Tower<K, V>>>) {
        'retry: loop {
            let mut preds: Vec<Option<Shared<'g, Tower<K, V>>>> = vec![None; self.max_levels];
            let mut succs: Vec<Shared<'g, Tower<K, V>>> = vec![Shared::null(); self.max_levels];
            let mut pred: Option<Shared<'g, Tower<K, V>>> = None;
            for level in (0..self.max_levels).rev() {
                let succ_here;
                loop {
                    let cur = self.pred_load(pred, level, g);
                    if cur.is_null() {
                        succ_here = cur;
                        break;
                    }
                    let node = unsafe { cur.deref() };
                    let cur_next = node.next[level].ld_acq(g);
                    if is_marked(cur_next) {
                        let unmarked = cur_next.with_tag(0);
                        if !self.pred_cx_shared(pred, level, cur, unmarked, g) {
                            continue 'retry;
                        }
                        continue;
                    }
                    if self.config.key_cmp().compare(&node.key, key) == std::cmp::Ordering::Less {
                        pred = Some(cur);
                        continue;
                    }
                    succ_here = cur;
                    break;
                }
                preds[level] = pred;
                succs[level] = succ_here;
            }
            return (preds, succs);
        }
    }

    /// Inserts `(key, value)`. Returns `false` in unique-key mode if
    /// `key` already has a value, or if the exact pair already exists.
    pub fn insert(&self, key: K, value: V) -> bool {
        let _guard = self.reclaimer.join();
        let g = unsafe { epoch::unprotected() };
        let backoff = Backoff::new();
        loop {
            let (preds, succs) = self.find(&key, g);
            if let Some(existing) = (!succs[0].is_null())
                .then(|| succs[0])
                .filter(|s| self.config.key_cmp().compare(unsafe { &s.deref().key }, &key) == std::cmp::Ordering::Equal)
            {
                let node = unsafe { existing.deref() };
                if self.unique_key_mode {
                    if !node.values.is_empty(g) {
                        return false;
                    }
                } else if node.values.any(|v| v == &value, g) {
                    return false;
                }
                node.values.append(value, g);
                return true;
            }
            let height = self.random_height();
            let mut tower = Tower::new(key.clone(), height);
            tower.values.append(value.clone(), g);
            for level in 0..height {
                tower.next[level] = Atomic::from(succs[level]);
            }
            let owned = Owned::new(tower);
            match self.pred_cx_owned(preds[0], 0, succs[0], owned, g) {
                Ok(published) => {
                    for level in 1..height {
                        // best-effort: a lost race here just leaves this
                        // tower one level shorter on the expressway
                        let _ = self.pred_cx_shared(preds[level], level, succs[level], published, g);
                    }
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(_) => {
                    backoff.snooze();
                    continue;
                }
            }
        }
    }

    pub fn conditional_insert<P: Fn(&V) -> bool>(&self, key: K, value: V, predicate: P) -> (bool, bool) {
        let _guard = self.reclaimer.join();
        let g = unsafe { epoch::unprotected() };
        loop {
            let (preds, succs) = self.find(&key, g);
            if (!succs[0].is_null())
                && self.config.key_cmp().compare(unsafe { &succs[0].deref().key }, &key) == std::cmp::Ordering::Equal
            {
                let node = unsafe { succs[0].deref() };
                if node.values.any(|v| predicate(v), g) {
                    return (false, true);
                }
                if node.values.any(|v| v == &value, g) {
                    return (false, false);
                }
                node.values.append(value, g);
                return (true, false);
            }
            let height = self.random_height();
            let mut tower = Tower::new(key.clone(), height);
            tower.values.append(value.clone(), g);
            for level in 0..height {
                tower.next[level] = Atomic::from(succs[level]);
            }
            let owned = Owned::new(tower);
            if self.pred_cx_owned(preds[0], 0, succs[0], owned, g).is_ok() {
                self.len.fetch_add(1, Ordering::Relaxed);
                return (true, false);
            }
        }
    }

    /// Deletes `(key, value)`. Tears down the whole tower once its
    /// value list empties.
    pub fn delete(&self, key: &K, value: &V) -> bool {
        let _guard = self.reclaimer.join();
        let g = unsafe { epoch::unprotected() };
        let (preds, succs) = self.find(key, g);
        let cur = succs[0];
        if cur.is_null() {
            return false;
        }
        let node = unsafe { cur.deref() };
        if self.config.key_cmp().compare(&node.key, key) != std::cmp::Ordering::Equal {
            return false;
        }
        let removed_addr = match node.values.remove(|v| v == value, g) {
            Some(addr) => addr,
            None => return false,
        };
        self.reclaimer
            .retire(move || unsafe { valuelist::free_value_node_addr::<V>(removed_addr) });
        if node.values.is_empty(g) {
            self.unlink_tower(cur, &preds, g);
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Marks every level of `cur` top-down, then best-effort unlinks
    /// each from its recorded predecessor. A lost unlink race just
    /// leaves the marked node to be helped-along by the next `find`
    /// that steps over it.
    fn unlink_tower<'g>(&self, cur: Shared<'g, Tower<K, V>>, preds: &[Option<Shared<'g, Tower<K, V>>>], g: &'g Guard) {
        let node = unsafe { cur.deref() };
        for level in (0..node.height).rev() {
            loop {
                let next = node.next[level].ld_acq(g);
                if is_marked(next) {
                    break;
                }
                let marked = next.with_tag(1);
                if node.next[level].cx(next, marked, Ordering::AcqRel, Ordering::Relaxed, g).is_ok() {
                    break;
                }
            }
        }
        for level in (0..node.height).rev() {
            let next = node.next[level].ld_acq(g).with_tag(0);
            let _ = self.pred_cx_shared(preds[level], level, cur, next, g);
        }
        let addr = cur.as_raw() as usize;
        self.reclaimer.retire(move || unsafe {
            drop(Box::from_raw(addr as *mut Tower<K, V>));
        });
    }

    pub fn get_values(&self, key: &K, out: &mut Vec<V>) {
        let _guard = self.reclaimer.join();
        let g = unsafe { epoch::unprotected() };
        let (_, succs) = self.find(key, g);
        if succs[0].is_null() {
            return;
        }
        let node = unsafe { succs[0].deref() };
        if self.config.key_cmp().compare(&node.key, key) == std::cmp::Ordering::Equal {
            node.values.collect(out, g);
        }
    }

    pub fn contains(&self, key: &K, value: &V) -> bool {
        let mut out = vec![];
        self.get_values(key, &mut out);
        out.contains(value)
    }

    pub fn scan_all(&self, out: &mut Vec<(K, V)>) {
        let _guard = self.reclaimer.join();
        let g = unsafe { epoch::unprotected() };
        let mut cur = self.head[0].ld_acq(g);
        while let Some(node) = unsafe { cur.as_ref() } {
            let next = node.next[0].ld_acq(g);
            if !is_marked(next) {
                let mut values = vec![];
                node.values.collect(&mut values, g);
                out.extend(values.into_iter().map(|v| (node.key.clone(), v)));
            }
            cur = next.with_tag(0);
        }
    }

    pub fn scan_range(&self, lo: &K, hi: &K, out: &mut Vec<(K, V)>) {
        let _guard = self.reclaimer.join();
        let g = unsafe { epoch::unprotected() };
        let (_, succs) = self.find(lo, g);
        let mut cur = succs[0];
        while let Some(node) = unsafe { cur.as_ref() } {
            if self.config.key_cmp().compare(&node.key, hi) == std::cmp::Ordering::Greater {
                break;
            }
            let next = node.next[0].ld_acq(g);
            if !is_marked(next) {
                let mut values = vec![];
                node.values.collect(&mut values, g);
                out.extend(values.into_iter().map(|v| (node.key.clone(), v)));
            }
            cur = next.with_tag(0);
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn need_gc(&self) -> bool {
        self.reclaimer.need_gc()
    }

    pub fn perform_gc(&self) {
        self.reclaimer.perform_gc()
    }
}

unsafe impl<K: Send, V: Send, C: Send> Send for SkipList<K, V, C> {}
unsafe impl<K: Send + Sync, V: Send + Sync, C: Send + Sync> Sync for SkipList<K, V, C> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DefaultConfig;

    fn small_list() -> SkipList<i64, i64, DefaultConfig> {
        SkipList::new(
            DefaultConfig::new(3),
            SkipListOptions {
                tower_levels: 6,
                ..SkipListOptions::default()
            },
        )
    }

    #[test]
    fn insert_then_get() {
        let l = small_list();
        assert!(l.insert(10, 100));
        assert!(!l.insert(10, 100));
        let mut out = vec![];
        l.get_values(&10, &mut out);
        assert_eq!(out, vec![100]);
    }

    #[test]
    fn delete_tears_down_empty_tower() {
        let l = small_list();
        l.insert(1, 1);
        assert!(l.delete(&1, &1));
        let mut out = vec![];
        l.get_values(&1, &mut out);
        assert!(out.is_empty());
        assert_eq!(l.len(), 0);
    }

    #[test]
    fn scan_all_is_sorted() {
        let l = small_list();
        let mut keys: Vec<i64> = (0..100).rev().collect();
        for &k in &keys {
            l.insert(k, k);
        }
        let mut out = vec![];
        l.scan_all(&mut out);
        keys.sort();
        let got: Vec<i64> = out.iter().map(|(k, _)| *k).collect();
        assert_eq!(got, keys);
    }

    #[test]
    fn scan_range_is_inclusive() {
        let l = small_list();
        for k in 0..30 {
            l.insert(k, k);
        }
        let mut out = vec![];
        l.scan_range(&5, &10, &mut out);
        let got: Vec<i64> = out.iter().map(|(k, _)| *k).collect();
        assert_eq!(got, (5..=10).collect::<Vec<_>>());
    }

    #[test]
    fn unique_key_mode_rejects_second_value() {
        let l = SkipList::new(
            DefaultConfig::new(1),
            SkipListOptions {
                unique_key_mode: true,
                ..SkipListOptions::default()
            },
        );
        assert!(l.insert(3, 30));
        assert!(!l.insert(3, 31));
    }

    #[test]
    fn concurrent_inserts_are_all_observed() {
        use std::sync::Arc;
        let l = Arc::new(small_list());
        let mut handles = vec![];
        for tid in 0..4i64 {
            let l = Arc::clone(&l);
            handles.push(std::thread::spawn(move || {
                for i in 0..50i64 {
                    l.insert(tid * 1000 + i, i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(l.len(), 200);
    }
}
