//! End-to-end scenarios S1-S6, run against both engines.

use lfidx::{BwTree, BwTreeOptions, DefaultConfig, IndexOptions, SkipList, SkipListOptions};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

fn small_bwtree() -> BwTree<i64, i64, DefaultConfig> {
    IndexOptions::new()
        .mapping_table_capacity(1 << 14)
        .leaf_split_upper(64)
        .leaf_merge_lower(16)
        .consolidation_depth_threshold(6)
        .epoch_interval_ms(5)
        .build_bwtree(DefaultConfig::new(11))
}

fn small_skiplist() -> SkipList<i64, i64, DefaultConfig> {
    IndexOptions::new()
        .tower_levels(12)
        .epoch_interval_ms(5)
        .build_skiplist(DefaultConfig::new(11))
}

// S1 - sequential insert + point read. Scaled down to 100_000 keys so the
// suite runs in bounded time; the scenario's shape (sequential fill, one
// point read, one full ordered scan) is unchanged from a million-key run.
#[test]
fn s1_sequential_insert_and_point_read_bwtree() {
    let t = small_bwtree();
    const N: i64 = 100_000;
    for k in 1..=N {
        assert!(t.insert(k, k));
    }
    let mut out = vec![];
    t.get_values(&(N / 2), &mut out);
    assert_eq!(out, vec![N / 2]);
    let mut all = vec![];
    t.scan_all(&mut all);
    assert_eq!(all.len(), N as usize);
    for (i, (k, v)) in all.iter().enumerate() {
        assert_eq!(*k, i as i64 + 1);
        assert_eq!(v, k);
    }
}

#[test]
fn s1_sequential_insert_and_point_read_skiplist() {
    let l = small_skiplist();
    const N: i64 = 100_000;
    for k in 1..=N {
        assert!(l.insert(k, k));
    }
    let mut out = vec![];
    l.get_values(&(N / 2), &mut out);
    assert_eq!(out, vec![N / 2]);
    let mut all = vec![];
    l.scan_all(&mut all);
    assert_eq!(all.len(), N as usize);
    assert_eq!(l.len(), N as usize);
}

// S2 - insert/delete round trip under concurrency.
#[test]
fn s2_insert_delete_round_trip_bwtree() {
    let t = Arc::new(small_bwtree());
    let threads = 8i64;
    let per_thread = 200i64;
    let mut handles = vec![];
    for tid in 0..threads {
        let t = Arc::clone(&t);
        handles.push(std::thread::spawn(move || {
            let base = tid * per_thread;
            for i in base..base + per_thread {
                for d in 1..=4 {
                    assert!(t.insert(i, i + d));
                }
            }
            for i in base..base + per_thread {
                for d in 1..=4 {
                    assert!(t.delete(&i, &(i + d)));
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    for tid in 0..threads {
        let base = tid * per_thread;
        for i in base..base + per_thread {
            let mut out = vec![];
            t.get_values(&i, &mut out);
            assert!(out.is_empty(), "key {i} should be empty after round trip");
        }
    }
}

#[test]
fn s2_insert_delete_round_trip_skiplist() {
    let l = Arc::new(small_skiplist());
    let threads = 8i64;
    let per_thread = 200i64;
    let mut handles = vec![];
    for tid in 0..threads {
        let l = Arc::clone(&l);
        handles.push(std::thread::spawn(move || {
            let base = tid * per_thread;
            for i in base..base + per_thread {
                for d in 1..=4 {
                    assert!(l.insert(i, i + d));
                }
            }
            for i in base..base + per_thread {
                for d in 1..=4 {
                    assert!(l.delete(&i, &(i + d)));
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(l.len(), 0);
}

// S3 - unique-mode duplicate.
#[test]
fn s3_unique_mode_duplicate_bwtree() {
    let t = BwTree::new(
        DefaultConfig::new(1),
        BwTreeOptions {
            unique_key_mode: true,
            ..BwTreeOptions::default()
        },
    );
    assert!(t.insert(42, 7));
    assert!(!t.insert(42, 9));
    let mut out = vec![];
    t.get_values(&42, &mut out);
    assert_eq!(out, vec![7]);
}

#[test]
fn s3_unique_mode_duplicate_skiplist() {
    let l = SkipList::new(
        DefaultConfig::new(1),
        SkipListOptions {
            unique_key_mode: true,
            ..SkipListOptions::default()
        },
    );
    assert!(l.insert(42, 7));
    assert!(!l.insert(42, 9));
    let mut out = vec![];
    l.get_values(&42, &mut out);
    assert_eq!(out, vec![7]);
}

// S4 - conditional insert with predicate.
#[test]
fn s4_conditional_insert_with_predicate_bwtree() {
    let t = small_bwtree();
    assert!(t.insert(5, 100));
    let (inserted, hit) = t.conditional_insert(5, 200, |x| *x == 100);
    assert_eq!((inserted, hit), (false, true));
    let mut out = vec![];
    t.get_values(&5, &mut out);
    assert_eq!(out, vec![100]);

    let (inserted, hit) = t.conditional_insert(5, 200, |x| *x == 999);
    assert_eq!((inserted, hit), (true, false));
    let mut out = vec![];
    t.get_values(&5, &mut out);
    assert_eq!(out, vec![100, 200]);
}

#[test]
fn s4_conditional_insert_with_predicate_skiplist() {
    let l = small_skiplist();
    assert!(l.insert(5, 100));
    let (inserted, hit) = l.conditional_insert(5, 200, |x| *x == 100);
    assert_eq!((inserted, hit), (false, true));
    let mut out = vec![];
    l.get_values(&5, &mut out);
    assert_eq!(out, vec![100]);

    let (inserted, hit) = l.conditional_insert(5, 200, |x| *x == 999);
    assert_eq!((inserted, hit), (true, false));
    let mut out = vec![];
    l.get_values(&5, &mut out);
    assert_eq!(out, vec![100, 200]);
}

// S5 - range scan.
#[test]
fn s5_range_scan_bwtree() {
    let t = small_bwtree();
    for i in 0..1000i64 {
        t.insert(i, i);
    }
    let mut out = vec![];
    t.scan_range(&200, &300, &mut out);
    let got: Vec<i64> = out.iter().map(|(k, _)| *k).collect();
    assert_eq!(got, (200..=300).collect::<Vec<_>>());
    assert_eq!(got.len(), 101);
}

#[test]
fn s5_range_scan_skiplist() {
    let l = small_skiplist();
    for i in 0..1000i64 {
        l.insert(i, i);
    }
    let mut out = vec![];
    l.scan_range(&200, &300, &mut out);
    let got: Vec<i64> = out.iter().map(|(k, _)| *k).collect();
    assert_eq!(got, (200..=300).collect::<Vec<_>>());
    assert_eq!(got.len(), 101);
}

// S6 - concurrent mixed insert/delete.
#[test]
fn s6_concurrent_mixed_bwtree() {
    let t = Arc::new(small_bwtree());
    let range = 2000i64;
    let inserts_ok = Arc::new(AtomicUsize::new(0));
    let deletes_ok = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];
    for tid in 0..4i64 {
        let t = Arc::clone(&t);
        let inserts_ok = Arc::clone(&inserts_ok);
        handles.push(std::thread::spawn(move || {
            for k in (tid..range).step_by(4) {
                if t.insert(k, k) {
                    inserts_ok.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let mut handles = vec![];
    for tid in 0..4i64 {
        let t = Arc::clone(&t);
        let deletes_ok = Arc::clone(&deletes_ok);
        handles.push(std::thread::spawn(move || {
            for k in (tid..range).step_by(4) {
                if t.delete(&k, &k) {
                    deletes_ok.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    t.perform_gc();
    assert_eq!(inserts_ok.load(Ordering::Relaxed), deletes_ok.load(Ordering::Relaxed));
    for k in 0..range {
        let mut out = vec![];
        t.get_values(&k, &mut out);
        assert!(out.is_empty());
    }
}

#[test]
fn s6_concurrent_mixed_skiplist() {
    let l = Arc::new(small_skiplist());
    let range = 2000i64;
    let inserts_ok = Arc::new(AtomicUsize::new(0));
    let deletes_ok = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];
    for tid in 0..4i64 {
        let l = Arc::clone(&l);
        let inserts_ok = Arc::clone(&inserts_ok);
        handles.push(std::thread::spawn(move || {
            for k in (tid..range).step_by(4) {
                if l.insert(k, k) {
                    inserts_ok.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let mut handles = vec![];
    for tid in 0..4i64 {
        let l = Arc::clone(&l);
        let deletes_ok = Arc::clone(&deletes_ok);
        handles.push(std::thread::spawn(move || {
            for k in (tid..range).step_by(4) {
                if l.delete(&k, &k) {
                    deletes_ok.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    l.perform_gc();
    assert_eq!(inserts_ok.load(Ordering::Relaxed), deletes_ok.load(Ordering::Relaxed));
    assert_eq!(l.len(), 0);
}
