/*
 * Created on Sun Jul 26 2026
*/

//! Shared vocabulary: the key/value marker traits and the comparator
//! configuration object every structure in this crate is built over.
//!
//! Mirrors the shape of `engine::idx::mod`'s `AsKey`/`AsValue` marker
//! traits, but adds an explicit stored comparator (`IndexConfig`) rather
//! than leaning on `K: Ord` alone, so that stateful comparators (e.g. a
//! locale collation table) are first-class configuration instead of a
//! zero-sized type parameter.

use core::cmp::Ordering;

/// Any type usable as a key in this crate's structures.
pub trait AsKey: Send + Sync {}
impl<T: Send + Sync> AsKey for T {}

/// Any type usable as a value in this crate's structures.
pub trait AsValue: Send + Sync {}
impl<T: Send + Sync> AsValue for T {}

/// A stored, possibly-stateful total order over `K`.
///
/// Never default-constructed: an instance is supplied once at
/// construction and held inline in the tree/list root.
pub trait KeyComparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// A stored total order over `V`, required by the skip list's per-key
/// value list (conditional insert needs a stable order to dedupe).
pub trait ValueComparator<V>: Send + Sync {
    fn compare(&self, a: &V, b: &V) -> Ordering;
}

/// The configuration object threaded through every structure: a
/// comparator for keys, a comparator for values, and a hasher seed for
/// the Bw-Tree's internal bloom filters.
pub trait IndexConfig<K, V>: Send + Sync {
    type KeyCmp: KeyComparator<K>;
    type ValCmp: ValueComparator<V>;

    fn key_cmp(&self) -> &Self::KeyCmp;
    fn val_cmp(&self) -> &Self::ValCmp;
    /// Used to seed the leaf-consolidation bloom filters; two instances
    /// built with different seeds must never be mixed for the same tree.
    fn hash_seed(&self) -> u64;
}

/// Blanket comparator: any `K: Ord` can be wrapped as the default
/// stateless comparator without special-casing call sites.
pub struct OrdKeyCmp;
impl<K: Ord> KeyComparator<K> for OrdKeyCmp {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

pub struct OrdValCmp;
impl<V: Ord> ValueComparator<V> for OrdValCmp {
    fn compare(&self, a: &V, b: &V) -> Ordering {
        a.cmp(b)
    }
}

/// Default configuration: `K: Ord`, `V: Ord`, a fixed hash seed. Built
/// explicitly via [`DefaultConfig::new`], never through `Default`, so
/// that the "never default-construct a comparator" discipline holds
/// even for the common case.
pub struct DefaultConfig {
    seed: u64,
}

impl DefaultConfig {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl<K: Ord + Send + Sync, V: Ord + Send + Sync> IndexConfig<K, V> for DefaultConfig {
    type KeyCmp = OrdKeyCmp;
    type ValCmp = OrdValCmp;

    fn key_cmp(&self) -> &Self::KeyCmp {
        &OrdKeyCmp
    }
    fn val_cmp(&self) -> &Self::ValCmp {
        &OrdValCmp
    }
    fn hash_seed(&self) -> u64 {
        self.seed
    }
}

/// A key together with its ±∞ sentinels, used on inner-node low/high
/// bounds. `NegInf` never compares equal-or-greater to any real key;
/// `PosInf` never compares equal-or-lesser. Neither is ever handed back
/// to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound<K> {
    NegInf,
    Key(K),
    PosInf,
}

impl<K> Bound<K> {
    pub fn as_key(&self) -> Option<&K> {
        match self {
            Self::Key(k) => Some(k),
            _ => None,
        }
    }
    /// Compare `search` against this bound using `cmp`. `NegInf` is
    /// always `Less`, `PosInf` is always `Greater`.
    pub fn cmp_search<C: KeyComparator<K>>(&self, search: &K, cmp: &C) -> Ordering {
        match self {
            Self::NegInf => Ordering::Less,
            Self::PosInf => Ordering::Greater,
            Self::Key(k) => cmp.compare(k, search).reverse(),
        }
    }
}
