/*
 * Created on Sun Jul 26 2026
*/

//! `lfidx`: concurrent, epoch-reclaimed ordered index structures.
//!
//! Two engines share one configuration surface and one public API shape:
//! [`BwTree`] is a latch-free Bw-Tree; [`SkipList`] is a lock-free skip
//! list. Both are addressed through [`IndexOptions`], built once and
//! validated via a construction-time `assert!` rather than a fallible,
//! caller-recoverable builder — a bad `tower_levels` or
//! `mapping_table_capacity` is a programming error, not a runtime
//! condition the caller should be handed a `Result` to recover from.

pub(crate) mod bloom;
pub mod bwtree;
pub mod common;
pub(crate) mod delta;
pub mod error;
pub(crate) mod mapping;
pub(crate) mod mem;
pub mod skiplist;
pub(crate) mod sync;

pub use bwtree::{BwTree, BwTreeOptions};
pub use common::{AsKey, AsValue, Bound, DefaultConfig, IndexConfig, KeyComparator, OrdKeyCmp, OrdValCmp, ValueComparator};
pub use error::ConfigError;
pub use skiplist::{SkipList, SkipListOptions};

/// Resolved, validated construction parameters for either engine.
///
/// `engine_kind` selects which structure [`IndexOptions::build_bwtree`]
/// or [`IndexOptions::build_skiplist`] is meant for; the two constructors
/// simply read the fields relevant to their own engine and ignore the
/// rest, so one options struct covers both.
#[derive(Clone, Debug)]
pub struct IndexOptions {
    unique_key_mode: bool,
    tower_levels: usize,
    leaf_split_upper: usize,
    leaf_merge_lower: usize,
    inner_split_upper: usize,
    inner_merge_lower: usize,
    consolidation_depth_threshold: usize,
    epoch_interval_ms: u64,
    mapping_table_capacity: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            unique_key_mode: false,
            tower_levels: 10,
            leaf_split_upper: 128,
            leaf_merge_lower: 32,
            inner_split_upper: 128,
            inner_merge_lower: 32,
            consolidation_depth_threshold: delta::DEFAULT_CONSOLIDATE_DEPTH,
            epoch_interval_ms: 16,
            mapping_table_capacity: 1 << 16,
        }
    }
}

impl IndexOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unique_key_mode(mut self, v: bool) -> Self {
        self.unique_key_mode = v;
        self
    }

    pub fn tower_levels(mut self, v: usize) -> Self {
        self.tower_levels = v;
        self
    }

    pub fn leaf_split_upper(mut self, v: usize) -> Self {
        self.leaf_split_upper = v;
        self
    }

    pub fn leaf_merge_lower(mut self, v: usize) -> Self {
        self.leaf_merge_lower = v;
        self
    }

    pub fn inner_split_upper(mut self, v: usize) -> Self {
        self.inner_split_upper = v;
        self
    }

    pub fn inner_merge_lower(mut self, v: usize) -> Self {
        self.inner_merge_lower = v;
        self
    }

    pub fn consolidation_depth_threshold(mut self, v: usize) -> Self {
        self.consolidation_depth_threshold = v;
        self
    }

    pub fn epoch_interval_ms(mut self, v: u64) -> Self {
        self.epoch_interval_ms = v;
        self
    }

    pub fn mapping_table_capacity(mut self, v: usize) -> Self {
        self.mapping_table_capacity = v;
        self
    }

    /// Validates every cross-field relation. Returns the first violated
    /// relation rather than panicking directly, so a caller that
    /// genuinely wants to report rather than crash (e.g. a config file
    /// parser in a test harness) has a path to do so;
    /// [`Self::build_bwtree`] and [`Self::build_skiplist`] panic on this
    /// same check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mapping_table_capacity == 0 || !self.mapping_table_capacity.is_power_of_two() {
            return Err(ConfigError::BadMappingTableCapacity);
        }
        if self.tower_levels == 0 {
            return Err(ConfigError::BadTowerLevels);
        }
        if self.epoch_interval_ms == 0 {
            return Err(ConfigError::BadEpochInterval);
        }
        if self.leaf_merge_lower * 2 >= self.leaf_split_upper || self.inner_merge_lower * 2 >= self.inner_split_upper {
            return Err(ConfigError::BadMergeSplitRelation);
        }
        Ok(())
    }

    /// Builds a [`BwTree`]. Panics if [`Self::validate`] fails.
    pub fn build_bwtree<K, V, C>(self, config: C) -> BwTree<K, V, C>
    where
        K: Clone + Ord + Send + Sync + 'static,
        V: Clone + Eq + std::hash::Hash + Send + Sync + 'static,
        C: IndexConfig<K, V>,
    {
        self.validate()
            .unwrap_or_else(|e| panic!("invalid IndexOptions: {}", e));
        BwTree::new(
            config,
            BwTreeOptions {
                mapping_table_capacity: self.mapping_table_capacity,
                leaf_split_upper: self.leaf_split_upper,
                leaf_merge_lower: self.leaf_merge_lower,
                inner_split_upper: self.inner_split_upper,
                inner_merge_lower: self.inner_merge_lower,
                consolidation_depth_threshold: self.consolidation_depth_threshold,
                epoch_interval_ms: self.epoch_interval_ms,
                unique_key_mode: self.unique_key_mode,
            },
        )
    }

    /// Builds a [`SkipList`]. Panics if [`Self::validate`] fails.
    pub fn build_skiplist<K, V, C>(self, config: C) -> SkipList<K, V, C>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + PartialEq + Send + Sync + 'static,
        C: IndexConfig<K, V>,
    {
        self.validate()
            .unwrap_or_else(|e| panic!("invalid IndexOptions: {}", e));
        SkipList::new(
            config,
            SkipListOptions {
                tower_levels: self.tower_levels,
                unique_key_mode: self.unique_key_mode,
                epoch_interval_ms: self.epoch_interval_ms,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_bad_mapping_capacity() {
        let opts = IndexOptions::new().mapping_table_capacity(3);
        assert_eq!(opts.validate(), Err(ConfigError::BadMappingTableCapacity));
    }

    #[test]
    fn validate_rejects_bad_tower_levels() {
        let opts = IndexOptions::new().tower_levels(0);
        assert_eq!(opts.validate(), Err(ConfigError::BadTowerLevels));
    }

    #[test]
    fn validate_rejects_bad_merge_split_relation() {
        let opts = IndexOptions::new().leaf_split_upper(8).leaf_merge_lower(4);
        assert_eq!(opts.validate(), Err(ConfigError::BadMergeSplitRelation));
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(IndexOptions::new().validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "invalid IndexOptions")]
    fn build_bwtree_panics_on_bad_options() {
        let opts = IndexOptions::new().tower_levels(0);
        let _ = opts.build_bwtree::<i32, i32, _>(DefaultConfig::new(0));
    }

    #[test]
    fn build_skiplist_round_trips() {
        let opts = IndexOptions::new().tower_levels(4).epoch_interval_ms(5);
        let list = opts.build_skiplist(DefaultConfig::new(0));
        assert!(list.insert(1, 10));
        let mut out = vec![];
        list.get_values(&1, &mut out);
        assert_eq!(out, vec![10]);
    }

    #[test]
    fn build_bwtree_round_trips() {
        let opts = IndexOptions::new().mapping_table_capacity(64).epoch_interval_ms(5);
        let tree = opts.build_bwtree(DefaultConfig::new(0));
        assert!(tree.insert(1, 10));
        let mut out = vec![];
        tree.get_values(&1, &mut out);
        assert_eq!(out, vec![10]);
    }
}
