/*
 * Created on Sun Jul 26 2026
*/

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Errors that can occur while building an [`crate::IndexOptions`]
pub enum ConfigError {
    /// `mapping_table_capacity` was zero or not a power of two
    BadMappingTableCapacity,
    /// `tower_levels` was zero
    BadTowerLevels,
    /// a merge-lower threshold was not strictly less than half its matching split-upper
    BadMergeSplitRelation,
    /// `epoch_interval_ms` was zero
    BadEpochInterval,
}

impl ConfigError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadMappingTableCapacity => {
                "mapping_table_capacity must be a nonzero power of two"
            }
            Self::BadTowerLevels => "tower_levels must be nonzero",
            Self::BadMergeSplitRelation => "merge threshold must be < upper / 2",
            Self::BadEpochInterval => "epoch_interval_ms must be nonzero",
        }
    }
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ConfigError {}
