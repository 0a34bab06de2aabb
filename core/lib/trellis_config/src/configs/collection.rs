use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionConfig {
    /// Entries stored per log data block before a new tail is allocated.
    pub entries_per_block: usize,
    /// Actions appended since the last checkpoint before the owner writes a
    /// new one.
    pub checkpoint_interval: usize,
}

impl CollectionConfig {
    pub fn for_tests() -> Self {
        Self {
            entries_per_block: 4,
            checkpoint_interval: 8,
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            entries_per_block: 32,
            checkpoint_interval: 64,
        }
    }
}
