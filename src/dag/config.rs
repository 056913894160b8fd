use crate::dag::pointer::NodePointer;
use crate::dag::DagError;

/// Sizing of the geometry node pool. All quantities are powers of two,
/// configured by their bit widths.
///
/// The address space is split into buckets, each a contiguous run of
/// `1 << page_bits_per_bucket` pages of `1 << word_bits_per_page` words.
/// Every level of the octree owns a disjoint range of buckets: the first
/// `top_level_count` levels get `1 << bucket_bits_per_top_level` buckets
/// each, the remaining levels get `1 << bucket_bits_per_bottom_level`.
/// Lower levels hold the vast majority of distinct nodes, hence the split.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    /// Octree depth; the world is `2^level_count` voxels per axis.
    pub level_count: u32,
    /// Number of levels (from the root down) using the top bucket count.
    pub top_level_count: u32,
    pub word_bits_per_page: u32,
    pub page_bits_per_bucket: u32,
    pub bucket_bits_per_top_level: u32,
    pub bucket_bits_per_bottom_level: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            level_count: 17,
            top_level_count: 9,
            word_bits_per_page: 14,
            page_bits_per_bucket: 2,
            bucket_bits_per_top_level: 7,
            bucket_bits_per_bottom_level: 11,
        }
    }
}

impl NodeConfig {
    /// The level at which single voxels live. Levels `0..=leaf_level` hold
    /// stored nodes; the two levels below the leaf level are packed into the
    /// leaf's 64 occupancy bits.
    #[inline]
    pub fn voxel_level(&self) -> u32 {
        self.level_count
    }

    /// Level of the 4x4x4 packed leaves.
    #[inline]
    pub fn leaf_level(&self) -> u32 {
        self.level_count - 2
    }

    /// World side length in voxels.
    #[inline]
    pub fn resolution(&self) -> u32 {
        1 << self.level_count
    }

    #[inline]
    pub fn words_per_page(&self) -> u32 {
        1 << self.word_bits_per_page
    }

    #[inline]
    pub fn pages_per_bucket(&self) -> u32 {
        1 << self.page_bits_per_bucket
    }

    #[inline]
    pub fn words_per_bucket(&self) -> u32 {
        1 << (self.word_bits_per_page + self.page_bits_per_bucket)
    }

    /// Bucket count of one level.
    #[inline]
    pub fn buckets_at_level(&self, level: u32) -> u32 {
        if level < self.top_level_count {
            1 << self.bucket_bits_per_top_level
        } else {
            1 << self.bucket_bits_per_bottom_level
        }
    }

    /// First bucket of a level's range. Levels are laid out back to back.
    pub fn bucket_base(&self, level: u32) -> u32 {
        let top = level.min(self.top_level_count);
        let bottom = level - top;
        (top << self.bucket_bits_per_top_level) + (bottom << self.bucket_bits_per_bottom_level)
    }

    #[inline]
    pub fn total_buckets(&self) -> u32 {
        self.bucket_base(self.leaf_level() + 1)
    }

    #[inline]
    pub fn total_pages(&self) -> u32 {
        self.total_buckets() << self.page_bits_per_bucket
    }

    pub fn total_words(&self) -> u64 {
        (self.total_buckets() as u64) << (self.word_bits_per_page + self.page_bits_per_bucket)
    }

    /// Levels at which the edit engine stops fanning out to the thread pool.
    /// Every spawned task then covers at least `8^(level_count - spawn)`
    /// voxels, which keeps task counts bounded near the leaves.
    pub fn spawn_level(&self) -> u32 {
        (self.level_count / 3).clamp(1, 6).min(self.leaf_level())
    }

    pub fn validate(&self) -> Result<(), DagError> {
        if self.level_count < 3 {
            return Err(DagError::InvalidConfig("level_count must be at least 3"));
        }
        if self.level_count > 17 {
            return Err(DagError::InvalidConfig("level_count must be at most 17"));
        }
        if self.top_level_count > self.leaf_level() + 1 {
            return Err(DagError::InvalidConfig(
                "top_level_count exceeds the number of node levels",
            ));
        }
        if self.bucket_bits_per_top_level > self.bucket_bits_per_bottom_level {
            return Err(DagError::InvalidConfig(
                "top levels must not have more buckets than bottom levels",
            ));
        }
        if self.total_words() > NodePointer::MAX_ADDRESS as u64 + 1 {
            return Err(DagError::InvalidConfig(
                "total word capacity does not fit the 32-bit address space",
            ));
        }
        Ok(())
    }
}

/// Sizing and rewrite policy of the color pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColorConfig {
    /// Level of the VBR leaves. A leaf covers all voxels of a
    /// `2^(level_count - leaf_level)` sided cube. Must not exceed the
    /// geometry leaf level.
    pub leaf_level: u32,
    /// log2 of color nodes (8 words each) per node-store page.
    pub node_bits_per_node_page: u32,
    /// log2 of words per leaf-store page.
    pub word_bits_per_leaf_page: u32,
    /// When false, rewriting a leaf reuses its slot if the new chunk fits.
    /// When true every write allocates a fresh slot, preserving old chunks
    /// for history/undo at the cost of address space.
    pub keep_history: bool,
}

impl Default for ColorConfig {
    fn default() -> Self {
        ColorConfig {
            leaf_level: 10,
            node_bits_per_node_page: 18,
            word_bits_per_leaf_page: 24,
            keep_history: false,
        }
    }
}

impl ColorConfig {
    #[inline]
    pub fn nodes_per_page(&self) -> u32 {
        1 << self.node_bits_per_node_page
    }

    #[inline]
    pub fn node_words_per_page(&self) -> u32 {
        8 << self.node_bits_per_node_page
    }

    #[inline]
    pub fn leaf_words_per_page(&self) -> u32 {
        1 << self.word_bits_per_leaf_page
    }

    pub fn validate(&self, nodes: &NodeConfig) -> Result<(), DagError> {
        if self.leaf_level > nodes.leaf_level() {
            return Err(DagError::InvalidConfig(
                "color leaf_level must not exceed the geometry leaf level",
            ));
        }
        if self.node_bits_per_node_page > 27 || self.word_bits_per_leaf_page > 30 {
            return Err(DagError::InvalidConfig("color page size exceeds the address space"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    /// Tests the bucket layout of the default configuration.
    #[test]
    fn default_layout() {
        let config = NodeConfig::default();
        config.validate().unwrap();

        assert_eq!(config.voxel_level(), 17);
        assert_eq!(config.leaf_level(), 15);
        assert_eq!(config.resolution(), 131072);

        // 9 top levels with 128 buckets, 7 bottom levels with 2048
        assert_eq!(config.buckets_at_level(0), 128);
        assert_eq!(config.buckets_at_level(8), 128);
        assert_eq!(config.buckets_at_level(9), 2048);
        assert_eq!(config.bucket_base(0), 0);
        assert_eq!(config.bucket_base(9), 9 * 128);
        assert_eq!(config.bucket_base(10), 9 * 128 + 2048);
        assert_eq!(config.total_buckets(), 9 * 128 + 7 * 2048);
    }

    #[test]
    fn rejects_invalid() {
        let mut config = NodeConfig {
            level_count: 2,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(DagError::InvalidConfig(_))));

        config.level_count = 17;
        config.bucket_bits_per_top_level = 12;
        assert!(matches!(config.validate(), Err(DagError::InvalidConfig(_))));

        config = NodeConfig::default();
        config.word_bits_per_page = 20;
        config.bucket_bits_per_bottom_level = 14;
        assert!(matches!(config.validate(), Err(DagError::InvalidConfig(_))));

        let colors = ColorConfig {
            leaf_level: 16,
            ..ColorConfig::default()
        };
        assert!(matches!(
            colors.validate(&NodeConfig::default()),
            Err(DagError::InvalidConfig(_))
        ));
    }
}
