//! Analysis results flowing bottom-up through the listener tree.

use aridx_store::DuplicateRecord;

/// The four aggregate counters every child hands to its parent.
///
/// `total_size` / `total_items` are unconditional: every child contributes
/// whether or not it has duplicates. `duplicated_size` / `duplicated_items`
/// are globally deduplicated (a child counts once no matter how many archive
/// locations duplicate it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateCounters {
    pub total_size: u64,
    pub total_items: u64,
    pub duplicated_size: u64,
    pub duplicated_items: u64,
}

impl AggregateCounters {
    pub fn add(&mut self, other: &Self) {
        self.total_size += other.total_size;
        self.total_items += other.total_items;
        self.duplicated_size += other.duplicated_size;
        self.duplicated_items += other.duplicated_items;
    }
}

/// One child's analysis output.
#[derive(Debug, Clone)]
pub enum AnalysisResult {
    /// The child determined its own matches (possibly none).
    Immediate {
        base_name: String,
        record: Option<DuplicateRecord>,
        counters: AggregateCounters,
    },
    /// The child could not decide on its own (non-regular file, or a
    /// directory with no candidates); its parent decides by direct
    /// comparison. Carries counters only.
    Deferred {
        base_name: String,
        counters: AggregateCounters,
    },
}

impl AnalysisResult {
    pub fn base_name(&self) -> &str {
        match self {
            Self::Immediate { base_name, .. } | Self::Deferred { base_name, .. } => base_name,
        }
    }

    pub fn counters(&self) -> &AggregateCounters {
        match self {
            Self::Immediate { counters, .. } | Self::Deferred { counters, .. } => counters,
        }
    }
}
