//! Duplicate report model: comparison rules, per-match results, per-path
//! records, and the AND-reducer used by the directory analyzer.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::keys::{path_components, path_from_components};

/// Which metadata fields must match for two items to count as identical.
///
/// The default rule includes everything except atime (atime changes on any
/// read, so requiring it would make almost nothing identical).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateMatchRule {
    pub include_mtime: bool,
    pub include_atime: bool,
    pub include_ctime: bool,
    pub include_mode: bool,
    pub include_owner: bool,
    pub include_group: bool,
}

impl Default for DuplicateMatchRule {
    fn default() -> Self {
        Self {
            include_mtime: true,
            include_atime: false,
            include_ctime: true,
            include_mode: true,
            include_owner: true,
            include_group: true,
        }
    }
}

impl DuplicateMatchRule {
    /// True iff every included field's flag is set.
    pub fn calculate_is_identical(&self, matches: &MetadataMatches) -> bool {
        (!self.include_mtime || matches.mtime)
            && (!self.include_atime || matches.atime)
            && (!self.include_ctime || matches.ctime)
            && (!self.include_mode || matches.mode)
            && (!self.include_owner || matches.owner)
            && (!self.include_group || matches.group)
    }
}

/// The six per-field match flags carried by every [`DuplicateMatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataMatches {
    pub mtime: bool,
    pub atime: bool,
    pub ctime: bool,
    pub mode: bool,
    pub owner: bool,
    pub group: bool,
}

impl Default for MetadataMatches {
    fn default() -> Self {
        Self {
            mtime: true,
            atime: true,
            ctime: true,
            mode: true,
            owner: true,
            group: true,
        }
    }
}

fn time_ns(seconds: i64, nanos: i64) -> i128 {
    i128::from(seconds) * 1_000_000_000 + i128::from(nanos)
}

impl MetadataMatches {
    /// Field-by-field comparison of two stat results, nanosecond precision.
    pub fn from_stats(a: &Metadata, b: &Metadata) -> Self {
        Self {
            mtime: time_ns(a.mtime(), a.mtime_nsec()) == time_ns(b.mtime(), b.mtime_nsec()),
            atime: time_ns(a.atime(), a.atime_nsec()) == time_ns(b.atime(), b.atime_nsec()),
            ctime: time_ns(a.ctime(), a.ctime_nsec()) == time_ns(b.ctime(), b.ctime_nsec()),
            mode: a.mode() == b.mode(),
            owner: a.uid() == b.uid(),
            group: a.gid() == b.gid(),
        }
    }

    pub fn and_assign(&mut self, other: &Self) {
        self.mtime &= other.mtime;
        self.atime &= other.atime;
        self.ctime &= other.ctime;
        self.mode &= other.mode;
        self.owner &= other.owner;
        self.group &= other.group;
    }
}

/// One archive location that duplicates an analyzed item.
///
/// `duplicated_size` / `duplicated_items` are localized to this archive
/// location: the same analyzed child counts once per location it appears in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateMatch {
    /// Path of the duplicate within the archive, relative to archive root.
    pub path: PathBuf,
    pub matches: MetadataMatches,
    pub duplicated_size: u64,
    pub duplicated_items: u64,
    pub is_identical: bool,
    pub is_superset: bool,
    /// Snapshot of the rule the flags were judged under.
    pub rule: DuplicateMatchRule,
}

/// Per analyzed path: its matches plus aggregate counters.
///
/// Unlike the per-match counters, `duplicated_size` / `duplicated_items`
/// here are globally deduplicated: an analyzed child counts once no matter
/// how many archive locations duplicate it. `total_size` / `total_items`
/// are unconditional sums over all children, duplicated or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateRecord {
    /// Path relative to the analyzed root's parent, so the root's own name
    /// is the first component.
    pub path: PathBuf,
    pub matches: Vec<DuplicateMatch>,
    pub total_size: u64,
    pub total_items: u64,
    pub duplicated_size: u64,
    pub duplicated_items: u64,
}

/// msgpack layout of a rule: the six include flags.
type RuleValue = (bool, bool, bool, bool, bool, bool);

/// msgpack layout of one match:
/// `[components, mtime, atime, ctime, mode, owner, group, dup_size, dup_items, is_identical, is_superset, rule]`.
#[derive(Serialize, Deserialize)]
struct MatchValue(
    Vec<String>,
    bool,
    bool,
    bool,
    bool,
    bool,
    bool,
    u64,
    u64,
    bool,
    bool,
    RuleValue,
);

/// msgpack layout of a record:
/// `[components, matches, total_size, total_items, duplicated_size, duplicated_items]`.
#[derive(Serialize, Deserialize)]
struct RecordValue(Vec<String>, Vec<MatchValue>, u64, u64, u64, u64);

impl DuplicateRecord {
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        let matches = self
            .matches
            .iter()
            .map(|m| {
                Ok(MatchValue(
                    path_components(&m.path)?,
                    m.matches.mtime,
                    m.matches.atime,
                    m.matches.ctime,
                    m.matches.mode,
                    m.matches.owner,
                    m.matches.group,
                    m.duplicated_size,
                    m.duplicated_items,
                    m.is_identical,
                    m.is_superset,
                    (
                        m.rule.include_mtime,
                        m.rule.include_atime,
                        m.rule.include_ctime,
                        m.rule.include_mode,
                        m.rule.include_owner,
                        m.rule.include_group,
                    ),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let value = RecordValue(
            path_components(&self.path)?,
            matches,
            self.total_size,
            self.total_items,
            self.duplicated_size,
            self.duplicated_items,
        );
        Ok(rmp_serde::to_vec(&value)?)
    }

    pub fn from_msgpack(data: &[u8]) -> Result<Self> {
        let value: RecordValue = rmp_serde::from_slice(data)?;
        let matches = value
            .1
            .into_iter()
            .map(|m| DuplicateMatch {
                path: path_from_components(&m.0),
                matches: MetadataMatches {
                    mtime: m.1,
                    atime: m.2,
                    ctime: m.3,
                    mode: m.4,
                    owner: m.5,
                    group: m.6,
                },
                duplicated_size: m.7,
                duplicated_items: m.8,
                is_identical: m.9,
                is_superset: m.10,
                rule: DuplicateMatchRule {
                    include_mtime: m.11 .0,
                    include_atime: m.11 .1,
                    include_ctime: m.11 .2,
                    include_mode: m.11 .3,
                    include_owner: m.11 .4,
                    include_group: m.11 .5,
                },
            })
            .collect();

        Ok(Self {
            path: path_from_components(&value.0),
            matches,
            total_size: value.2,
            total_items: value.3,
            duplicated_size: value.4,
            duplicated_items: value.5,
        })
    }

    /// Component-wise path for keying.
    pub fn path_components(&self) -> Result<Vec<String>> {
        path_components(&self.path)
    }
}

/// AND-reduction of metadata comparisons with counter accumulation.
///
/// Starts with every flag true and zero counters; aggregating a match or a
/// stat pair clears any flag that did not match and adds the match's
/// localized counters. The final [`DuplicateMatch`] is produced with the
/// structural verdicts supplied by the caller.
#[derive(Debug)]
pub struct MetadataMatchReducer {
    flags: MetadataMatches,
    duplicated_size: u64,
    duplicated_items: u64,
    rule: DuplicateMatchRule,
}

impl MetadataMatchReducer {
    pub fn new(rule: DuplicateMatchRule) -> Self {
        Self {
            flags: MetadataMatches::default(),
            duplicated_size: 0,
            duplicated_items: 0,
            rule,
        }
    }

    pub fn aggregate_match(&mut self, other: &DuplicateMatch) {
        self.flags.and_assign(&other.matches);
        self.duplicated_size += other.duplicated_size;
        self.duplicated_items += other.duplicated_items;
    }

    pub fn aggregate_stats(&mut self, analyzed: &Metadata, candidate: &Metadata) {
        let flags = MetadataMatches::from_stats(analyzed, candidate);
        self.flags.and_assign(&flags);
    }

    pub fn add_items(&mut self, items: u64) {
        self.duplicated_items += items;
    }

    pub fn flags(&self) -> &MetadataMatches {
        &self.flags
    }

    /// `non_identical` forces `is_identical` false (content or structure
    /// differs); `non_superset` forces `is_superset` false. Both otherwise
    /// require the rule-selected flags to hold.
    pub fn create_duplicate_match(
        self,
        path: &Path,
        non_identical: bool,
        non_superset: bool,
    ) -> DuplicateMatch {
        let metadata_matches = self.rule.calculate_is_identical(&self.flags);
        DuplicateMatch {
            path: path.to_path_buf(),
            matches: self.flags,
            duplicated_size: self.duplicated_size,
            duplicated_items: self.duplicated_items,
            is_identical: !non_identical && metadata_matches,
            is_superset: !non_superset && metadata_matches,
            rule: self.rule,
        }
    }
}
