//! Bottom-up directory duplicate reduction.
//!
//! A directory's result is computed from its children's results: candidate
//! archive directories are discovered as the parents of child duplicates,
//! metadata flags are AND-reduced per candidate, deferred items (symlinks,
//! devices, pipes, sockets, undecided subdirectories) are compared directly
//! against each candidate, and the set-theoretic identity/superset verdicts
//! come from the child-name sets.

use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::trace;

use aridx_store::{
    DuplicateMatch, DuplicateMatchRule, DuplicateRecord, MetadataMatchReducer,
};
use aridx_sync::ChildOutcome;

use crate::error::{CoreError, Result};
use crate::result::{AggregateCounters, AnalysisResult};

/// Report path of an analyzed item: relative to the analyzed root's parent,
/// with the root's own name as the first component.
pub(crate) fn record_path(input_root: &Path, item: &Path) -> PathBuf {
    let root_name = input_root
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_default();
    if item == input_root {
        root_name
    } else {
        match item.strip_prefix(input_root) {
            Ok(relative) => root_name.join(relative),
            Err(_) => root_name.join(item),
        }
    }
}

struct ImmediateChild {
    base_name: String,
    record: Option<DuplicateRecord>,
}

/// Reduce one directory once all children have results.
pub(crate) fn reduce_directory(
    archive_path: &Path,
    input_root: &Path,
    rule: DuplicateMatchRule,
    dir_path: &Path,
    base_name: String,
    outcomes: Vec<ChildOutcome<AnalysisResult>>,
) -> Result<AnalysisResult> {
    let mut immediates: Vec<ImmediateChild> = Vec::new();
    let mut deferred: Vec<String> = Vec::new();
    let mut counters = AggregateCounters::default();

    for outcome in outcomes {
        match outcome {
            // A failed child already fails the run through the task group;
            // the reduction just skips it.
            ChildOutcome::Failed => continue,
            ChildOutcome::Completed(result) => {
                counters.add(result.counters());
                match result {
                    AnalysisResult::Immediate {
                        base_name, record, ..
                    } => immediates.push(ImmediateChild { base_name, record }),
                    AnalysisResult::Deferred { base_name, .. } => deferred.push(base_name),
                }
            }
        }
    }

    // Candidate discovery: the parent directory of any child duplicate,
    // keyed in insertion order. Root-level archive files have no parent
    // directory candidate. Each child contributes its first match per
    // candidate.
    let mut candidate_order: Vec<PathBuf> = Vec::new();
    let mut candidate_index: HashMap<PathBuf, usize> = HashMap::new();
    let mut candidate_children: Vec<Vec<(usize, usize)>> = Vec::new();

    for (child_idx, child) in immediates.iter().enumerate() {
        let Some(record) = &child.record else { continue };
        let mut seen: HashSet<PathBuf> = HashSet::new();
        for (match_idx, m) in record.matches.iter().enumerate() {
            let Some(parent) = m.path.parent() else { continue };
            if parent.as_os_str().is_empty() {
                continue;
            }
            if !seen.insert(parent.to_path_buf()) {
                continue;
            }
            let slot = *candidate_index.entry(parent.to_path_buf()).or_insert_with(|| {
                candidate_order.push(parent.to_path_buf());
                candidate_children.push(Vec::new());
                candidate_order.len() - 1
            });
            candidate_children[slot].push((child_idx, match_idx));
        }
    }

    if candidate_order.is_empty() {
        return Ok(if deferred.is_empty() {
            AnalysisResult::Immediate {
                base_name,
                record: None,
                counters,
            }
        } else {
            // This directory's comparability is decided by its own parent.
            AnalysisResult::Deferred { base_name, counters }
        });
    }

    // Deferred items compare directly against every candidate at once; a
    // candidate that cannot account for a deferred item is out.
    let mut candidate_valid = vec![true; candidate_order.len()];
    let mut deferred_matches: Vec<Vec<Option<DuplicateMatch>>> = Vec::new();
    let mut deferred_total: u64 = 0;

    for name in &deferred {
        let analyzed_item = dir_path.join(name);
        let candidate_items: Vec<PathBuf> = candidate_order
            .iter()
            .map(|candidate| archive_path.join(candidate).join(name))
            .collect();
        let (matched, per_candidate) = compare_deferred_item(&analyzed_item, &candidate_items, rule);
        deferred_total += matched;
        for (idx, entry) in per_candidate.iter().enumerate() {
            if entry.is_none() {
                candidate_valid[idx] = false;
            }
        }
        deferred_matches.push(per_candidate);
    }
    counters.duplicated_items += deferred_total;

    let analyzed_items: HashSet<String> = immediates
        .iter()
        .map(|c| c.base_name.clone())
        .chain(deferred.iter().cloned())
        .collect();

    let dir_stat = std::fs::metadata(dir_path)?;

    let mut matches: Vec<DuplicateMatch> = Vec::new();
    for (idx, candidate) in candidate_order.iter().enumerate() {
        if !candidate_valid[idx] {
            continue;
        }
        let full_candidate = archive_path.join(candidate);
        let candidate_stat = match std::fs::metadata(&full_candidate) {
            Ok(stat) if stat.is_dir() => stat,
            // Not a directory (or vanished): not a candidate after all.
            _ => continue,
        };

        let mut reducer = MetadataMatchReducer::new(rule);

        for &(child_idx, match_idx) in &candidate_children[idx] {
            let record = immediates[child_idx].record.as_ref().expect("indexed child has record");
            let child_match = &record.matches[match_idx];
            if child_match.rule != rule {
                return Err(CoreError::InconsistentRule(dir_path.to_path_buf()));
            }
            reducer.aggregate_match(child_match);
        }

        for per_candidate in &deferred_matches {
            if let Some(deferred_match) = &per_candidate[idx] {
                reducer.aggregate_match(deferred_match);
            }
        }

        reducer.aggregate_stats(&dir_stat, &candidate_stat);

        let Some(candidate_items) = read_dir_names(&full_candidate) else {
            continue;
        };
        let non_identical = analyzed_items != candidate_items;
        let non_superset = !analyzed_items.is_subset(&candidate_items);

        trace!(
            candidate = %candidate.display(),
            non_identical,
            non_superset,
            "candidate reduced"
        );
        matches.push(reducer.create_duplicate_match(candidate, non_identical, non_superset));
    }

    if matches.is_empty() {
        return Ok(AnalysisResult::Immediate {
            base_name,
            record: None,
            counters,
        });
    }

    let record = DuplicateRecord {
        path: record_path(input_root, dir_path),
        matches,
        total_size: counters.total_size,
        total_items: counters.total_items,
        duplicated_size: counters.duplicated_size,
        duplicated_items: counters.duplicated_items,
    };

    Ok(AnalysisResult::Immediate {
        base_name,
        record: Some(record),
        counters,
    })
}

fn file_type_bits(metadata: &Metadata) -> u32 {
    metadata.mode() & nix::sys::stat::SFlag::S_IFMT.bits()
}

fn read_dir_names(path: &Path) -> Option<HashSet<String>> {
    let reader = std::fs::read_dir(path).ok()?;
    Some(
        reader
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect(),
    )
}

struct CandidateSlot {
    reducer: MetadataMatchReducer,
    stat: Metadata,
}

/// Compare a single deferred item against candidate item paths.
///
/// Returns `(total_matched, per_candidate)`: `total_matched` counts items
/// verified present in at least one candidate; `per_candidate` holds a
/// reduced match per still-valid candidate, `None` for invalidated ones.
/// Filesystem errors invalidate the affected candidate rather than failing
/// the reduction.
fn compare_deferred_item(
    analyzed: &Path,
    candidates: &[PathBuf],
    rule: DuplicateMatchRule,
) -> (u64, Vec<Option<DuplicateMatch>>) {
    let none_for_all = || (0, candidates.iter().map(|_| None).collect::<Vec<_>>());

    let analyzed_stat = match std::fs::symlink_metadata(analyzed) {
        Ok(stat) => stat,
        Err(_) => return none_for_all(),
    };

    // First pass: lstat the candidates and keep those of the same type,
    // pre-aggregating the stat pair into each survivor's reducer.
    let mut slots: Vec<Option<CandidateSlot>> = candidates
        .iter()
        .map(|candidate| {
            let stat = std::fs::symlink_metadata(candidate).ok()?;
            if file_type_bits(&stat) != file_type_bits(&analyzed_stat) {
                return None;
            }
            let mut reducer = MetadataMatchReducer::new(rule);
            reducer.aggregate_stats(&analyzed_stat, &stat);
            Some(CandidateSlot { reducer, stat })
        })
        .collect();

    let file_type = analyzed_stat.file_type();
    let mut total_matched: u64 = 0;
    let mut non_identical = vec![false; candidates.len()];
    let mut non_superset = vec![false; candidates.len()];

    if file_type.is_symlink() {
        let target = match std::fs::read_link(analyzed) {
            Ok(target) => target,
            Err(_) => return none_for_all(),
        };
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                continue;
            }
            let same_target = std::fs::read_link(&candidates[idx])
                .map(|t| t == target)
                .unwrap_or(false);
            if same_target {
                slot.as_mut().unwrap().reducer.add_items(1);
            } else {
                *slot = None;
            }
        }
        if slots.iter().any(Option::is_some) {
            total_matched = 1;
        }
    } else if file_type.is_block_device() || file_type.is_char_device() {
        let analyzed_major = nix::sys::stat::major(analyzed_stat.rdev());
        let analyzed_minor = nix::sys::stat::minor(analyzed_stat.rdev());
        for slot in slots.iter_mut() {
            let Some(inner) = slot else { continue };
            let same_device = nix::sys::stat::major(inner.stat.rdev()) == analyzed_major
                && nix::sys::stat::minor(inner.stat.rdev()) == analyzed_minor;
            if same_device {
                inner.reducer.add_items(1);
            } else {
                *slot = None;
            }
        }
        if slots.iter().any(Option::is_some) {
            total_matched = 1;
        }
    } else if file_type.is_fifo() || file_type.is_socket() {
        // Existence of the same type is sufficient.
        for slot in slots.iter_mut().flatten() {
            slot.reducer.add_items(1);
        }
        if slots.iter().any(Option::is_some) {
            total_matched = 1;
        }
    } else if file_type.is_dir() {
        let Some(child_names) = read_dir_names(analyzed) else {
            return none_for_all();
        };
        let mut sorted_names: Vec<&String> = child_names.iter().collect();
        sorted_names.sort();

        for name in sorted_names {
            let valid_indices: Vec<usize> = slots
                .iter()
                .enumerate()
                .filter_map(|(idx, slot)| slot.is_some().then_some(idx))
                .collect();
            if valid_indices.is_empty() {
                break;
            }
            let child_candidates: Vec<PathBuf> = valid_indices
                .iter()
                .map(|&idx| candidates[idx].join(name))
                .collect();
            let (child_total, child_results) =
                compare_deferred_item(&analyzed.join(name), &child_candidates, rule);
            total_matched += child_total;
            for (compressed, &idx) in valid_indices.iter().enumerate() {
                match &child_results[compressed] {
                    Some(child_match) => {
                        slots[idx].as_mut().unwrap().reducer.aggregate_match(child_match)
                    }
                    None => slots[idx] = None,
                }
            }
        }

        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                continue;
            }
            match read_dir_names(&candidates[idx]) {
                Some(candidate_names) => {
                    non_identical[idx] = child_names != candidate_names;
                    non_superset[idx] = !child_names.is_subset(&candidate_names);
                }
                None => *slot = None,
            }
        }
    } else if file_type.is_file() {
        // Regular files inside a deferred subtree: gate on size only; the
        // content was never verified, so they add nothing to the counts.
        for slot in slots.iter_mut() {
            let Some(inner) = slot else { continue };
            if inner.stat.len() != analyzed_stat.len() {
                *slot = None;
            }
        }
    } else {
        return none_for_all();
    }

    let results = slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.map(|s| {
                s.reducer
                    .create_duplicate_match(&candidates[idx], non_identical[idx], non_superset[idx])
            })
        })
        .collect();

    (total_matched, results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn record_path_includes_root_name() {
        let root = Path::new("/data/target");
        assert_eq!(record_path(root, root), PathBuf::from("target"));
        assert_eq!(
            record_path(root, Path::new("/data/target/sub/file.txt")),
            PathBuf::from("target/sub/file.txt")
        );
    }

    #[test]
    fn deferred_symlink_requires_equal_target() {
        let dir = tempfile::tempdir().unwrap();
        let analyzed = dir.path().join("analyzed");
        let good = dir.path().join("good");
        let bad = dir.path().join("bad");
        std::os::unix::fs::symlink("shared-target", &analyzed).unwrap();
        std::os::unix::fs::symlink("shared-target", &good).unwrap();
        std::os::unix::fs::symlink("other-target", &bad).unwrap();

        let (matched, results) = compare_deferred_item(
            &analyzed,
            &[good, bad],
            DuplicateMatchRule::default(),
        );
        assert_eq!(matched, 1);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert_eq!(results[0].as_ref().unwrap().duplicated_items, 1);
    }

    #[test]
    fn deferred_fifo_matches_on_type() {
        let dir = tempfile::tempdir().unwrap();
        let analyzed = dir.path().join("a.pipe");
        let candidate = dir.path().join("b.pipe");
        let wrong_type = dir.path().join("regular");
        nix::unistd::mkfifo(&analyzed, nix::sys::stat::Mode::from_bits_truncate(0o644)).unwrap();
        nix::unistd::mkfifo(&candidate, nix::sys::stat::Mode::from_bits_truncate(0o644)).unwrap();
        fs::write(&wrong_type, "x").unwrap();

        let (matched, results) = compare_deferred_item(
            &analyzed,
            &[candidate, wrong_type],
            DuplicateMatchRule::default(),
        );
        assert_eq!(matched, 1);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
    }

    #[test]
    fn deferred_directory_recurses_and_counts_special_items() {
        let dir = tempfile::tempdir().unwrap();
        let analyzed = dir.path().join("analyzed");
        let candidate = dir.path().join("candidate");
        fs::create_dir(&analyzed).unwrap();
        fs::create_dir(&candidate).unwrap();

        // Same-size regular file (unverified, counts zero) plus a symlink
        // (counts one).
        fs::write(analyzed.join("data.bin"), "12345").unwrap();
        fs::write(candidate.join("data.bin"), "54321").unwrap();
        std::os::unix::fs::symlink("t", analyzed.join("link")).unwrap();
        std::os::unix::fs::symlink("t", candidate.join("link")).unwrap();

        let (matched, results) = compare_deferred_item(
            &analyzed,
            &[candidate.clone()],
            DuplicateMatchRule::default(),
        );
        assert_eq!(matched, 1);
        let result = results[0].as_ref().unwrap();
        assert_eq!(result.duplicated_items, 1);

        // A size mismatch invalidates the candidate; with no candidates
        // left the remaining children are never compared.
        fs::write(candidate.join("data.bin"), "123").unwrap();
        let (matched, results) =
            compare_deferred_item(&analyzed, &[candidate], DuplicateMatchRule::default());
        assert_eq!(matched, 0);
        assert!(results[0].is_none());
    }

    #[test]
    fn deferred_missing_candidate_is_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let analyzed = dir.path().join("link");
        std::os::unix::fs::symlink("t", &analyzed).unwrap();

        let (matched, results) = compare_deferred_item(
            &analyzed,
            &[dir.path().join("missing")],
            DuplicateMatchRule::default(),
        );
        assert_eq!(matched, 0);
        assert!(results[0].is_none());
    }
}
