//! The `diff-tree` command: render an analyzed directory against its best
//! archive duplicate as an annotated tree.
//!
//! Markers: `[A]` analyzed-only, `[R]` archive-only, `[D]` different
//! content, `[M]` content match with metadata differences, `[+]` superset
//! directory. Fully identical entries are elided.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use aridx_store::{
    find_report_for_path, report_directory_for, DuplicateRecord, ReportStore,
};

const BRANCH: &str = "├── ";
const LAST_BRANCH: &str = "└── ";
const VERTICAL: &str = "│   ";
const SPACE: &str = "    ";

pub fn do_diff_tree(
    target: &Path,
    max_depth: Option<usize>,
    hide_content_match: bool,
) -> Result<()> {
    let analyzed = find_report_for_path(target)
        .with_context(|| format!("no analysis report found for {}", target.display()))?;
    let report_dir = report_directory_for(&analyzed);
    let store = ReportStore::open(&report_dir, false)
        .with_context(|| format!("failed to open report {}", report_dir.display()))?;
    let manifest = store.read_manifest().context("report manifest unreadable")?;
    let archive_base = PathBuf::from(&manifest.archive_path);

    let root_rel = PathBuf::from(analyzed.file_name().unwrap_or_default());
    let root_record = store.lookup_record(&root_rel)?;
    let candidate = root_record.as_ref().and_then(best_candidate);

    match &candidate {
        Some(candidate_rel) => println!(
            "{} <~> {}",
            analyzed.display(),
            archive_base.join(candidate_rel).display()
        ),
        None => println!("{} (no directory duplicate in archive)", analyzed.display()),
    }

    let renderer = Renderer {
        store,
        archive_base,
        hide_content_match,
        max_depth,
    };
    renderer.render_dir(&analyzed, candidate.as_deref(), &root_rel, "", 0)?;
    Ok(())
}

/// Prefer identical, then superset, then the widest coverage.
fn best_candidate(record: &DuplicateRecord) -> Option<PathBuf> {
    record
        .matches
        .iter()
        .max_by_key(|m| (m.is_identical, m.is_superset, m.duplicated_items))
        .map(|m| m.path.clone())
}

struct Renderer {
    store: ReportStore,
    archive_base: PathBuf,
    hide_content_match: bool,
    max_depth: Option<usize>,
}

impl Renderer {
    fn render_dir(
        &self,
        analyzed_dir: &Path,
        candidate_rel: Option<&Path>,
        report_rel: &Path,
        indent: &str,
        depth: usize,
    ) -> Result<()> {
        if let Some(limit) = self.max_depth {
            if depth >= limit {
                return Ok(());
            }
        }

        let analyzed_names = dir_names(analyzed_dir);
        let candidate_names = candidate_rel
            .map(|rel| dir_names(&self.archive_base.join(rel)))
            .unwrap_or_default();

        let all_names: BTreeSet<String> = analyzed_names
            .iter()
            .chain(candidate_names.iter())
            .cloned()
            .collect();

        let mut lines: Vec<(String, Option<(PathBuf, Option<PathBuf>, PathBuf)>)> = Vec::new();

        for name in &all_names {
            let in_analyzed = analyzed_names.contains(name);
            let in_candidate = candidate_names.contains(name);
            let analyzed_path = analyzed_dir.join(name);
            let child_report_rel = report_rel.join(name);

            if in_analyzed && !in_candidate {
                lines.push((
                    format!("{name} [A]"),
                    self.recurse_into(&analyzed_path, None, &child_report_rel),
                ));
                continue;
            }
            if !in_analyzed && in_candidate {
                lines.push((format!("{name} [R]"), None));
                continue;
            }

            let candidate_child_rel = candidate_rel.map(|rel| rel.join(name));
            let record = self.store.lookup_record(&child_report_rel)?;
            let match_here = record.as_ref().and_then(|r| {
                candidate_child_rel
                    .as_ref()
                    .and_then(|rel| r.matches.iter().find(|m| &m.path == rel))
            });

            if analyzed_path.is_dir() {
                let marker = match match_here {
                    Some(m) if m.is_identical => continue, // elide identical subtrees
                    Some(m) if m.is_superset => " [+]",
                    Some(_) => " [M]",
                    None => " [D]",
                };
                lines.push((
                    format!("{name}/{marker}"),
                    self.recurse_into(&analyzed_path, candidate_child_rel.as_deref(), &child_report_rel),
                ));
            } else {
                match match_here {
                    Some(m) if m.is_identical => continue, // elide
                    Some(_) => {
                        if !self.hide_content_match {
                            lines.push((format!("{name} [M]"), None));
                        }
                    }
                    None => lines.push((format!("{name} [D]"), None)),
                }
            }
        }

        let count = lines.len();
        for (index, (label, recurse)) in lines.into_iter().enumerate() {
            let last = index + 1 == count;
            let connector = if last { LAST_BRANCH } else { BRANCH };
            println!("{indent}{connector}{label}");
            if let Some((child_dir, child_candidate, child_rel)) = recurse {
                let child_indent = format!("{indent}{}", if last { SPACE } else { VERTICAL });
                self.render_dir(
                    &child_dir,
                    child_candidate.as_deref(),
                    &child_rel,
                    &child_indent,
                    depth + 1,
                )?;
            }
        }
        Ok(())
    }

    fn recurse_into(
        &self,
        analyzed_path: &Path,
        candidate_rel: Option<&Path>,
        report_rel: &Path,
    ) -> Option<(PathBuf, Option<PathBuf>, PathBuf)> {
        analyzed_path.is_dir().then(|| {
            (
                analyzed_path.to_path_buf(),
                candidate_rel.map(Path::to_path_buf),
                report_rel.to_path_buf(),
            )
        })
    }
}

fn dir_names(path: &Path) -> BTreeSet<String> {
    match std::fs::read_dir(path) {
        Ok(reader) => reader
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect(),
        Err(_) => BTreeSet::new(),
    }
}
