//! The `describe` command: render stored report records.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use tracing::warn;

use aridx_store::{
    find_archive_for_path, find_report_for_path, report_directory_for, ArchiveStore,
    DuplicateMatch, DuplicateRecord, ReportStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SortBy {
    Size,
    Items,
    Identical,
    Path,
}

#[derive(Debug)]
pub struct DescribeOptions {
    pub limit: Option<usize>,
    pub sort_by: SortBy,
    pub use_bytes: bool,
    pub show_details: bool,
}

pub fn do_describe(paths: &[PathBuf], options: &DescribeOptions) -> Result<()> {
    let first = paths.first().context("no paths given")?;
    let analyzed = find_report_for_path(first)
        .with_context(|| format!("no analysis report found for {}", first.display()))?;
    let report_dir = report_directory_for(&analyzed);
    let store = ReportStore::open(&report_dir, false)
        .with_context(|| format!("failed to open report {}", report_dir.display()))?;
    let manifest = store.read_manifest().context("report manifest unreadable")?;

    // Best-effort validation against the live archive.
    if let Some(archive_path) = find_archive_for_path(Path::new(&manifest.archive_path)) {
        if let Ok(archive_store) = ArchiveStore::open(&archive_path, false) {
            if let Ok(Some(current_id)) = archive_store.get_archive_id() {
                if current_id != manifest.archive_id {
                    warn!(
                        report = %report_dir.display(),
                        "report was produced against a different archive index; results may be stale"
                    );
                }
            }
        }
    }

    if options.show_details {
        println!("Report:    {}", report_dir.display());
        println!("Analyzed:  {}", analyzed.display());
        println!("Archive:   {}", manifest.archive_path);
        println!("Timestamp: {}", manifest.timestamp);
        println!();
    }

    if paths.len() > 1 {
        describe_table(&store, &analyzed, paths, options)?;
    } else {
        describe_single(&store, &analyzed, first, options)?;
    }
    Ok(())
}

fn report_relative(analyzed: &Path, target: &Path) -> Result<PathBuf> {
    let target = target
        .canonicalize()
        .unwrap_or_else(|_| target.to_path_buf());
    let root_name = PathBuf::from(analyzed.file_name().unwrap_or_default());
    if target == *analyzed {
        return Ok(root_name);
    }
    match target.strip_prefix(analyzed) {
        Ok(relative) => Ok(root_name.join(relative)),
        Err(_) => bail!(
            "{} is not inside the analyzed path {}",
            target.display(),
            analyzed.display()
        ),
    }
}

fn describe_single(
    store: &ReportStore,
    analyzed: &Path,
    target: &Path,
    options: &DescribeOptions,
) -> Result<()> {
    let relative = report_relative(analyzed, target)?;
    let Some(record) = store.lookup_record(&relative)? else {
        println!("{}: no duplicates recorded", relative.display());
        return Ok(());
    };

    println!(
        "{}: total {} in {} items, duplicated {} ({} items)",
        record.path.display(),
        format_size(record.total_size, options.use_bytes),
        record.total_items,
        format_size(record.duplicated_size, options.use_bytes),
        record.duplicated_items,
    );

    let mut matches = record.matches.clone();
    sort_matches(&mut matches, options.sort_by);
    let shown = options.limit.unwrap_or(matches.len()).min(matches.len());
    for m in &matches[..shown] {
        println!(
            "  {} {} duplicated {} ({} items)",
            verdict(m),
            m.path.display(),
            format_size(m.duplicated_size, options.use_bytes),
            m.duplicated_items,
        );
    }
    if shown < matches.len() {
        println!("  ... {} more match(es)", matches.len() - shown);
    }

    if target.is_dir() {
        describe_children(store, &record, options)?;
    }
    Ok(())
}

fn describe_children(
    store: &ReportStore,
    record: &DuplicateRecord,
    options: &DescribeOptions,
) -> Result<()> {
    let mut children: Vec<DuplicateRecord> = store
        .list_records()?
        .into_iter()
        .filter(|candidate| candidate.path.parent() == Some(record.path.as_path()))
        .collect();
    if children.is_empty() {
        return Ok(());
    }
    children.sort_by(|a, b| b.duplicated_size.cmp(&a.duplicated_size));

    println!();
    println!("  children with duplicates:");
    for child in children {
        println!(
            "    {} duplicated {} ({} items), {} match(es)",
            child.path.display(),
            format_size(child.duplicated_size, options.use_bytes),
            child.duplicated_items,
            child.matches.len(),
        );
    }
    Ok(())
}

fn describe_table(
    store: &ReportStore,
    analyzed: &Path,
    paths: &[PathBuf],
    options: &DescribeOptions,
) -> Result<()> {
    println!("{:<40} {:>12} {:>12} {:>8} {:>8}", "PATH", "TOTAL", "DUP", "ITEMS", "MATCHES");
    for target in paths {
        let relative = report_relative(analyzed, target)?;
        match store.lookup_record(&relative)? {
            Some(record) => println!(
                "{:<40} {:>12} {:>12} {:>8} {:>8}",
                record.path.display(),
                format_size(record.total_size, options.use_bytes),
                format_size(record.duplicated_size, options.use_bytes),
                record.duplicated_items,
                record.matches.len(),
            ),
            None => println!("{:<40} {:>12} {:>12} {:>8} {:>8}", relative.display(), "-", "-", "-", "0"),
        }
    }
    Ok(())
}

fn verdict(m: &DuplicateMatch) -> &'static str {
    if m.is_identical {
        "identical"
    } else if m.is_superset {
        "superset "
    } else {
        "content  "
    }
}

fn sort_matches(matches: &mut [DuplicateMatch], sort_by: SortBy) {
    match sort_by {
        SortBy::Size => matches.sort_by(|a, b| b.duplicated_size.cmp(&a.duplicated_size)),
        SortBy::Items => matches.sort_by(|a, b| b.duplicated_items.cmp(&a.duplicated_items)),
        SortBy::Identical => {
            matches.sort_by(|a, b| (b.is_identical, b.is_superset).cmp(&(a.is_identical, a.is_superset)))
        }
        SortBy::Path => matches.sort_by(|a, b| a.path.cmp(&b.path)),
    }
}

pub fn format_size(size: u64, use_bytes: bool) -> String {
    if use_bytes {
        return format!("{size} B");
    }
    let mut value = size as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            if unit == "B" {
                return format!("{size} {unit}");
            }
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.2} PB")
}
