//! # aridx CLI
//!
//! Command-line interface for the aridx content-addressed file indexer and
//! duplicate analyzer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use aridx_config::{init_logging, ArchiveSettings};
use aridx_core::{
    Archive, CoreError, FileMetadataDifferencePattern, Processor, StandardOutput,
};
use aridx_store::{DuplicateMatchRule, StoreError};

mod describe;
mod diff_tree;

use describe::{DescribeOptions, SortBy};

/// Index a collection of files by content and deduplicate other trees
/// against the indexed collection.
#[derive(Parser)]
#[command(name = "aridx")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the archive directory; falls back to ARIDX_ARCHIVE, then an
    /// upward search from the current directory.
    #[arg(long, env = "ARIDX_ARCHIVE", global = true)]
    archive: Option<PathBuf>,

    /// Verbose output.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the archive index from scratch.
    Rebuild,

    /// Refresh the archive index with new, modified, and deleted files.
    Refresh,

    /// Import index entries from a nested or ancestor archive.
    Import {
        /// Source archive directory.
        source: PathBuf,
    },

    /// Generate persistent analysis reports for files or directories.
    Analyze {
        /// Files or directories to analyze.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Include access time when determining identity (default: excluded).
        #[arg(long)]
        include_atime: bool,

        /// Exclude change time when determining identity (default: included).
        #[arg(long)]
        exclude_ctime: bool,

        /// Exclude file owner when determining identity (default: included).
        #[arg(long)]
        exclude_owner: bool,

        /// Exclude file group when determining identity (default: included).
        #[arg(long)]
        exclude_group: bool,
    },

    /// Find duplicate files against the archive, streaming to stdout.
    FindDuplicates {
        /// Files or directories to check.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Comma-separated metadata difference types to ignore
        /// (atime,ctime,mtime,birthtime). Default: atime,ctime.
        #[arg(long)]
        ignore: Option<String>,

        /// Also show content-wise duplicates whose metadata differs.
        #[arg(long)]
        show_possible_duplicates: bool,
    },

    /// Dump the index records.
    Inspect,

    /// Describe duplicate analysis results from a report.
    Describe {
        /// Paths to describe.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Maximum number of matches to show per item (0 = all).
        #[arg(long, default_value_t = 1)]
        limit: usize,

        /// Sorting criterion for matches.
        #[arg(long, value_enum, default_value_t = SortBy::Size)]
        sort_by: SortBy,

        /// Show sizes in bytes instead of human-readable units.
        #[arg(long)]
        bytes: bool,

        /// Show report metadata.
        #[arg(long)]
        details: bool,
    },

    /// Show a tree diff of an analyzed directory against its archive
    /// duplicate.
    DiffTree {
        /// Analyzed directory (must have a report).
        path: PathBuf,

        /// Maximum tree depth to display.
        #[arg(long)]
        max_depth: Option<usize>,

        /// Hide entries that match in content but differ in metadata.
        #[arg(long)]
        hide_content_match: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let archive_hint = resolve_archive_hint(cli.archive.as_deref());
    let log_path = archive_hint
        .as_deref()
        .and_then(|path| ArchiveSettings::load(path).ok())
        .and_then(|settings| settings.logging_path().map(Path::to_path_buf));
    init_logging(cli.verbose, log_path.as_deref())?;

    match cli.command {
        Commands::Rebuild => {
            let archive = open_archive(cli.archive.as_deref(), true)?;
            archive.rebuild().await?;
        }
        Commands::Refresh => {
            let archive = open_archive(cli.archive.as_deref(), true)?;
            archive.refresh().await?;
        }
        Commands::Import { source } => {
            let archive = open_archive(cli.archive.as_deref(), false)?;
            archive.import_index(&source).await?;
        }
        Commands::Analyze {
            paths,
            include_atime,
            exclude_ctime,
            exclude_owner,
            exclude_group,
        } => {
            let archive = open_archive(cli.archive.as_deref(), false)?;
            let rule = DuplicateMatchRule {
                include_mtime: true,
                include_atime,
                include_ctime: !exclude_ctime,
                include_mode: true,
                include_owner: !exclude_owner,
                include_group: !exclude_group,
            };
            archive.analyze(&paths, Some(rule)).await?;
        }
        Commands::FindDuplicates {
            paths,
            ignore,
            show_possible_duplicates,
        } => {
            let archive = open_archive(cli.archive.as_deref(), false)?;
            let pattern = parse_ignore_pattern(ignore.as_deref())?;
            let mut output = StandardOutput {
                verbosity: if cli.verbose { 1 } else { 0 },
                showing_content_wise_duplicates: show_possible_duplicates,
            };
            for path in &paths {
                archive.find_duplicates(path, &pattern, &mut output).await?;
            }
        }
        Commands::Inspect => {
            let archive = open_archive(cli.archive.as_deref(), false)?;
            for line in archive.inspect()? {
                println!("{line}");
            }
        }
        Commands::Describe {
            paths,
            limit,
            sort_by,
            bytes,
            details,
        } => {
            let options = DescribeOptions {
                limit: if limit == 0 { None } else { Some(limit) },
                sort_by,
                use_bytes: bytes,
                show_details: details,
            };
            describe::do_describe(&paths, &options)?;
        }
        Commands::DiffTree {
            path,
            max_depth,
            hide_content_match,
        } => {
            diff_tree::do_diff_tree(&path, max_depth, hide_content_match)?;
        }
    }

    Ok(())
}

fn parse_ignore_pattern(ignore: Option<&str>) -> Result<FileMetadataDifferencePattern> {
    match ignore {
        None => Ok(FileMetadataDifferencePattern::trivial()),
        Some(list) => {
            let mut pattern = FileMetadataDifferencePattern::new();
            for kind in list.split(',') {
                let kind = kind.trim();
                if kind.is_empty() {
                    continue;
                }
                pattern.add(kind.parse().map_err(|message: String| anyhow::anyhow!(message))?);
            }
            Ok(pattern)
        }
    }
}

/// Where the archive probably is, without opening it.
fn resolve_archive_hint(flag: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(path.to_path_buf());
    }
    let cwd = std::env::current_dir().ok()?;
    aridx_store::find_archive_for_path(&cwd)
}

/// Open the archive: explicit path when given, else search upward from the
/// working directory; `create` falls back to creating an index in the
/// working directory when none is found.
fn open_archive(flag: Option<&Path>, create: bool) -> Result<Archive> {
    let processor = Arc::new(Processor::new(None));

    if let Some(path) = flag {
        return Archive::open(processor, path, create).context("failed to open archive");
    }

    let cwd = std::env::current_dir()?;
    let mut attempt = Some(cwd.clone());
    while let Some(current) = attempt {
        match Archive::open(Arc::clone(&processor), &current, false) {
            Ok(archive) => return Ok(archive),
            Err(CoreError::Store(StoreError::IndexMissing(_))) => {
                attempt = current.parent().map(Path::to_path_buf);
            }
            Err(error) => return Err(error).context("failed to open archive"),
        }
    }

    if create {
        return Archive::open(processor, &cwd, true).context("failed to create archive index");
    }
    bail!(
        "no archive index found from {} upward; run `aridx rebuild` to create one",
        cwd.display()
    );
}
