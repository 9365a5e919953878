//! Streaming duplicate finding (the `find-duplicates` command).
//!
//! Walks an input tree and, for every regular file, runs the duplicate
//! matcher and classifies each confirmed duplicate by its metadata
//! differences against an ignore pattern. Results stream through a
//! [`DuplicateOutput`] as they are found.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aridx_store::ArchiveStore;

use crate::error::Result;
use crate::hashalg::HashAlgorithm;
use crate::matcher::{classify_duplicates, find_matching_class, ClassifiedDuplicate};
use crate::metadata::{FileMetadataDifference, FileMetadataDifferencePattern};
use crate::processor::Processor;
use crate::walk::walk_input;

/// Sink for find-duplicates results.
pub trait DuplicateOutput {
    /// A file whose duplicates differ only within the ignore pattern.
    fn duplicate(&mut self, path: &Path, duplicates: &[(PathBuf, Vec<FileMetadataDifference>)]);

    /// A file whose content matches but whose metadata differs beyond the
    /// ignore pattern.
    fn content_wise_duplicate(
        &mut self,
        path: &Path,
        candidates: &[(PathBuf, Vec<FileMetadataDifference>, Vec<FileMetadataDifference>)],
    );
}

/// Plain stdout rendering.
#[derive(Debug, Default)]
pub struct StandardOutput {
    pub verbosity: u8,
    pub showing_content_wise_duplicates: bool,
}

impl DuplicateOutput for StandardOutput {
    fn duplicate(&mut self, path: &Path, duplicates: &[(PathBuf, Vec<FileMetadataDifference>)]) {
        println!("{}", path.display());
        if self.verbosity >= 1 {
            for (duplicate, ignored) in duplicates {
                println!("## identical file: {}", duplicate.display());
                for diff in ignored {
                    println!("## ignored difference - {}", diff.description());
                }
            }
        }
    }

    fn content_wise_duplicate(
        &mut self,
        path: &Path,
        candidates: &[(PathBuf, Vec<FileMetadataDifference>, Vec<FileMetadataDifference>)],
    ) {
        if !self.showing_content_wise_duplicates {
            return;
        }
        println!("# content-wise duplicate: {}", path.display());
        if self.verbosity >= 1 {
            for (candidate, major, all) in candidates {
                println!("## file with identical content: {}", candidate.display());
                for diff in major {
                    println!("## difference - {}", diff.description());
                }
                for diff in all {
                    if !major.contains(diff) {
                        println!("## ignored difference - {}", diff.description());
                    }
                }
            }
        }
    }
}

pub(crate) async fn do_find_duplicates(
    store: &Arc<ArchiveStore>,
    processor: &Arc<Processor>,
    algorithm: &'static HashAlgorithm,
    input: &Path,
    ignore: &FileMetadataDifferencePattern,
    output: &mut dyn DuplicateOutput,
) -> Result<()> {
    for (path, context) in walk_input(input) {
        if !context.is_file() {
            continue;
        }

        let Some(class_paths) =
            find_matching_class(store, processor, algorithm, &path).await?
        else {
            continue;
        };

        let (full, content_wise) =
            classify_duplicates(store, processor, &class_paths, &path, ignore).await?;

        if !full.is_empty() {
            let duplicates: Vec<(PathBuf, Vec<FileMetadataDifference>)> = full
                .into_iter()
                .map(|d| (d.path, d.differences))
                .collect();
            output.duplicate(&path, &duplicates);
        } else if !content_wise.is_empty() {
            let candidates: Vec<_> = content_wise
                .into_iter()
                .map(
                    |d: ClassifiedDuplicate| (d.path, d.major_differences, d.differences),
                )
                .collect();
            output.content_wise_duplicate(&path, &candidates);
        }
    }
    Ok(())
}
