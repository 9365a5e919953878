//! Duplicate file matching against the index.

use std::path::{Path, PathBuf};

use aridx_store::ArchiveStore;
use tracing::trace;

use crate::error::Result;
use crate::hashalg::HashAlgorithm;
use crate::metadata::{FileMetadataDifference, FileMetadataDifferencePattern};
use crate::processor::Processor;

/// Find the EC class whose content matches `target`.
///
/// The digest narrows the candidates; membership is only granted after a
/// byte-for-byte comparison against each class's first path, so hash
/// collisions cannot produce false matches. Returns the matching class's
/// member paths (relative to the archive root), or `None`.
pub async fn find_matching_class(
    store: &ArchiveStore,
    processor: &Processor,
    algorithm: &'static HashAlgorithm,
    target: &Path,
) -> Result<Option<Vec<PathBuf>>> {
    let digest = processor.digest(algorithm, target.to_path_buf()).await?;

    for (ec_id, paths) in store.list_ec_classes(&digest)? {
        let witness = store.archive_path().join(&paths[0]);
        if processor
            .compare_content(witness, target.to_path_buf())
            .await?
        {
            trace!(target = %target.display(), ec_id, "content-confirmed EC class");
            return Ok(Some(paths));
        }
    }
    Ok(None)
}

/// A confirmed duplicate classified by its metadata differences.
#[derive(Debug)]
pub struct ClassifiedDuplicate {
    pub path: PathBuf,
    /// Differences outside the ignore pattern; empty for full duplicates.
    pub major_differences: Vec<FileMetadataDifference>,
    /// All observed differences.
    pub differences: Vec<FileMetadataDifference>,
}

/// For every member of the matching EC class, diff metadata against the
/// target and classify it as a full duplicate (all differences ignored) or a
/// content-wise duplicate.
pub async fn classify_duplicates(
    store: &ArchiveStore,
    processor: &Processor,
    class_paths: &[PathBuf],
    target: &Path,
    ignore: &FileMetadataDifferencePattern,
) -> Result<(Vec<ClassifiedDuplicate>, Vec<ClassifiedDuplicate>)> {
    let mut full = Vec::new();
    let mut content_wise = Vec::new();

    for member in class_paths {
        let archived = store.archive_path().join(member);
        let differences = processor
            .compare_metadata(archived, target.to_path_buf())
            .await?;
        let major: Vec<FileMetadataDifference> = differences
            .iter()
            .filter(|diff| !ignore.matches(diff))
            .cloned()
            .collect();

        let classified = ClassifiedDuplicate {
            path: member.clone(),
            major_differences: major,
            differences,
        };
        if classified.major_differences.is_empty() {
            full.push(classified);
        } else {
            content_wise.push(classified);
        }
    }

    Ok((full, content_wise))
}
