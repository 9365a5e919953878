//! Cross-archive index import.
//!
//! Merges the index of a related archive (strictly nested in, or strictly
//! an ancestor of, the current one) into the current index, remapping EC ids
//! and verifying content byte-for-byte before any class merge — digest
//! equality alone is never trusted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use aridx_config::ArchiveSettings;
use aridx_store::{ArchiveStore, FileSignature};
use aridx_sync::KeyedLock;

use crate::error::{CoreError, Result};
use crate::processor::Processor;

enum Relationship {
    /// Source lives inside the current archive; `prefix` is prepended to
    /// every imported path.
    Nested { prefix: PathBuf },
    /// Source contains the current archive; `prefix` is stripped and paths
    /// outside it are filtered out.
    Ancestor { prefix: PathBuf },
}

pub(crate) async fn do_import(
    store: &Arc<ArchiveStore>,
    settings: &ArchiveSettings,
    processor: &Arc<Processor>,
    source_archive_path: &Path,
) -> Result<()> {
    let current_path = std::path::absolute(store.archive_path())?;
    let source_path = std::path::absolute(source_archive_path)?;

    let relationship = validate_relationship(&current_path, &source_path, settings)?;

    let source_store = ArchiveStore::open(&source_path, false)?;
    info!(
        source = %source_path.display(),
        current = %current_path.display(),
        "importing index"
    );

    let result = run_import(
        store,
        processor,
        &current_path,
        &source_store,
        &source_path,
        &relationship,
    )
    .await;
    source_store.close();
    result
}

fn validate_relationship(
    current: &Path,
    source: &Path,
    current_settings: &ArchiveSettings,
) -> Result<Relationship> {
    if source == current {
        return Err(CoreError::InvalidImportRelationship(
            "source archive cannot be the same as the current archive".into(),
        ));
    }
    if source.starts_with(current.join(aridx_store::INDEX_DIR_NAME)) {
        return Err(CoreError::InvalidImportRelationship(
            "source archive cannot be inside the index directory".into(),
        ));
    }

    if let Ok(prefix) = source.strip_prefix(current) {
        check_symlink_crossing(current, source, current_settings)?;
        return Ok(Relationship::Nested {
            prefix: prefix.to_path_buf(),
        });
    }
    if let Ok(prefix) = current.strip_prefix(source) {
        // The crossing happens inside the source tree, so the source's own
        // follow list governs it.
        let source_settings = ArchiveSettings::load(source)?;
        check_symlink_crossing(source, current, &source_settings)?;
        return Ok(Relationship::Ancestor {
            prefix: prefix.to_path_buf(),
        });
    }

    Err(CoreError::InvalidImportRelationship(
        "source archive must be nested in, or an ancestor of, the current archive".into(),
    ))
}

/// Every directory component between the two roots must be a real directory
/// or a symlink named in the containing archive's follow list.
fn check_symlink_crossing(
    outer_root: &Path,
    inner: &Path,
    outer_settings: &ArchiveSettings,
) -> Result<()> {
    let relative = inner
        .strip_prefix(outer_root)
        .expect("inner path verified under outer root");

    let mut absolute = outer_root.to_path_buf();
    let mut relative_so_far = PathBuf::new();
    for component in relative.components() {
        absolute.push(component);
        relative_so_far.push(component);
        let metadata = std::fs::symlink_metadata(&absolute)?;
        if metadata.is_symlink() && !outer_settings.follows_symlink(&relative_so_far) {
            return Err(CoreError::InvalidImportRelationship(format!(
                "path to source crosses unfollowed symlink {}",
                relative_so_far.display()
            )));
        }
    }
    Ok(())
}

fn transform_path(relationship: &Relationship, path: &Path) -> Option<PathBuf> {
    match relationship {
        Relationship::Nested { prefix } => Some(prefix.join(path)),
        Relationship::Ancestor { prefix } => {
            path.strip_prefix(prefix).ok().map(Path::to_path_buf)
        }
    }
}

async fn run_import(
    store: &Arc<ArchiveStore>,
    processor: &Arc<Processor>,
    current_path: &Path,
    source_store: &ArchiveStore,
    source_path: &Path,
    relationship: &Relationship,
) -> Result<()> {
    // Algorithm compatibility: adopt the source's when unset, otherwise the
    // digests are incomparable and the import is refused.
    let source_algorithm = source_store.read_manifest(ArchiveStore::MANIFEST_HASH_ALGORITHM)?;
    let current_algorithm = store.read_manifest(ArchiveStore::MANIFEST_HASH_ALGORITHM)?;
    match (&current_algorithm, &source_algorithm) {
        (None, Some(source_name)) => {
            store.write_manifest(ArchiveStore::MANIFEST_HASH_ALGORITHM, Some(source_name))?;
        }
        (Some(current_name), Some(source_name)) if current_name != source_name => {
            return Err(CoreError::HashAlgorithmMismatch {
                source_algo: source_name.clone(),
                current: current_name.clone(),
            });
        }
        _ => {}
    }

    let digest_locks: KeyedLock<Vec<u8>> = KeyedLock::new();

    // A transformed path already registered means its digest was merged by
    // an earlier iteration.
    for (source_file, signature) in source_store.list_registered_files()? {
        let Some(transformed) = transform_path(relationship, &source_file) else {
            continue;
        };
        if store.lookup_file(&transformed).await?.is_some() {
            continue;
        }

        let _digest_lock = digest_locks.lock(signature.digest.clone()).await;
        merge_digest(
            store,
            processor,
            current_path,
            source_store,
            source_path,
            relationship,
            &signature.digest,
        )
        .await?;
    }

    Ok(())
}

/// Merge every source EC class of one digest into the current archive.
async fn merge_digest(
    store: &Arc<ArchiveStore>,
    processor: &Arc<Processor>,
    current_path: &Path,
    source_store: &ArchiveStore,
    source_path: &Path,
    relationship: &Relationship,
    digest: &[u8],
) -> Result<()> {
    let mut existing = store.list_ec_classes(digest)?;
    let mut next_ec_id = existing.iter().map(|(id, _)| id + 1).max().unwrap_or(0);

    for (source_ec_id, source_paths) in source_store.list_ec_classes(digest)? {
        let transformed: Vec<PathBuf> = source_paths
            .iter()
            .filter_map(|path| transform_path(relationship, path))
            .collect();
        if transformed.is_empty() {
            continue;
        }

        // Byte-level verification against each existing class's witness;
        // digest equality is insufficient under collisions.
        let source_witness = source_path.join(&source_paths[0]);
        let mut target_ec_id = None;
        for (ec_id, ec_paths) in &existing {
            let current_witness = current_path.join(&ec_paths[0]);
            if processor
                .compare_content(source_witness.clone(), current_witness)
                .await?
            {
                target_ec_id = Some(*ec_id);
                break;
            }
        }

        let ec_id = match target_ec_id {
            Some(ec_id) => ec_id,
            None => {
                let ec_id = next_ec_id;
                next_ec_id += 1;
                existing.push((ec_id, transformed.clone()));
                ec_id
            }
        };
        debug!(
            source_ec = source_ec_id,
            target_ec = ec_id,
            paths = transformed.len(),
            "merging EC class"
        );
        store.add_paths_to_ec(digest, ec_id, &transformed).await?;

        for source_file in &source_paths {
            let Some(transformed_path) = transform_path(relationship, source_file) else {
                continue;
            };
            if let Some(source_signature) = source_store.lookup_file(source_file).await? {
                store
                    .register_file(
                        &transformed_path,
                        &FileSignature::new(
                            source_signature.digest,
                            source_signature.mtime_ns,
                            Some(ec_id),
                        ),
                    )
                    .await?;
            }
        }
    }

    Ok(())
}
