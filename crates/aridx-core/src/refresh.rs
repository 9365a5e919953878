//! Rebuild and refresh: reconciling the index with the filesystem.
//!
//! A refresh runs two concurrent phases through one throttled task group:
//! reconciling stored signatures against the live tree (deletions and
//! modifications), and ingesting files not yet registered. Every EC-class
//! decision happens under a per-digest keyed lock with content verification
//! against the class witness, so digest collisions can never merge distinct
//! content.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use aridx_config::ArchiveSettings;
use aridx_store::{ArchiveStore, FileSignature};
use aridx_sync::{KeyedLock, TaskGroup, Throttler};

use crate::error::{CoreError, Result};
use crate::hashalg::HashAlgorithm;
use crate::processor::Processor;
use crate::walk::walk_archive;

/// Truncate, refresh with the given algorithm, then persist the algorithm
/// choice. The algorithm name only becomes visible once the rebuild
/// completed, which is what makes an interrupted rebuild repeatable.
pub(crate) async fn do_rebuild(
    store: &Arc<ArchiveStore>,
    settings: &ArchiveSettings,
    processor: &Arc<Processor>,
    algorithm: &'static HashAlgorithm,
) -> Result<()> {
    info!(archive = %store.archive_path().display(), algorithm = algorithm.name, "rebuilding index");
    store.truncate()?;
    run_refresh(store, settings, processor, algorithm).await?;
    store.write_manifest(ArchiveStore::MANIFEST_HASH_ALGORITHM, Some(algorithm.name))?;
    store.ensure_archive_id()?;
    Ok(())
}

pub(crate) async fn do_refresh(
    store: &Arc<ArchiveStore>,
    settings: &ArchiveSettings,
    processor: &Arc<Processor>,
    algorithm: &'static HashAlgorithm,
) -> Result<()> {
    info!(archive = %store.archive_path().display(), algorithm = algorithm.name, "refreshing index");
    run_refresh(store, settings, processor, algorithm).await?;
    store.ensure_archive_id()?;
    Ok(())
}

async fn run_refresh(
    store: &Arc<ArchiveStore>,
    settings: &ArchiveSettings,
    processor: &Arc<Processor>,
    algorithm: &'static HashAlgorithm,
) -> Result<()> {
    let group: Arc<TaskGroup<CoreError>> = Arc::new(TaskGroup::new());
    let throttler = Throttler::new(Arc::clone(&group), processor.concurrency() * 2);

    let engine = Arc::new(RefreshEngine {
        store: Arc::clone(store),
        processor: Arc::clone(processor),
        algorithm,
        digest_locks: KeyedLock::new(),
        archive_path: store.archive_path().to_path_buf(),
    });

    // Phase 1: reconcile stored signatures against the live tree.
    for (path, signature) in store.list_registered_files()? {
        let engine = Arc::clone(&engine);
        throttler
            .schedule(async move { engine.refresh_entry(path, signature).await })
            .await?;
    }

    // Phase 2: ingest files the index does not know yet.
    for (path, context) in walk_archive(&engine.archive_path, settings) {
        if !context.is_file() {
            continue;
        }
        let engine = Arc::clone(&engine);
        let relative = context.relative_path().to_path_buf();
        let mtime_ns = mtime_ns(context.metadata());
        throttler
            .schedule(async move {
                if engine.store.lookup_file(&relative).await?.is_none() {
                    engine.generate_signature(&path, &relative, mtime_ns).await?;
                }
                Ok(())
            })
            .await?;
    }

    group.join_all().await?;
    Ok(())
}

fn mtime_ns(metadata: &std::fs::Metadata) -> i64 {
    metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec()
}

struct RefreshEngine {
    store: Arc<ArchiveStore>,
    processor: Arc<Processor>,
    algorithm: &'static HashAlgorithm,
    digest_locks: KeyedLock<Vec<u8>>,
    archive_path: PathBuf,
}

impl RefreshEngine {
    /// Phase-1 handler for one stored signature: drop it if the file is
    /// gone, regenerate it if the file is newer than recorded.
    async fn refresh_entry(&self, relative: PathBuf, signature: FileSignature) -> Result<()> {
        let absolute = self.archive_path.join(&relative);

        match std::fs::metadata(&absolute) {
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %relative.display(), "indexed file deleted, cleaning up");
                self.clean_up(&relative, &signature).await
            }
            Err(error) => Err(error.into()),
            Ok(stat) => {
                let live_mtime = mtime_ns(&stat);
                let stale = match signature.mtime_ns {
                    None => true,
                    Some(stored) => stored < live_mtime,
                };
                if stale {
                    debug!(path = %relative.display(), "indexed file modified, regenerating");
                    self.clean_up(&relative, &signature).await?;
                    self.generate_signature(&absolute, &relative, live_mtime).await?;
                }
                Ok(())
            }
        }
    }

    /// Remove one path from the index: mark the signature transitional,
    /// detach it from its EC class under the digest lock, then drop it.
    async fn clean_up(&self, relative: &Path, signature: &FileSignature) -> Result<()> {
        self.store
            .register_file(
                relative,
                &FileSignature::new(signature.digest.clone(), signature.mtime_ns, None),
            )
            .await?;

        {
            let _digest_lock = self.digest_locks.lock(signature.digest.clone()).await;
            for (ec_id, paths) in self.store.list_ec_classes(&signature.digest)? {
                if paths.iter().any(|p| p == relative) {
                    self.store
                        .remove_paths_from_ec(&signature.digest, ec_id, &[relative.to_path_buf()])
                        .await?;
                    break;
                }
            }
        }

        self.store.deregister_file(relative).await?;
        Ok(())
    }

    /// Digest the file and place it into an EC class.
    ///
    /// Holding the per-digest lock, existing classes are tried in order with
    /// a byte-level comparison against each class's first member; the first
    /// match wins. With no match a fresh `ec_id = max + 1` class is created
    /// (gaps are never reused). Write ordering makes the membership
    /// observable for any visible signature: the signature is first written
    /// with a null `ec_id`, the class is mutated, then the signature gets
    /// its final `ec_id`.
    async fn generate_signature(&self, absolute: &Path, relative: &Path, mtime_ns: i64) -> Result<()> {
        let digest = match self.processor.digest(self.algorithm, absolute.to_path_buf()).await {
            Ok(digest) => digest,
            // Deleted between walk and hash: skip silently.
            Err(CoreError::Io(error)) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let _digest_lock = self.digest_locks.lock(digest.clone()).await;

        let mut next_ec_id: u32 = 0;
        let mut chosen: Option<u32> = None;
        for (ec_id, paths) in self.store.list_ec_classes(&digest)? {
            if next_ec_id <= ec_id {
                next_ec_id = ec_id + 1;
            }
            let witness = self.archive_path.join(&paths[0]);
            if self
                .processor
                .compare_content(absolute.to_path_buf(), witness)
                .await?
            {
                chosen = Some(ec_id);
                break;
            }
        }
        let ec_id = chosen.unwrap_or(next_ec_id);

        self.store
            .register_file(
                relative,
                &FileSignature::new(digest.clone(), Some(mtime_ns), None),
            )
            .await?;
        self.store
            .add_paths_to_ec(&digest, ec_id, &[relative.to_path_buf()])
            .await?;
        self.store
            .register_file(
                relative,
                &FileSignature::new(digest, Some(mtime_ns), Some(ec_id)),
            )
            .await?;

        Ok(())
    }
}
