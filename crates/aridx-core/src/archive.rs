//! The archive facade.
//!
//! [`Archive`] ties together the settings, the index store, and the
//! processor pool, and exposes the complete workflows the CLI drives:
//! rebuild, refresh, import, analyze, find-duplicates, inspect.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aridx_config::ArchiveSettings;
use aridx_store::{ArchiveStore, DuplicateMatchRule};

use crate::analyzer::do_analyze;
use crate::error::{CoreError, Result};
use crate::finder::{do_find_duplicates, DuplicateOutput};
use crate::hashalg::{self, HashAlgorithm, DEFAULT_HASH_ALGORITHM};
use crate::importer::do_import;
use crate::metadata::FileMetadataDifferencePattern;
use crate::processor::Processor;
use crate::refresh::{do_rebuild, do_refresh};

pub struct Archive {
    store: Arc<ArchiveStore>,
    settings: ArchiveSettings,
    processor: Arc<Processor>,
}

impl Archive {
    /// Open an archive rooted at `path`; `create` builds the `.aridx`
    /// directory when missing.
    pub fn open(processor: Arc<Processor>, path: impl Into<PathBuf>, create: bool) -> Result<Self> {
        let path = path.into();
        let settings = ArchiveSettings::load(&path)?;
        let store = Arc::new(ArchiveStore::open(path, create)?);
        Ok(Self {
            store,
            settings,
            processor,
        })
    }

    pub fn archive_path(&self) -> &Path {
        self.store.archive_path()
    }

    pub fn settings(&self) -> &ArchiveSettings {
        &self.settings
    }

    /// The underlying store, for read-only inspection.
    pub fn store(&self) -> &Arc<ArchiveStore> {
        &self.store
    }

    pub fn close(&self) {
        self.store.close();
    }

    /// Full rebuild with the default digest algorithm.
    pub async fn rebuild(&self) -> Result<()> {
        self.rebuild_with(DEFAULT_HASH_ALGORITHM).await
    }

    /// Full rebuild with a specific digest algorithm (exercised directly by
    /// the collision tests, which rebuild under the weak `xor4` digest).
    pub async fn rebuild_with(&self, algorithm_name: &str) -> Result<()> {
        let algorithm = hashalg::lookup(algorithm_name)
            .ok_or_else(|| CoreError::HashAlgorithmUnknown(algorithm_name.to_string()))?;
        do_rebuild(&self.store, &self.settings, &self.processor, algorithm).await
    }

    /// Incremental refresh under the stored algorithm.
    pub async fn refresh(&self) -> Result<()> {
        let algorithm = self.stored_algorithm()?;
        do_refresh(&self.store, &self.settings, &self.processor, algorithm).await
    }

    /// Merge another archive's index into this one.
    pub async fn import_index(&self, source_archive_path: &Path) -> Result<()> {
        do_import(&self.store, &self.settings, &self.processor, source_archive_path).await
    }

    /// Produce `.report` directories for each input path.
    pub async fn analyze(
        &self,
        input_paths: &[PathBuf],
        comparison_rule: Option<DuplicateMatchRule>,
    ) -> Result<()> {
        let algorithm = self.stored_algorithm()?;
        let rule = comparison_rule.unwrap_or_default();
        do_analyze(&self.store, &self.processor, algorithm, input_paths, rule).await
    }

    /// Stream duplicates of files under `input` to `output`.
    pub async fn find_duplicates(
        &self,
        input: &Path,
        ignore: &FileMetadataDifferencePattern,
        output: &mut dyn DuplicateOutput,
    ) -> Result<()> {
        let algorithm = self.stored_algorithm()?;
        do_find_duplicates(&self.store, &self.processor, algorithm, input, ignore, output).await
    }

    /// Deterministic index dump.
    pub fn inspect(&self) -> Result<Vec<String>> {
        let digest_len = self
            .store
            .read_manifest(ArchiveStore::MANIFEST_HASH_ALGORITHM)?
            .and_then(|name| hashalg::lookup(&name))
            .map(|algorithm| algorithm.digest_len);
        Ok(self.store.inspect(digest_len)?)
    }

    fn stored_algorithm(&self) -> Result<&'static HashAlgorithm> {
        let name = self
            .store
            .read_manifest(ArchiveStore::MANIFEST_HASH_ALGORITHM)?
            .ok_or(CoreError::HashAlgorithmUnset)?;
        hashalg::lookup(&name).ok_or(CoreError::HashAlgorithmUnknown(name))
    }
}
