//! The per-analysis report store.
//!
//! A report lives in `<input>.report/`: a `manifest.json` sidecar naming the
//! archive it was produced against, and a `database/` KV store of
//! [`DuplicateRecord`]s keyed by `<murmur128(path):16BE><seq:varint>`.

use std::path::{Path, PathBuf};

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::keys::{decode_varint, encode_varint, long_path_hash, path_components};
use crate::record::{DuplicateMatchRule, DuplicateRecord};

const MAP_SIZE: usize = 256 * 1024 * 1024;

/// `manifest.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportManifest {
    pub version: String,
    /// Absolute path of the archive used for the analysis.
    pub archive_path: String,
    /// Archive id at analysis time; used to validate the report later.
    pub archive_id: String,
    /// ISO timestamp of the analysis.
    pub timestamp: String,
    pub comparison_rule: DuplicateMatchRule,
}

impl ReportManifest {
    pub fn new(archive_path: &Path, archive_id: String, timestamp: String, rule: DuplicateMatchRule) -> Self {
        Self {
            version: "1.0".to_string(),
            archive_path: archive_path.display().to_string(),
            archive_id,
            timestamp,
            comparison_rule: rule,
        }
    }
}

pub struct ReportStore {
    report_dir: PathBuf,
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl ReportStore {
    /// Open (and if `create`, initialise) the report store at `report_dir`.
    ///
    /// Refuses to proceed when a regular file occupies the report path.
    pub fn open(report_dir: impl Into<PathBuf>, create: bool) -> Result<Self> {
        let report_dir = report_dir.into();

        if report_dir.exists() && report_dir.is_file() {
            return Err(StoreError::ReportPathConflict(report_dir));
        }
        if create {
            std::fs::create_dir_all(&report_dir)?;
        } else if !report_dir.is_dir() {
            return Err(StoreError::IndexMissing(report_dir));
        }

        let database_path = report_dir.join("database");
        std::fs::create_dir_all(&database_path)?;

        let env = unsafe { EnvOpenOptions::new().map_size(MAP_SIZE).max_dbs(1).open(&database_path)? };
        let mut wtxn = env.write_txn()?;
        let db = env.create_database(&mut wtxn, None)?;
        wtxn.commit()?;

        debug!(report = %report_dir.display(), "opened report store");

        Ok(Self {
            report_dir,
            env,
            db,
        })
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    fn manifest_path(&self) -> PathBuf {
        self.report_dir.join("manifest.json")
    }

    pub fn write_manifest(&self, manifest: &ReportManifest) -> Result<()> {
        let text = serde_json::to_string_pretty(manifest)?;
        std::fs::write(self.manifest_path(), text)?;
        Ok(())
    }

    pub fn read_manifest(&self) -> Result<ReportManifest> {
        let text = std::fs::read_to_string(self.manifest_path())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// True when the report was produced against the given archive id.
    pub fn validate(&self, current_archive_id: &str) -> bool {
        match self.read_manifest() {
            Ok(manifest) => manifest.archive_id == current_archive_id,
            Err(_) => false,
        }
    }

    /// Upsert a record, keyed by its path hash bucket with component-exact
    /// matching inside the bucket.
    pub fn write_record(&self, record: &DuplicateRecord) -> Result<()> {
        let components = record.path_components()?;
        let prefix = long_path_hash(&components).to_vec();
        let value = record.to_msgpack()?;

        let mut wtxn = self.env.write_txn()?;
        let mut next_seq: u64 = 0;
        let mut existing_key: Option<Vec<u8>> = None;
        {
            let iter = self.db.prefix_iter(&wtxn, &prefix)?;
            for item in iter {
                let (key, data) = item?;
                if let Some((seq, _)) = decode_varint(&key[prefix.len()..]) {
                    next_seq = next_seq.max(seq + 1);
                }
                let stored = DuplicateRecord::from_msgpack(data)?;
                if stored.path == record.path {
                    existing_key = Some(key.to_vec());
                    break;
                }
            }
        }

        let key = match existing_key {
            Some(key) => key,
            None => {
                let mut key = prefix;
                encode_varint(next_seq, &mut key);
                key
            }
        };
        self.db.put(&mut wtxn, &key, &value)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn lookup_record(&self, path: &Path) -> Result<Option<DuplicateRecord>> {
        let components = path_components(path)?;
        let prefix = long_path_hash(&components).to_vec();

        let rtxn = self.env.read_txn()?;
        let iter = self.db.prefix_iter(&rtxn, &prefix)?;
        for item in iter {
            let (_, data) = item?;
            let stored = DuplicateRecord::from_msgpack(data)?;
            if stored.path == path {
                return Ok(Some(stored));
            }
        }
        Ok(None)
    }

    /// Every record in key order.
    pub fn list_records(&self) -> Result<Vec<DuplicateRecord>> {
        let rtxn = self.env.read_txn()?;
        let iter = self.db.iter(&rtxn)?;
        let mut records = Vec::new();
        for item in iter {
            let (_, data) = item?;
            records.push(DuplicateRecord::from_msgpack(data)?);
        }
        Ok(records)
    }
}
