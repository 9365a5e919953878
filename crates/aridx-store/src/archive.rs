//! The archive index store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use aridx_sync::KeyedLock;

use crate::error::{Result, StoreError};
use crate::keys::{
    decode_varint, ec_class_prefix, encode_varint, long_path_hash, path_components,
    path_from_components, short_path_hash,
};
use crate::INDEX_DIR_NAME;

const PREFIX_MANIFEST: u8 = b'p';
const PREFIX_FILE_HASH: u8 = b'h';
const PREFIX_FILE_SIGNATURE: u8 = b's';

/// LMDB map size, expandable by reopening with a larger value.
const MAP_SIZE: usize = 1024 * 1024 * 1024;

/// Keys deleted per write transaction while truncating.
const TRUNCATE_BATCH: usize = 1024;

/// Persisted record for one indexed file.
///
/// `ec_id` is scoped to the digest: `(digest, ec_id)` identifies the content
/// equivalence class the file belongs to. It is `None` only transiently,
/// between the signature becoming visible and its EC membership being
/// written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSignature {
    pub digest: Vec<u8>,
    pub mtime_ns: Option<i64>,
    pub ec_id: Option<u32>,
}

impl FileSignature {
    pub fn new(digest: Vec<u8>, mtime_ns: Option<i64>, ec_id: Option<u32>) -> Self {
        Self {
            digest,
            mtime_ns,
            ec_id,
        }
    }
}

/// msgpack value layout of an `s` entry: `[components, digest, mtime_ns, ec_id]`.
#[derive(Serialize, Deserialize)]
struct SignatureValue(
    Vec<String>,
    #[serde(with = "serde_bytes")] Vec<u8>,
    Option<i64>,
    Option<u32>,
);

/// msgpack value layout of an `h` entry: the path components.
#[derive(Serialize, Deserialize)]
struct EcPathValue(Vec<String>);

pub struct ArchiveStore {
    archive_path: PathBuf,
    env: Env,
    db: Database<Bytes, Bytes>,
    alive: AtomicBool,
    /// Serializes `ensure_archive_id` and `truncate`.
    manifest_lock: Mutex<()>,
    /// Per signature bucket (16-byte path hash).
    bucket_locks: KeyedLock<[u8; 16]>,
    /// Per EC class (`digest + ec_id` bytes).
    ec_locks: KeyedLock<Vec<u8>>,
}

impl ArchiveStore {
    pub const MANIFEST_HASH_ALGORITHM: &'static str = "hash-algorithm";
    pub const MANIFEST_PENDING_ACTION: &'static str = "truncating";
    pub const MANIFEST_ARCHIVE_ID: &'static str = "archive-id";

    /// Open the index under `<archive>/.aridx/database`, creating the index
    /// directory iff `create`.
    pub fn open(archive_path: impl Into<PathBuf>, create: bool) -> Result<Self> {
        let archive_path = archive_path.into();

        if !archive_path.exists() {
            return Err(StoreError::ArchiveMissing(archive_path));
        }
        if !archive_path.is_dir() {
            return Err(StoreError::ArchiveNotDir(archive_path));
        }

        let index_path = archive_path.join(INDEX_DIR_NAME);
        if create {
            std::fs::create_dir_all(&index_path)?;
        }
        if !index_path.exists() {
            return Err(StoreError::IndexMissing(archive_path));
        }
        if !index_path.is_dir() {
            return Err(StoreError::ArchiveNotDir(index_path));
        }

        let database_path = index_path.join("database");
        std::fs::create_dir_all(&database_path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_dbs(1)
                .open(&database_path)?
        };

        let mut wtxn = env.write_txn()?;
        let db = env.create_database(&mut wtxn, None)?;
        wtxn.commit()?;

        debug!(archive = %archive_path.display(), "opened archive index");

        let store = Self {
            archive_path,
            env,
            db,
            alive: AtomicBool::new(true),
            manifest_lock: Mutex::new(()),
            bucket_locks: KeyedLock::new(),
            ec_locks: KeyedLock::new(),
        };

        // A crash mid-truncate leaves the marker behind; finish the job
        // before anyone reads half-cleared state.
        if store.read_manifest(Self::MANIFEST_PENDING_ACTION)?.is_some() {
            warn!(archive = %store.archive_path.display(), "unfinished truncate detected, repeating");
            store.truncate()?;
        }

        Ok(store)
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Mark the store closed; all further operations fail with `Closed`.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    fn manifest_key(entry: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + entry.len());
        key.push(PREFIX_MANIFEST);
        key.extend_from_slice(entry.as_bytes());
        key
    }

    /// Write or delete a manifest property; `None` deletes.
    pub fn write_manifest(&self, entry: &str, value: Option<&str>) -> Result<()> {
        self.ensure_alive()?;
        let key = Self::manifest_key(entry);
        let mut wtxn = self.env.write_txn()?;
        match value {
            Some(value) => {
                self.db.put(&mut wtxn, &key, value.as_bytes())?;
            }
            None => {
                self.db.delete(&mut wtxn, &key)?;
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    pub fn read_manifest(&self, entry: &str) -> Result<Option<String>> {
        self.ensure_alive()?;
        let key = Self::manifest_key(entry);
        let rtxn = self.env.read_txn()?;
        let value = self
            .db
            .get(&rtxn, &key)?
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
        Ok(value)
    }

    /// Return the archive id, generating and persisting one if absent.
    /// Serialized on the manifest lock so concurrent callers agree.
    pub fn ensure_archive_id(&self) -> Result<String> {
        self.ensure_alive()?;
        let _guard = self.manifest_lock.lock().unwrap();

        let key = Self::manifest_key(Self::MANIFEST_ARCHIVE_ID);
        let mut wtxn = self.env.write_txn()?;
        if let Some(existing) = self.db.get(&wtxn, &key)? {
            let id = String::from_utf8_lossy(existing).into_owned();
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.db.put(&mut wtxn, &key, id.as_bytes())?;
        wtxn.commit()?;
        Ok(id)
    }

    pub fn get_archive_id(&self) -> Result<Option<String>> {
        self.read_manifest(Self::MANIFEST_ARCHIVE_ID)
    }

    /// Clear every file hash and signature entry and the hash algorithm.
    ///
    /// The `truncating` marker brackets the deletion: a crash in between is
    /// recovered by repeating the truncate on the next open.
    pub fn truncate(&self) -> Result<()> {
        self.ensure_alive()?;
        let _guard = self.manifest_lock.lock().unwrap();

        self.write_manifest_unlocked(Self::MANIFEST_PENDING_ACTION, Some("truncate"))?;
        self.delete_prefix_batched(PREFIX_FILE_SIGNATURE)?;
        self.delete_prefix_batched(PREFIX_FILE_HASH)?;
        self.write_manifest_unlocked(Self::MANIFEST_HASH_ALGORITHM, None)?;
        self.write_manifest_unlocked(Self::MANIFEST_PENDING_ACTION, None)?;
        Ok(())
    }

    fn write_manifest_unlocked(&self, entry: &str, value: Option<&str>) -> Result<()> {
        let key = Self::manifest_key(entry);
        let mut wtxn = self.env.write_txn()?;
        match value {
            Some(value) => {
                self.db.put(&mut wtxn, &key, value.as_bytes())?;
            }
            None => {
                self.db.delete(&mut wtxn, &key)?;
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    fn delete_prefix_batched(&self, prefix: u8) -> Result<()> {
        loop {
            let keys: Vec<Vec<u8>> = {
                let rtxn = self.env.read_txn()?;
                let iter = self.db.prefix_iter(&rtxn, &[prefix])?;
                let mut keys = Vec::new();
                for item in iter {
                    let (key, _) = item?;
                    keys.push(key.to_vec());
                    if keys.len() >= TRUNCATE_BATCH {
                        break;
                    }
                }
                keys
            };
            if keys.is_empty() {
                return Ok(());
            }
            let mut wtxn = self.env.write_txn()?;
            for key in &keys {
                self.db.delete(&mut wtxn, key)?;
            }
            wtxn.commit()?;
        }
    }

    fn signature_bucket_prefix(path_hash: &[u8; 16]) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(17);
        prefix.push(PREFIX_FILE_SIGNATURE);
        prefix.extend_from_slice(path_hash);
        prefix
    }

    /// Upsert the signature for `path`.
    ///
    /// Scans the path-hash bucket: a stored entry whose components match is
    /// replaced in place, otherwise the signature is appended under the next
    /// sequence number. Serialized per bucket.
    pub async fn register_file(&self, path: &Path, signature: &FileSignature) -> Result<()> {
        self.ensure_alive()?;
        let components = path_components(path)?;
        let path_hash = long_path_hash(&components);
        let prefix = Self::signature_bucket_prefix(&path_hash);

        let value = rmp_serde::to_vec(&SignatureValue(
            components.clone(),
            signature.digest.clone(),
            signature.mtime_ns,
            signature.ec_id,
        ))?;

        let _lock = self.bucket_locks.lock(path_hash).await;

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
                let stored: SignatureValue = rmp_serde::from_slice(data)?;
                if stored.0 == components {
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

    /// Remove the signature entry whose components match `path` exactly.
    /// Silent if absent.
    pub async fn deregister_file(&self, path: &Path) -> Result<()> {
        self.ensure_alive()?;
        let components = path_components(path)?;
        let path_hash = long_path_hash(&components);
        let prefix = Self::signature_bucket_prefix(&path_hash);

        let _lock = self.bucket_locks.lock(path_hash).await;

        let mut wtxn = self.env.write_txn()?;
        let mut matching_key: Option<Vec<u8>> = None;
        {
            let iter = self.db.prefix_iter(&wtxn, &prefix)?;
            for item in iter {
                let (key, data) = item?;
                let stored: SignatureValue = rmp_serde::from_slice(data)?;
                if stored.0 == components {
                    matching_key = Some(key.to_vec());
                    break;
                }
            }
        }
        if let Some(key) = matching_key {
            self.db.delete(&mut wtxn, &key)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Look up the stored signature for `path` (component-exact bucket scan).
    pub async fn lookup_file(&self, path: &Path) -> Result<Option<FileSignature>> {
        self.ensure_alive()?;
        let components = path_components(path)?;
        let path_hash = long_path_hash(&components);
        let prefix = Self::signature_bucket_prefix(&path_hash);

        let _lock = self.bucket_locks.lock(path_hash).await;

        let rtxn = self.env.read_txn()?;
        let iter = self.db.prefix_iter(&rtxn, &prefix)?;
        for item in iter {
            let (_, data) = item?;
            let stored: SignatureValue = rmp_serde::from_slice(data)?;
            if stored.0 == components {
                return Ok(Some(FileSignature::new(stored.1, stored.2, stored.3)));
            }
        }
        Ok(None)
    }

    /// Every registered `(path, signature)` pair, in key order.
    pub fn list_registered_files(&self) -> Result<Vec<(PathBuf, FileSignature)>> {
        self.ensure_alive()?;
        let rtxn = self.env.read_txn()?;
        let iter = self.db.prefix_iter(&rtxn, &[PREFIX_FILE_SIGNATURE])?;
        let mut files = Vec::new();
        for item in iter {
            let (_, data) = item?;
            let stored: SignatureValue = rmp_serde::from_slice(data)?;
            files.push((
                path_from_components(&stored.0),
                FileSignature::new(stored.1, stored.2, stored.3),
            ));
        }
        Ok(files)
    }

    /// All EC classes under `digest`, ascending `ec_id`, paths sorted within
    /// each class.
    pub fn list_ec_classes(&self, digest: &[u8]) -> Result<Vec<(u32, Vec<PathBuf>)>> {
        self.ensure_alive()?;
        let mut prefix = Vec::with_capacity(1 + digest.len());
        prefix.push(PREFIX_FILE_HASH);
        prefix.extend_from_slice(digest);

        let rtxn = self.env.read_txn()?;
        let iter = self.db.prefix_iter(&rtxn, &prefix)?;

        let mut classes: std::collections::BTreeMap<u32, Vec<PathBuf>> = Default::default();
        for item in iter {
            let (key, data) = item?;
            let rest = &key[prefix.len()..];
            if rest.len() < 8 {
                continue;
            }
            let ec_id = u32::from_be_bytes(rest[..4].try_into().unwrap());
            let stored: EcPathValue = rmp_serde::from_slice(data)?;
            classes
                .entry(ec_id)
                .or_default()
                .push(path_from_components(&stored.0));
        }

        Ok(classes
            .into_iter()
            .map(|(ec_id, mut paths)| {
                paths.sort();
                (ec_id, paths)
            })
            .collect())
    }

    /// Add `paths` to the EC class `(digest, ec_id)`.
    ///
    /// Callers must have verified content equality beforehand; the store
    /// only maintains membership. Paths already present are skipped.
    /// Serialized per `(digest, ec_id)`.
    pub async fn add_paths_to_ec(&self, digest: &[u8], ec_id: u32, paths: &[PathBuf]) -> Result<()> {
        self.ensure_alive()?;
        let ec_key = ec_class_prefix(digest, ec_id);
        let _lock = self.ec_locks.lock(ec_key.clone()).await;

        let mut wtxn = self.env.write_txn()?;
        for path in paths {
            let components = path_components(path)?;
            let path_hash = short_path_hash(&components);

            let mut bucket_prefix = Vec::with_capacity(1 + ec_key.len() + 4);
            bucket_prefix.push(PREFIX_FILE_HASH);
            bucket_prefix.extend_from_slice(&ec_key);
            bucket_prefix.extend_from_slice(&path_hash.to_be_bytes());

            let mut next_seq: u64 = 0;
            let mut already_present = false;
            {
                let iter = self.db.prefix_iter(&wtxn, &bucket_prefix)?;
                for item in iter {
                    let (key, data) = item?;
                    if let Some((seq, _)) = decode_varint(&key[bucket_prefix.len()..]) {
                        next_seq = next_seq.max(seq + 1);
                    }
                    let stored: EcPathValue = rmp_serde::from_slice(data)?;
                    if stored.0 == components {
                        already_present = true;
                        break;
                    }
                }
            }
            if already_present {
                continue;
            }

            let mut key = bucket_prefix;
            encode_varint(next_seq, &mut key);
            let value = rmp_serde::to_vec(&EcPathValue(components))?;
            self.db.put(&mut wtxn, &key, &value)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Remove `paths` from the EC class `(digest, ec_id)`. Sequence numbers
    /// are not compacted; gaps remain. Silent on absent paths.
    pub async fn remove_paths_from_ec(
        &self,
        digest: &[u8],
        ec_id: u32,
        paths: &[PathBuf],
    ) -> Result<()> {
        self.ensure_alive()?;
        let ec_key = ec_class_prefix(digest, ec_id);
        let _lock = self.ec_locks.lock(ec_key.clone()).await;

        let mut wtxn = self.env.write_txn()?;
        for path in paths {
            let components = path_components(path)?;
            let path_hash = short_path_hash(&components);

            let mut bucket_prefix = Vec::with_capacity(1 + ec_key.len() + 4);
            bucket_prefix.push(PREFIX_FILE_HASH);
            bucket_prefix.extend_from_slice(&ec_key);
            bucket_prefix.extend_from_slice(&path_hash.to_be_bytes());

            let mut matching_key: Option<Vec<u8>> = None;
            {
                let iter = self.db.prefix_iter(&wtxn, &bucket_prefix)?;
                for item in iter {
                    let (key, data) = item?;
                    let stored: EcPathValue = rmp_serde::from_slice(data)?;
                    if stored.0 == components {
                        matching_key = Some(key.to_vec());
                        break;
                    }
                }
            }
            if let Some(key) = matching_key {
                self.db.delete(&mut wtxn, &key)?;
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Deterministic text lines over every entry, for debugging and for the
    /// convergence tests. `digest_len` (from the active hash algorithm)
    /// splits `h` keys; unknown lengths degrade to raw hex.
    pub fn inspect(&self, digest_len: Option<usize>) -> Result<Vec<String>> {
        self.ensure_alive()?;
        let rtxn = self.env.read_txn()?;
        let iter = self.db.iter(&rtxn)?;

        let mut lines = Vec::new();
        for item in iter {
            let (key, value) = item?;
            match key.first() {
                Some(&PREFIX_MANIFEST) => {
                    let entry = String::from_utf8_lossy(&key[1..]);
                    let text = String::from_utf8_lossy(value);
                    lines.push(format!("manifest-property {entry} {text}"));
                }
                Some(&PREFIX_FILE_HASH) => {
                    let rest = &key[1..];
                    match digest_len {
                        Some(len) if rest.len() >= len + 8 => {
                            let digest = hex(&rest[..len]);
                            let ec_id = u32::from_be_bytes(rest[len..len + 4].try_into().unwrap());
                            let path_hash = hex(&rest[len + 4..len + 8]);
                            let seq = decode_varint(&rest[len + 8..]).map(|(v, _)| v).unwrap_or(0);
                            let stored: EcPathValue = rmp_serde::from_slice(value)?;
                            let path = quoted_path(&stored.0);
                            lines.push(format!(
                                "file-hash {digest} ec_id:{ec_id} path_hash:0x{path_hash} seq:{seq} {path}"
                            ));
                        }
                        _ => {
                            lines.push(format!("file-hash *{} {:?}", hex(rest), value));
                        }
                    }
                }
                Some(&PREFIX_FILE_SIGNATURE) => {
                    let rest = &key[1..];
                    let path_hash = hex(&rest[..rest.len().min(16)]);
                    let seq = if rest.len() > 16 {
                        decode_varint(&rest[16..]).map(|(v, _)| v).unwrap_or(0)
                    } else {
                        0
                    };
                    let stored: SignatureValue = rmp_serde::from_slice(value)?;
                    let path = quoted_path(&stored.0);
                    let digest = hex(&stored.1);
                    let mtime = match stored.2 {
                        Some(ns) => format_mtime(ns),
                        None => "null".to_string(),
                    };
                    let ec_id = match stored.3 {
                        Some(id) => id.to_string(),
                        None => "null".to_string(),
                    };
                    lines.push(format!(
                        "file-metadata path_hash:{path_hash} seq:{seq} {path} digest:{digest} mtime:{mtime} ec_id:{ec_id}"
                    ));
                }
                _ => {
                    lines.push(format!("OTHER {:?} {:?}", key, value));
                }
            }
        }
        Ok(lines)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn format_mtime(mtime_ns: i64) -> String {
    use chrono::TimeZone;
    match chrono::Utc.timestamp_opt(
        mtime_ns.div_euclid(1_000_000_000),
        mtime_ns.rem_euclid(1_000_000_000) as u32,
    ) {
        chrono::LocalResult::Single(ts) => ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
        _ => format!("@{mtime_ns}ns"),
    }
}

/// URL-quote each component and join with `/`, so inspect lines stay
/// single-line and unambiguous regardless of file names.
fn quoted_path(components: &[String]) -> String {
    components
        .iter()
        .map(|part| quote_component(part))
        .collect::<Vec<_>>()
        .join("/")
}

fn quote_component(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for byte in part.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'~' | b'-' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
