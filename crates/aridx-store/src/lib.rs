//! # aridx-store
//!
//! Persistent storage for aridx: the archive index store (manifest
//! properties, file signatures, content equivalence classes) and the
//! per-analysis report store. Both sit on one ordered byte-keyed LMDB
//! database each, with collision-safe hashed key layouts.
//!
//! ## Index key layout
//!
//! Three namespaces share the archive database through one-byte prefixes:
//!
//! - `p<name>` → manifest property value
//! - `h<digest><ec_id:4BE><path_hash:4BE><seq:varint>` → msgpack path components
//! - `s<path_hash:16BE><seq:varint>` → msgpack `[components, digest, mtime_ns, ec_id]`
//!
//! Path hashes are MurmurHash3 over the nul-joined UTF-8 path components;
//! `seq` (unsigned LEB128) disambiguates hash collisions within a bucket.

pub mod archive;
pub mod discover;
pub mod error;
pub mod keys;
pub mod record;
pub mod report;

pub use archive::{ArchiveStore, FileSignature};
pub use discover::{find_archive_for_path, find_report_for_path, report_directory_for};
pub use error::StoreError;
pub use record::{
    DuplicateMatch, DuplicateMatchRule, DuplicateRecord, MetadataMatchReducer, MetadataMatches,
};
pub use report::{ReportManifest, ReportStore};

/// Name of the per-archive index directory.
pub const INDEX_DIR_NAME: &str = ".aridx";
