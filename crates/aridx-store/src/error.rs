//! Store error kinds.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("archive {0} does not exist")]
    ArchiveMissing(PathBuf),

    #[error("archive {0} is not a directory")]
    ArchiveNotDir(PathBuf),

    #[error("the index for archive {0} has not been created")]
    IndexMissing(PathBuf),

    #[error("the index store was closed")]
    Closed,

    #[error("cannot create report directory {0}: a file with this name already exists")]
    ReportPathConflict(PathBuf),

    #[error("database error: {0}")]
    Database(#[from] heed::Error),

    #[error("value encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("value decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("report manifest error: {0}")]
    ManifestFormat(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("path {0} contains non-UTF-8 components")]
    NonUtf8Path(PathBuf),
}

pub type Result<T> = std::result::Result<T, StoreError>;
