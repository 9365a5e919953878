//! Core error kinds.

use std::path::PathBuf;

use thiserror::Error;

use aridx_config::SettingsError;
use aridx_store::StoreError;
use aridx_sync::{GroupError, ListenerError, ThrottlerError};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("the index has not been built")]
    HashAlgorithmUnset,

    #[error("unknown hash algorithm: {0}")]
    HashAlgorithmUnknown(String),

    #[error("hash algorithm mismatch: source uses {source_algo}, current uses {current}")]
    HashAlgorithmMismatch { source_algo: String, current: String },

    #[error("invalid import relationship: {0}")]
    InvalidImportRelationship(String),

    #[error("archive id not set; rebuild or refresh the archive first")]
    ArchiveIdMissing,

    #[error("inconsistent comparison rules within directory {0}")]
    InconsistentRule(PathBuf),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Throttler(#[from] ThrottlerError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("task panicked: {0}")]
    TaskPanic(String),
}

impl From<GroupError<CoreError>> for CoreError {
    fn from(error: GroupError<CoreError>) -> Self {
        match error {
            GroupError::Task(inner) => inner,
            GroupError::Panic(message) => CoreError::TaskPanic(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
