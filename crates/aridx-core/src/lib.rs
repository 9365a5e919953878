//! # aridx-core
//!
//! The aridx engines: content digesting on a bounded pool, index rebuild
//! and refresh, duplicate file matching, bottom-up directory duplicate
//! reduction, report-producing analysis, and cross-archive import.
//!
//! The [`Archive`] facade composes these into the workflows the CLI drives.

mod analyzer;
mod archive;
mod error;
mod finder;
mod importer;
mod matcher;
mod reducer;
mod refresh;
mod result;
mod walk;

pub mod hashalg;
pub mod metadata;
pub mod processor;

pub use archive::Archive;
pub use error::{CoreError, Result};
pub use finder::{DuplicateOutput, StandardOutput};
pub use hashalg::{HashAlgorithm, DEFAULT_HASH_ALGORITHM};
pub use metadata::{
    FileMetadataDifference, FileMetadataDifferenceKind, FileMetadataDifferencePattern,
};
pub use processor::Processor;
pub use result::{AggregateCounters, AnalysisResult};
pub use walk::{walk_archive, walk_input};
