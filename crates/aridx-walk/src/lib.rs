//! # aridx-walk
//!
//! Lazy depth-first filesystem traversal with per-entry context.
//!
//! [`Walk`] yields `(absolute_path, Arc<FileContext>)` pairs in pre-order,
//! parent before children. A [`WalkPolicy`] controls exclusions, symlink
//! following, and whether the root itself is yielded. Each [`FileContext`]
//! carries a back-reference to its parent context and a single type-erased
//! attachment slot that coordinators use to hang per-directory state off the
//! walk (the analyzer stores its completion listeners there).

pub mod context;
pub mod walker;

pub use context::FileContext;
pub use walker::{resolve_symlink_target, Walk, WalkPolicy};
