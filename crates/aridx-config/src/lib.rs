//! # aridx-config
//!
//! Per-archive settings and logging bootstrap.
//!
//! Settings live in `<archive>/.aridx/settings.toml`:
//!
//! ```toml
//! followed_symlinks = ["media", "mirrors/pool"]
//!
//! [logging]
//! path = "/var/log/aridx.log"
//! ```
//!
//! A missing file yields all defaults; unknown keys are ignored.

pub mod logging;

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

pub use logging::init_logging;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Typed view of `.aridx/settings.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveSettings {
    /// Symlinks (relative to the archive root) the walker descends into.
    pub followed_symlinks: Vec<PathBuf>,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Optional log file appended to in addition to stderr filtering.
    pub path: Option<PathBuf>,
}

impl ArchiveSettings {
    /// Load settings for an archive root; absent file means defaults.
    pub fn load(archive_path: &Path) -> Result<Self, SettingsError> {
        let settings_file = archive_path.join(".aridx").join("settings.toml");
        if !settings_file.exists() {
            return Ok(Self::default());
        }
        debug!(path = %settings_file.display(), "loading archive settings");
        let contents = std::fs::read_to_string(&settings_file)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn follows_symlink(&self, relative: &Path) -> bool {
        self.followed_symlinks.iter().any(|p| p == relative)
    }

    pub fn logging_path(&self) -> Option<&Path> {
        self.logging.path.as_deref()
    }
}
