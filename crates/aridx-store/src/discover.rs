//! Locating archives and reports on disk.

use std::path::{Path, PathBuf};

use crate::INDEX_DIR_NAME;

/// `<input>.report` next to the analyzed path.
pub fn report_directory_for(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_os_string();
    name.push(".report");
    PathBuf::from(name)
}

/// Walk upward from `target` to the nearest path that has a report
/// directory beside it; returns the analyzed path.
pub fn find_report_for_path(target: &Path) -> Option<PathBuf> {
    let start = target.canonicalize().unwrap_or_else(|_| target.to_path_buf());
    let mut current = start.as_path();
    loop {
        if report_directory_for(current).is_dir() {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
}

/// Walk upward from `start` to the nearest directory containing `.aridx`.
pub fn find_archive_for_path(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    let mut current = start.as_path();
    loop {
        if current.join(INDEX_DIR_NAME).is_dir() {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
}
