//! Typed file metadata differences.
//!
//! `compare_file_metadata` reports nanosecond-resolution timestamp
//! differences between two regular files; a [`FileMetadataDifferencePattern`]
//! names the kinds a caller chooses to ignore when classifying duplicates.

use std::collections::HashSet;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileMetadataDifferenceKind {
    Atime,
    Ctime,
    Mtime,
    Birthtime,
}

impl std::fmt::Display for FileMetadataDifferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Atime => "atime",
            Self::Ctime => "ctime",
            Self::Mtime => "mtime",
            Self::Birthtime => "birthtime",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for FileMetadataDifferenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "atime" => Ok(Self::Atime),
            "ctime" => Ok(Self::Ctime),
            "mtime" => Ok(Self::Mtime),
            "birthtime" => Ok(Self::Birthtime),
            other => Err(format!("unknown metadata difference type: {other}")),
        }
    }
}

/// One observed difference, nanoseconds since the epoch on each side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadataDifference {
    pub kind: FileMetadataDifferenceKind,
    pub indexed: i128,
    pub target: i128,
}

impl FileMetadataDifference {
    pub fn description(&self) -> String {
        format!(
            "{}: {} (indexed) != {} (target)",
            self.kind,
            format_timestamp(self.indexed),
            format_timestamp(self.target)
        )
    }
}

fn format_timestamp(ns: i128) -> String {
    use chrono::TimeZone;
    let seconds = ns.div_euclid(1_000_000_000) as i64;
    let nanos = ns.rem_euclid(1_000_000_000) as u32;
    match chrono::Utc.timestamp_opt(seconds, nanos) {
        chrono::LocalResult::Single(ts) => ts.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string(),
        _ => format!("@{ns}ns"),
    }
}

/// The set of difference kinds a comparison chooses to tolerate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadataDifferencePattern {
    kinds: HashSet<FileMetadataDifferenceKind>,
}

impl FileMetadataDifferencePattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// atime and ctime change on ordinary filesystem traffic.
    pub fn trivial() -> Self {
        let mut pattern = Self::new();
        pattern.add(FileMetadataDifferenceKind::Atime);
        pattern.add(FileMetadataDifferenceKind::Ctime);
        pattern
    }

    pub fn all() -> Self {
        let mut pattern = Self::new();
        pattern.add(FileMetadataDifferenceKind::Atime);
        pattern.add(FileMetadataDifferenceKind::Ctime);
        pattern.add(FileMetadataDifferenceKind::Mtime);
        pattern.add(FileMetadataDifferenceKind::Birthtime);
        pattern
    }

    pub fn add(&mut self, kind: FileMetadataDifferenceKind) {
        self.kinds.insert(kind);
    }

    pub fn matches(&self, difference: &FileMetadataDifference) -> bool {
        self.kinds.contains(&difference.kind)
    }
}

fn time_ns(seconds: i64, nanos: i64) -> i128 {
    i128::from(seconds) * 1_000_000_000 + i128::from(nanos)
}

/// Compare metadata of two regular files (not following symlinks).
pub fn compare_file_metadata(a: &Path, b: &Path) -> io::Result<Vec<FileMetadataDifference>> {
    let stat_a = std::fs::symlink_metadata(a)?;
    let stat_b = std::fs::symlink_metadata(b)?;

    if !stat_a.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", a.display()),
        ));
    }
    if !stat_b.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", b.display()),
        ));
    }

    let mut differences = Vec::new();

    let atime_a = time_ns(stat_a.atime(), stat_a.atime_nsec());
    let atime_b = time_ns(stat_b.atime(), stat_b.atime_nsec());
    if atime_a != atime_b {
        differences.push(FileMetadataDifference {
            kind: FileMetadataDifferenceKind::Atime,
            indexed: atime_a,
            target: atime_b,
        });
    }

    let ctime_a = time_ns(stat_a.ctime(), stat_a.ctime_nsec());
    let ctime_b = time_ns(stat_b.ctime(), stat_b.ctime_nsec());
    if ctime_a != ctime_b {
        differences.push(FileMetadataDifference {
            kind: FileMetadataDifferenceKind::Ctime,
            indexed: ctime_a,
            target: ctime_b,
        });
    }

    let mtime_a = time_ns(stat_a.mtime(), stat_a.mtime_nsec());
    let mtime_b = time_ns(stat_b.mtime(), stat_b.mtime_nsec());
    if mtime_a != mtime_b {
        differences.push(FileMetadataDifference {
            kind: FileMetadataDifferenceKind::Mtime,
            indexed: mtime_a,
            target: mtime_b,
        });
    }

    if let (Ok(created_a), Ok(created_b)) = (stat_a.created(), stat_b.created()) {
        if created_a != created_b {
            let to_ns = |t: std::time::SystemTime| -> i128 {
                match t.duration_since(std::time::UNIX_EPOCH) {
                    Ok(d) => d.as_nanos() as i128,
                    Err(e) => -(e.duration().as_nanos() as i128),
                }
            };
            differences.push(FileMetadataDifference {
                kind: FileMetadataDifferenceKind::Birthtime,
                indexed: to_ns(created_a),
                target: to_ns(created_b),
            });
        }
    }

    Ok(differences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn identical_mtimes_report_no_mtime_difference() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "x").unwrap();
        fs::write(&b, "x").unwrap();

        let now = filetime_now(&a);
        filetime::set_file_times(&a, now, now).unwrap();
        filetime::set_file_times(&b, now, now).unwrap();

        let diffs = compare_file_metadata(&a, &b).unwrap();
        assert!(!diffs
            .iter()
            .any(|d| d.kind == FileMetadataDifferenceKind::Mtime));
        assert!(!diffs
            .iter()
            .any(|d| d.kind == FileMetadataDifferenceKind::Atime));
    }

    #[test]
    fn mtime_shift_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "x").unwrap();
        fs::write(&b, "x").unwrap();

        let base = filetime_now(&a);
        let shifted = filetime::FileTime::from_unix_time(base.unix_seconds() + 5, base.nanoseconds());
        filetime::set_file_times(&a, base, base).unwrap();
        filetime::set_file_times(&b, base, shifted).unwrap();

        let diffs = compare_file_metadata(&a, &b).unwrap();
        assert!(diffs
            .iter()
            .any(|d| d.kind == FileMetadataDifferenceKind::Mtime));
    }

    #[test]
    fn non_regular_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();
        assert!(compare_file_metadata(dir.path(), &file).is_err());
    }

    #[test]
    fn trivial_pattern_covers_atime_and_ctime_only() {
        let pattern = FileMetadataDifferencePattern::trivial();
        let diff = |kind| FileMetadataDifference {
            kind,
            indexed: 0,
            target: 1,
        };
        assert!(pattern.matches(&diff(FileMetadataDifferenceKind::Atime)));
        assert!(pattern.matches(&diff(FileMetadataDifferenceKind::Ctime)));
        assert!(!pattern.matches(&diff(FileMetadataDifferenceKind::Mtime)));
        assert!(!pattern.matches(&diff(FileMetadataDifferenceKind::Birthtime)));
    }

    fn filetime_now(path: &Path) -> filetime::FileTime {
        filetime::FileTime::from_last_modification_time(&fs::metadata(path).unwrap())
    }
}
