//! Walk construction for archive and input traversals.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use aridx_config::ArchiveSettings;
use aridx_walk::{resolve_symlink_target, FileContext, Walk, WalkPolicy};

use aridx_store::INDEX_DIR_NAME;

/// Walk an archive: `.aridx` is excluded, and symlinks listed in the
/// archive's `followed_symlinks` are descended into (with substitute
/// contexts carrying the resolved target's stat), provided their target does
/// not loop back over the archive root.
pub fn walk_archive(archive_path: &Path, settings: &ArchiveSettings) -> Walk {
    let excluded: HashSet<PathBuf> = [PathBuf::from(INDEX_DIR_NAME)].into_iter().collect();

    let follow_symlink = if settings.followed_symlinks.is_empty() {
        None
    } else {
        let follow_set: HashSet<PathBuf> = settings.followed_symlinks.iter().cloned().collect();
        let root = archive_path.to_path_buf();
        Some(Box::new(move |link: &Path, ctx: &FileContext| {
            if !follow_set.contains(ctx.relative_path()) {
                return None;
            }
            let resolved = resolve_symlink_target(link, &root)?;
            let metadata = std::fs::metadata(&resolved).ok()?;
            Some(FileContext::new(
                ctx.parent().cloned(),
                ctx.name().to_string(),
                ctx.relative_path().to_path_buf(),
                metadata,
            ))
        }) as Box<aridx_walk::walker::FollowSymlink>)
    };

    Walk::new(
        archive_path,
        WalkPolicy {
            excluded,
            follow_symlink,
            yield_root: false,
        },
    )
}

/// Walk an analysis input: nothing excluded, symlinks stay leaves, and the
/// root itself is yielded first.
pub fn walk_input(input: &Path) -> Walk {
    Walk::new(
        input,
        WalkPolicy {
            yield_root: true,
            ..WalkPolicy::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn archive_walk_skips_index_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(INDEX_DIR_NAME)).unwrap();
        fs::write(dir.path().join(INDEX_DIR_NAME).join("junk"), "x").unwrap();
        fs::write(dir.path().join("data.txt"), "x").unwrap();

        let names: Vec<String> = walk_archive(dir.path(), &ArchiveSettings::default())
            .map(|(_, ctx)| ctx.name().to_string())
            .collect();
        assert_eq!(names, vec!["data.txt"]);
    }

    #[test]
    fn followed_symlink_descends_into_target() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("inner.txt"), "x").unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("mirror")).unwrap();

        let settings = ArchiveSettings {
            followed_symlinks: vec![PathBuf::from("mirror")],
            ..ArchiveSettings::default()
        };
        let rel: Vec<String> = walk_archive(dir.path(), &settings)
            .map(|(_, ctx)| ctx.relative_path().to_string_lossy().into_owned())
            .collect();
        assert_eq!(rel, vec!["mirror", "mirror/inner.txt"]);

        // Without the setting the symlink stays a leaf.
        let rel: Vec<String> = walk_archive(dir.path(), &ArchiveSettings::default())
            .map(|(_, ctx)| ctx.relative_path().to_string_lossy().into_owned())
            .collect();
        assert_eq!(rel, vec!["mirror"]);
    }
}
