//! The walk loop.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::FileContext;

/// Decides whether a symlink is descended into.
///
/// Given the symlink's absolute path and its context, returns a substitute
/// context (built from the resolved target's stat) to walk the entry as if
/// it were that directory in place, or `None` to keep the symlink as a leaf.
pub type FollowSymlink = dyn Fn(&Path, &FileContext) -> Option<FileContext> + Send + Sync;

/// Traversal policy for one walk.
pub struct WalkPolicy {
    /// Entries whose relative path's first component matches one of these
    /// are skipped entirely (`.aridx` for archive walks).
    pub excluded: HashSet<PathBuf>,
    /// Symlink-follow predicate; defaults to never following.
    pub follow_symlink: Option<Box<FollowSymlink>>,
    /// Whether the walk root itself is yielded as the first entry.
    pub yield_root: bool,
}

impl Default for WalkPolicy {
    fn default() -> Self {
        Self {
            excluded: HashSet::new(),
            follow_symlink: None,
            yield_root: false,
        }
    }
}

impl WalkPolicy {
    fn is_excluded(&self, relative: &Path) -> bool {
        match relative.components().next() {
            Some(first) => self.excluded.contains(Path::new(first.as_os_str())),
            None => false,
        }
    }
}

/// Resolve a symlink target for following, refusing targets that escape the
/// walk by equalling or containing `root` (which would loop the traversal
/// back onto itself). Returns the resolved path, or `None` when the link is
/// broken or rejected.
pub fn resolve_symlink_target(link: &Path, root: &Path) -> Option<PathBuf> {
    let resolved = match link.canonicalize() {
        Ok(resolved) => resolved,
        Err(error) => {
            debug!(link = %link.display(), %error, "symlink target unresolvable");
            return None;
        }
    };

    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    if resolved == root || root.starts_with(&resolved) {
        debug!(link = %link.display(), "symlink target contains walk root, not following");
        return None;
    }

    Some(resolved)
}

struct Frame {
    context: Arc<FileContext>,
    /// Absolute path the directory is read through (the symlink path for
    /// followed symlinks).
    path: PathBuf,
    entries: std::vec::IntoIter<String>,
}

/// Lazy depth-first pre-order traversal.
///
/// Yields `(absolute_path, context)` pairs, parent before children, in
/// sorted name order within each directory. Entries that vanish between
/// enumeration and stat are skipped silently.
pub struct Walk {
    root: PathBuf,
    policy: WalkPolicy,
    started: bool,
    stack: Vec<Frame>,
    /// (dev, ino) of every directory entered, for cycle detection once
    /// symlinks are followed.
    visited: HashSet<(u64, u64)>,
}

impl Walk {
    pub fn new(root: impl Into<PathBuf>, policy: WalkPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
            started: false,
            stack: Vec::new(),
            visited: HashSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_sorted_names(path: &Path) -> Vec<String> {
        let reader = match fs::read_dir(path) {
            Ok(reader) => reader,
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to read directory");
                return Vec::new();
            }
        };

        let mut names: Vec<String> = reader
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| match entry.file_name().into_string() {
                Ok(name) => Some(name),
                Err(raw) => {
                    warn!(path = %path.display(), name = ?raw, "skipping non-UTF-8 entry name");
                    None
                }
            })
            .collect();
        names.sort();
        names
    }

    fn enter_directory(&mut self, path: PathBuf, context: Arc<FileContext>) {
        let key = (context.metadata().dev(), context.metadata().ino());
        if !self.visited.insert(key) {
            debug!(path = %path.display(), "directory already visited, not descending");
            return;
        }
        self.stack.push(Frame {
            entries: Self::read_sorted_names(&path).into_iter(),
            context,
            path,
        });
    }

    fn start(&mut self) -> Option<(PathBuf, Arc<FileContext>)> {
        let metadata = match fs::symlink_metadata(&self.root) {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!(root = %self.root.display(), %error, "walk root is not accessible");
                return None;
            }
        };

        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let context = Arc::new(FileContext::new(None, name, PathBuf::new(), metadata));

        if context.is_dir() {
            self.enter_directory(self.root.clone(), Arc::clone(&context));
        }

        if self.policy.yield_root {
            Some((self.root.clone(), context))
        } else {
            None
        }
    }
}

impl Iterator for Walk {
    type Item = (PathBuf, Arc<FileContext>);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            if let Some(root) = self.start() {
                return Some(root);
            }
        }

        loop {
            let frame = self.stack.last_mut()?;
            let name = match frame.entries.next() {
                Some(name) => name,
                None => {
                    self.stack.pop();
                    continue;
                }
            };

            let parent = Arc::clone(&frame.context);
            let path = frame.path.join(&name);
            let relative = parent.relative_path().join(&name);

            if self.policy.is_excluded(&relative) {
                continue;
            }

            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                // Vanished between readdir and stat.
                Err(_) => continue,
            };

            let mut context = Arc::new(FileContext::new(
                Some(parent),
                name,
                relative,
                metadata,
            ));

            if context.is_symlink() {
                if let Some(follow) = self.policy.follow_symlink.as_ref() {
                    if let Some(substitute) = follow(&path, &context) {
                        context = Arc::new(substitute);
                    }
                }
            }

            if context.is_dir() {
                // Reading through `path` lets a followed symlink be walked
                // as if it were the target directory in place.
                self.enter_directory(path.clone(), Arc::clone(&context));
            }

            return Some((path, context));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    fn relative_paths(walk: Walk) -> Vec<String> {
        walk.map(|(_, ctx)| ctx.relative_path().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn yields_depth_first_pre_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/inner")).unwrap();
        fs::write(dir.path().join("a/inner/leaf.txt"), "x").unwrap();
        fs::write(dir.path().join("a/file.txt"), "x").unwrap();
        fs::write(dir.path().join("b.txt"), "x").unwrap();

        let paths = relative_paths(Walk::new(dir.path(), WalkPolicy::default()));
        assert_eq!(
            paths,
            vec!["a", "a/file.txt", "a/inner", "a/inner/leaf.txt", "b.txt"]
        );
    }

    #[test]
    fn yield_root_emits_root_first() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), "x").unwrap();

        let policy = WalkPolicy {
            yield_root: true,
            ..WalkPolicy::default()
        };
        let mut walk = Walk::new(dir.path(), policy);
        let (root_path, root_ctx) = walk.next().unwrap();
        assert_eq!(root_path, dir.path());
        assert!(root_ctx.parent().is_none());
        assert_eq!(root_ctx.relative_path(), Path::new(""));
        assert_eq!(walk.count(), 1);
    }

    #[test]
    fn excluded_first_component_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".aridx")).unwrap();
        fs::write(dir.path().join(".aridx/database"), "x").unwrap();
        fs::write(dir.path().join("kept.txt"), "x").unwrap();

        let policy = WalkPolicy {
            excluded: [PathBuf::from(".aridx")].into_iter().collect(),
            ..WalkPolicy::default()
        };
        let paths = relative_paths(Walk::new(dir.path(), policy));
        assert_eq!(paths, vec!["kept.txt"]);
    }

    #[test]
    fn symlinks_are_leaves_by_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("real")).unwrap();
        fs::write(dir.path().join("real/inside.txt"), "x").unwrap();
        symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let paths = relative_paths(Walk::new(dir.path(), WalkPolicy::default()));
        assert_eq!(paths, vec!["link", "real", "real/inside.txt"]);
    }

    #[test]
    fn followed_symlink_is_descended() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("data.txt"), "x").unwrap();

        let dir = tempfile::tempdir().unwrap();
        symlink(outside.path(), dir.path().join("mirror")).unwrap();

        let root = dir.path().to_path_buf();
        let policy = WalkPolicy {
            follow_symlink: Some(Box::new(move |link, ctx| {
                let resolved = resolve_symlink_target(link, &root)?;
                let metadata = fs::metadata(&resolved).ok()?;
                Some(FileContext::new(
                    ctx.parent().cloned(),
                    ctx.name().to_string(),
                    ctx.relative_path().to_path_buf(),
                    metadata,
                ))
            })),
            ..WalkPolicy::default()
        };

        let paths = relative_paths(Walk::new(dir.path(), policy));
        assert_eq!(paths, vec!["mirror", "mirror/data.txt"]);
    }

    #[test]
    fn symlink_to_walk_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file.txt"), "x").unwrap();
        symlink(dir.path(), dir.path().join("loop")).unwrap();

        assert!(resolve_symlink_target(&dir.path().join("loop"), dir.path()).is_none());

        let root = dir.path().to_path_buf();
        let policy = WalkPolicy {
            follow_symlink: Some(Box::new(move |link, ctx| {
                let resolved = resolve_symlink_target(link, &root)?;
                let metadata = fs::metadata(&resolved).ok()?;
                Some(FileContext::new(
                    ctx.parent().cloned(),
                    ctx.name().to_string(),
                    ctx.relative_path().to_path_buf(),
                    metadata,
                ))
            })),
            ..WalkPolicy::default()
        };

        // The rejected link stays a symlink leaf; the walk terminates.
        let paths = relative_paths(Walk::new(dir.path(), policy));
        assert_eq!(paths, vec!["file.txt", "loop"]);
    }

    #[test]
    fn vanished_entries_are_skipped() {
        // A directory that disappears mid-walk must not abort iteration;
        // simulate by walking an empty dir (nothing to yield).
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Walk::new(dir.path(), WalkPolicy::default()).count(), 0);
    }
}
