//! Per-entry walk context.

use std::any::Any;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Context for one walked entry.
///
/// Contexts form a tree through parent back-references; parents never point
/// at children, so the chain is cycle-free and an entry is freed as soon as
/// the walk frontier moves past it, unless a coordinator still holds it.
pub struct FileContext {
    parent: Option<Arc<FileContext>>,
    name: String,
    relative_path: PathBuf,
    metadata: Metadata,
    attachment: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl FileContext {
    pub fn new(
        parent: Option<Arc<FileContext>>,
        name: String,
        relative_path: PathBuf,
        metadata: Metadata,
    ) -> Self {
        Self {
            parent,
            name,
            relative_path,
            metadata,
            attachment: Mutex::new(None),
        }
    }

    /// Parent context; `None` at the walk root.
    pub fn parent(&self) -> Option<&Arc<FileContext>> {
        self.parent.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path relative to the walk root (empty for the root itself).
    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    /// Cached stat result captured when the entry was discovered. For
    /// followed symlinks this is the stat of the resolved target.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.metadata.is_file()
    }

    pub fn is_symlink(&self) -> bool {
        self.metadata.is_symlink()
    }

    /// Attach coordination state to this entry, replacing any previous
    /// attachment. Only one coordinator is active per walk, so a single slot
    /// suffices.
    pub fn attach<T: Any + Send + Sync>(&self, value: T) {
        *self.attachment.lock().unwrap() = Some(Box::new(value));
    }

    /// Clone out the attachment, if one of the requested type is present.
    pub fn attachment<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.attachment
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }
}

impl std::fmt::Debug for FileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileContext")
            .field("name", &self.name)
            .field("relative_path", &self.relative_path)
            .field("is_dir", &self.is_dir())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn attachment_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = fs::symlink_metadata(dir.path()).unwrap();
        let ctx = FileContext::new(None, "root".into(), PathBuf::new(), metadata);

        assert!(ctx.attachment::<u32>().is_none());
        ctx.attach(7u32);
        assert_eq!(ctx.attachment::<u32>(), Some(7));
        // Wrong type stays invisible.
        assert!(ctx.attachment::<String>().is_none());
    }

    #[test]
    fn parent_chain() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let root_meta = fs::symlink_metadata(dir.path()).unwrap();
        let root = Arc::new(FileContext::new(None, "root".into(), PathBuf::new(), root_meta));

        let sub_meta = fs::symlink_metadata(dir.path().join("sub")).unwrap();
        let sub = FileContext::new(
            Some(Arc::clone(&root)),
            "sub".into(),
            PathBuf::from("sub"),
            sub_meta,
        );

        assert!(Arc::ptr_eq(sub.parent().unwrap(), &root));
        assert!(root.parent().is_none());
    }
}
