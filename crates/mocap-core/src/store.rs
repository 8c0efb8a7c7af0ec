use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use crate::ensure_dir;

/// Persistence of "already done". The scheduler only ever asks whether a
/// path exists and when it last changed, so a content-hash backend can
/// stand in for modification times without touching scheduling logic.
pub trait TargetStore: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// `Ok(None)` when the path does not exist.
    fn modified_at(&self, path: &Path) -> Result<Option<SystemTime>>;

    /// Create (or refresh) a zero-byte sentinel marker.
    fn touch_marker(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsTargetStore;

impl TargetStore for FsTargetStore {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn modified_at(&self, path: &Path) -> Result<Option<SystemTime>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(
                meta.modified()
                    .with_context(|| format!("read mtime of {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
        }
    }

    fn touch_marker(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }
        let file = fs::File::create(path)
            .with_context(|| format!("write marker {}", path.display()))?;
        // Truncating an already-empty file does not reliably bump mtime.
        file.set_modified(SystemTime::now())?;
        Ok(())
    }
}

impl<T: TargetStore + ?Sized> TargetStore for Arc<T> {
    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }

    fn modified_at(&self, path: &Path) -> Result<Option<SystemTime>> {
        (**self).modified_at(path)
    }

    fn touch_marker(&self, path: &Path) -> Result<()> {
        (**self).touch_marker(path)
    }
}
