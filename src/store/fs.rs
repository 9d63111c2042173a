use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;

use super::{anchored, relative_to, validate_name, DatasetStore};
use crate::error::StoreError;

/// Marker embedded in temporary file names; such files are never listed.
const TEMP_MARKER: &str = ".tmp-";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Dataset store backed by a directory tree.
///
/// Dataset names map to files below `root`. Writes go to a uniquely named
/// temporary file in the target directory which is then renamed over the
/// destination, so readers see either the old or the new payload.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    identifier: String,
}

impl FsStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let identifier = format!("file://{}", root.display());
        Self { root, identifier }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a dataset.
    pub fn path_of(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(name.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }

    fn temp_path(path: &Path) -> PathBuf {
        let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(
            "{}{}{}-{}",
            file_name,
            TEMP_MARKER,
            std::process::id(),
            counter
        ))
    }
}

#[async_trait]
impl DatasetStore for FsStore {
    async fn read(&self, name: &str) -> Result<Bytes, StoreError> {
        let path = self.path_of(name)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::io(name, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<(), StoreError> {
        let path = self.path_of(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(name, e))?;
        }

        let temp = Self::temp_path(&path);
        if let Err(e) = tokio::fs::write(&temp, &data).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StoreError::io(name, e));
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StoreError::io(name, e));
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_of(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(name, e)),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_of(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(name, e)),
        }
    }

    async fn list(&self, prefix: &str, pattern: &Regex) -> Result<Vec<String>, StoreError> {
        let pattern = anchored(pattern)?;
        let prefix = prefix.trim_matches('/');
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.path_of(prefix)?
        };

        let mut names = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(prefix, e))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::io(prefix, e))?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.to_string_lossy().contains(TEMP_MARKER) {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if let Some(rel) = relative_to(prefix, &name) {
                    if pattern.is_match(rel) {
                        names.push(rel.to_string());
                    }
                }
            }
        }

        names.sort();
        Ok(names)
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
