//! Addressable dataset store.
//!
//! Every component persists through the [`DatasetStore`] trait: a flat
//! namespace of `/`-separated dataset names mapping to byte payloads. Names
//! are relative to the store root (an experiment directory for [`FsStore`]).
//!
//! Each operation acquires and releases its own resources; there is no
//! long-lived open handle and no cross-process locking. Concurrent writers
//! must target disjoint names.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use regex::Regex;
//! use tm_pipeline::store::{DatasetStore, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!     store.write("layers/layer_000/TileGroup0/0-0-0.png", Bytes::from_static(b"png"))
//!         .await
//!         .unwrap();
//!
//!     let pattern = Regex::new(r"TileGroup\d+/0-0-0\.png").unwrap();
//!     let names = store.list("layers/layer_000", &pattern).await.unwrap();
//!     assert_eq!(names, vec!["TileGroup0/0-0-0.png".to_string()]);
//! }
//! ```

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Named-dataset read/write/list interface over a pixel and document container.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Read the full payload of a dataset.
    async fn read(&self, name: &str) -> Result<Bytes, StoreError>;

    /// Write (or replace) a dataset. Either the new payload becomes visible in
    /// full or the previous state is kept.
    async fn write(&self, name: &str, data: Bytes) -> Result<(), StoreError>;

    /// Remove a dataset, returning whether it existed.
    async fn remove(&self, name: &str) -> Result<bool, StoreError>;

    /// Check whether a dataset exists.
    async fn exists(&self, name: &str) -> Result<bool, StoreError>;

    /// List datasets below `prefix` whose prefix-relative name fully matches
    /// `pattern`. Names are returned relative to `prefix`, sorted.
    async fn list(&self, prefix: &str, pattern: &Regex) -> Result<Vec<String>, StoreError>;

    /// Identifier for logging (e.g. `file:///data/exp1`).
    fn identifier(&self) -> &str;
}

#[async_trait]
impl<S: DatasetStore + ?Sized> DatasetStore for Arc<S> {
    async fn read(&self, name: &str) -> Result<Bytes, StoreError> {
        (**self).read(name).await
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<(), StoreError> {
        (**self).write(name, data).await
    }

    async fn remove(&self, name: &str) -> Result<bool, StoreError> {
        (**self).remove(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        (**self).exists(name).await
    }

    async fn list(&self, prefix: &str, pattern: &Regex) -> Result<Vec<String>, StoreError> {
        (**self).list(prefix, pattern).await
    }

    fn identifier(&self) -> &str {
        (**self).identifier()
    }
}

// =============================================================================
// Name Helpers
// =============================================================================

/// Join dataset name components with `/`, skipping empty parts.
pub fn join_name(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Last component of a dataset name.
pub fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Reject names that are empty, absolute, or contain `..`/`.` components.
pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Copy of `pattern` that only matches whole names.
pub(crate) fn anchored(pattern: &Regex) -> Result<Regex, StoreError> {
    Regex::new(&format!("^(?:{})$", pattern.as_str()))
        .map_err(|e| StoreError::InvalidName(e.to_string()))
}

/// Strip `prefix/` from `name`, returning `None` for names outside the prefix.
pub(crate) fn relative_to<'a>(prefix: &str, name: &'a str) -> Option<&'a str> {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        return Some(name);
    }
    name.strip_prefix(prefix)?.strip_prefix('/')
}

/// Remove every dataset below `prefix`, returning how many were removed.
pub async fn remove_prefix<S: DatasetStore + ?Sized>(
    store: &S,
    prefix: &str,
) -> Result<usize, StoreError> {
    let pattern = Regex::new(".+").map_err(|e| StoreError::InvalidName(e.to_string()))?;
    let names = store.list(prefix, &pattern).await?;
    for name in &names {
        store.remove(&join_name(&[prefix, name])).await?;
    }
    Ok(names.len())
}

// =============================================================================
// Document Helpers
// =============================================================================

/// Read a UTF-8 text dataset.
pub async fn read_text<S: DatasetStore + ?Sized>(store: &S, name: &str) -> Result<String, StoreError> {
    let bytes = store.read(name).await?;
    String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::Serialization {
        name: name.to_string(),
        message: e.to_string(),
    })
}

/// Write a UTF-8 text dataset.
pub async fn write_text<S: DatasetStore + ?Sized>(
    store: &S,
    name: &str,
    text: String,
) -> Result<(), StoreError> {
    store.write(name, Bytes::from(text)).await
}

/// Read and deserialize a JSON dataset.
pub async fn read_json<T, S>(store: &S, name: &str) -> Result<T, StoreError>
where
    T: DeserializeOwned,
    S: DatasetStore + ?Sized,
{
    let bytes = store.read(name).await?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
        name: name.to_string(),
        message: e.to_string(),
    })
}

/// Serialize a value as pretty JSON and write it.
pub async fn write_json<T, S>(store: &S, name: &str, value: &T) -> Result<(), StoreError>
where
    T: Serialize + Sync + ?Sized,
    S: DatasetStore + ?Sized,
{
    let data = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialization {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    store.write(name, Bytes::from(data)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_name() {
        assert_eq!(join_name(&["cycles", "cycle_000/", "/images"]), "cycles/cycle_000/images");
        assert_eq!(join_name(&["", "a", ""]), "a");
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("uploads/upload_000/image_files/a.tif"), "a.tif");
        assert_eq!(base_name("a.tif"), "a.tif");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("a/b/c.png").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("/etc/passwd").is_err());
        assert!(validate_name("a/../b").is_err());
        assert!(validate_name("a//b").is_err());
        assert!(validate_name("a\\b").is_err());
    }

    #[test]
    fn test_anchored() {
        let pattern = anchored(&Regex::new(r"z_\d+").unwrap()).unwrap();
        assert!(pattern.is_match("z_12"));
        assert!(!pattern.is_match("z_12.png"));
        assert!(!pattern.is_match("az_1"));

        // leftmost-first alternation must not hide a longer full match
        let alternation = anchored(&Regex::new("a|ab").unwrap()).unwrap();
        assert!(alternation.is_match("ab"));
        assert!(alternation.is_match("a"));
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to("layers/layer_000", "layers/layer_000/a.png"), Some("a.png"));
        assert_eq!(relative_to("layers/layer_000", "layers/layer_0001/a.png"), None);
        assert_eq!(relative_to("", "a.png"), Some("a.png"));
    }

    #[tokio::test]
    async fn test_remove_prefix() {
        let store = MemoryStore::new();
        for name in ["cycles/cycle_001/cycle.json", "cycles/cycle_001/images/a.png", "cycles/cycle_010/cycle.json"] {
            write_text(&store, name, String::new()).await.unwrap();
        }
        assert_eq!(remove_prefix(&store, "cycles/cycle_001").await.unwrap(), 2);
        assert_eq!(store.names().await, vec!["cycles/cycle_010/cycle.json".to_string()]);
        assert_eq!(remove_prefix(&store, "cycles/cycle_001").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_json_roundtrip_through_store() {
        let store = MemoryStore::new();
        write_json(&store, "doc.json", &vec![1u32, 2, 3]).await.unwrap();
        let back: Vec<u32> = read_json(&store, "doc.json").await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_read_json_reports_malformed_document() {
        let store = MemoryStore::new();
        write_text(&store, "doc.json", "{ nope".to_string()).await.unwrap();
        let result: Result<Vec<u32>, _> = read_json(&store, "doc.json").await;
        assert!(matches!(result, Err(StoreError::Serialization { .. })));
    }
}
