use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use tokio::sync::RwLock;

use super::{anchored, relative_to, validate_name, DatasetStore};
use crate::error::StoreError;

/// In-memory dataset store.
///
/// Cloning yields a handle to the same datasets. Reads and writes are counted,
/// which tests use to observe caching and incremental persistence.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    datasets: Arc<RwLock<BTreeMap<String, Bytes>>>,
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of datasets currently stored.
    pub async fn len(&self) -> usize {
        self.datasets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.datasets.read().await.is_empty()
    }

    /// All dataset names, sorted.
    pub async fn names(&self) -> Vec<String> {
        self.datasets.read().await.keys().cloned().collect()
    }

    /// Number of successful `read` calls so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful `write` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatasetStore for MemoryStore {
    async fn read(&self, name: &str) -> Result<Bytes, StoreError> {
        validate_name(name)?;
        let datasets = self.datasets.read().await;
        let data = datasets
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<(), StoreError> {
        validate_name(name)?;
        self.datasets.write().await.insert(name.to_string(), data);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        Ok(self.datasets.write().await.remove(name).is_some())
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        Ok(self.datasets.read().await.contains_key(name))
    }

    async fn list(&self, prefix: &str, pattern: &Regex) -> Result<Vec<String>, StoreError> {
        let pattern = anchored(pattern)?;
        let datasets = self.datasets.read().await;
        Ok(datasets
            .keys()
            .filter_map(|name| relative_to(prefix, name))
            .filter(|rel| pattern.is_match(rel))
            .map(str::to_string)
            .collect())
    }

    fn identifier(&self) -> &str {
        "memory://"
    }
}
