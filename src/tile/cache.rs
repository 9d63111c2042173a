//! Cache for encoded pyramid tiles.
//!
//! Sits in front of the dataset store so repeated reads of the same tile do
//! not hit the filesystem. Tiles are keyed by their logical address
//! ([`TileKey`]); the locality group is not part of the key.
//!
//! # Size-Based Eviction
//!
//! The cache tracks the total size of cached tiles in bytes and evicts
//! least-recently-used entries when the capacity is exceeded.

use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::RwLock;

use super::store::TileKey;

/// Default cache capacity: 64MB
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

/// Default maximum number of entries (to bound LRU overhead)
const DEFAULT_MAX_ENTRIES: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

// =============================================================================
// Tile Cache
// =============================================================================

/// LRU cache for encoded PNG tiles with size-based capacity.
///
/// # Thread Safety
///
/// The cache is thread-safe and can be shared across async tasks via `Arc`.
///
/// # Example
///
/// ```
/// use tm_pipeline::tile::{TileCache, TileKey};
/// use bytes::Bytes;
///
/// #[tokio::main]
/// async fn main() {
///     let cache = TileCache::new();
///
///     let key = TileKey::new(0, 3, 1, 2);
///     let tile_data = Bytes::from_static(b"\x89PNG");
///
///     cache.put(key, tile_data.clone()).await;
///     assert_eq!(cache.get(&key).await, Some(tile_data));
/// }
/// ```
pub struct TileCache {
    cache: RwLock<LruCache<TileKey, Bytes>>,

    /// Maximum total size in bytes
    max_size: usize,

    current_size: RwLock<usize>,
}

impl TileCache {
    /// Create a new tile cache with default capacity (64MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY)
    }

    /// Create a new tile cache with the specified capacity in bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            cache: RwLock::new(LruCache::new(DEFAULT_MAX_ENTRIES)),
            max_size,
            current_size: RwLock::new(0),
        }
    }

    /// Create a new tile cache with specified capacity and maximum entries.
    ///
    /// A `max_entries` of zero is treated as one.
    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        let entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(entries)),
            max_size,
            current_size: RwLock::new(0),
        }
    }

    /// Get a tile, marking it as recently used.
    pub async fn get(&self, key: &TileKey) -> Option<Bytes> {
        let mut cache = self.cache.write().await;
        cache.get(key).cloned()
    }

    /// Check if a tile is cached without updating LRU order.
    pub async fn contains(&self, key: &TileKey) -> bool {
        let cache = self.cache.read().await;
        cache.contains(key)
    }

    /// Store a tile, evicting least-recently-used entries while over capacity.
    ///
    /// If the tile already exists, it is replaced and marked as recently used.
    pub async fn put(&self, key: TileKey, data: Bytes) {
        let data_size = data.len();
        let mut cache = self.cache.write().await;
        let mut current_size = self.current_size.write().await;

        if let Some(old_data) = cache.peek(&key) {
            *current_size = current_size.saturating_sub(old_data.len());
        }

        // The LRU may drop an entry on its own when the entry bound is hit
        if let Some((evicted_key, evicted)) = cache.push(key, data) {
            if evicted_key != key {
                *current_size = current_size.saturating_sub(evicted.len());
            }
        }
        *current_size += data_size;

        while *current_size > self.max_size {
            if let Some((_, evicted_data)) = cache.pop_lru() {
                *current_size = current_size.saturating_sub(evicted_data.len());
            } else {
                break;
            }
        }
    }

    /// Remove a tile, returning the cached data if it existed.
    pub async fn remove(&self, key: &TileKey) -> Option<Bytes> {
        let mut cache = self.cache.write().await;
        let mut current_size = self.current_size.write().await;

        let data = cache.pop(key)?;
        *current_size = current_size.saturating_sub(data.len());
        Some(data)
    }

    /// Clear all entries from the cache.
    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        let mut current_size = self.current_size.write().await;
        cache.clear();
        *current_size = 0;
    }

    /// Current number of cached tiles.
    pub async fn len(&self) -> usize {
        let cache = self.cache.read().await;
        cache.len()
    }

    pub async fn is_empty(&self) -> bool {
        let cache = self.cache.read().await;
        cache.is_empty()
    }

    /// Current total size of cached tiles in bytes.
    pub async fn size(&self) -> usize {
        let current_size = self.current_size.read().await;
        *current_size
    }

    /// Maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
