//! Pyramid tile storage.
//!
//! Tiles are addressed logically by `(layer, level, row, column)`. The
//! physical location additionally carries a tile group, a locality bucket
//! that keeps directories small:
//!
//! ```text
//! layers/layer_000/TileGroup0/0-0-0.png
//!                  TileGroup0/1-0-0.png
//!                  ...
//!                  TileGroup1/8-12-3.png     level 8, column 12, row 3
//! ```
//!
//! A key lives under exactly one group. Writing it under a new group removes
//! the copies under every other group once the new write succeeded.
//!
//! The store keeps a key to group index per layer. A layer is listed once, on
//! first access, and the index is maintained by `put` afterwards. Writers
//! outside this store are not observed once a layer is indexed.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use image::GrayImage;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::cache::TileCache;
use super::encoder::PngTileEncoder;
use crate::diagnostics::Diagnostics;
use crate::error::{StoreError, TileError};
use crate::pixels::PixelPlane;
use crate::store::{join_name, DatasetStore};

/// Dataset prefix shared by all pyramid layers.
pub const LAYERS_PREFIX: &str = "layers";

// =============================================================================
// Tile Key
// =============================================================================

/// Logical address of a pyramid tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    /// Channel layer index
    pub layer: u32,

    /// Zoom level (0 = single tile, highest = full resolution)
    pub level: u32,

    pub row: u32,

    pub column: u32,
}

impl TileKey {
    pub fn new(layer: u32, level: u32, row: u32, column: u32) -> Self {
        Self {
            layer,
            level,
            row,
            column,
        }
    }

    /// File name of the tile inside its group directory.
    pub fn file_name(&self) -> String {
        format!("{}-{}-{}.png", self.level, self.column, self.row)
    }

    fn not_found(&self) -> TileError {
        TileError::NotFound {
            layer: self.layer,
            level: self.level,
            row: self.row,
            column: self.column,
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "layer {} level {} ({}, {})",
            self.layer, self.level, self.row, self.column
        )
    }
}

// =============================================================================
// Path Functions
// =============================================================================

/// Dataset prefix of one channel layer.
pub fn layer_location(layer: u32) -> String {
    join_name(&[LAYERS_PREFIX, &format!("layer_{layer:03}")])
}

/// Dataset name of a tile stored under `group`.
pub fn tile_location(key: &TileKey, group: u32) -> String {
    join_name(&[
        &layer_location(key.layer),
        &format!("TileGroup{group}"),
        &key.file_name(),
    ])
}

/// Pattern matching every tile of a layer, relative to its layer prefix.
fn layer_tile_pattern() -> Result<Regex, StoreError> {
    Regex::new(r"TileGroup(\d+)/(\d+)-(\d+)-(\d+)\.png")
        .map_err(|e| StoreError::InvalidName(e.to_string()))
}

/// Parse a layer-relative tile name into its key and group.
fn parse_tile_name(pattern: &Regex, layer: u32, name: &str) -> Option<(TileKey, u32)> {
    let caps = pattern.captures(name)?;
    let field = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();
    let key = TileKey::new(layer, field(2)?, field(4)?, field(3)?);
    Some((key, field(1)?))
}

/// Groups holding each tile, for every layer indexed so far.
type LayerIndex = HashMap<TileKey, Vec<u32>>;

// =============================================================================
// Tile Store
// =============================================================================

/// Reads and writes pyramid tiles through a dataset store.
///
/// Encoded tiles are kept in an LRU [`TileCache`] in front of the store.
pub struct PyramidTileStore<S> {
    store: S,
    cache: TileCache,
    encoder: PngTileEncoder,
    groups: Mutex<HashMap<u32, LayerIndex>>,
    diagnostics: Diagnostics,
}

impl<S: DatasetStore> PyramidTileStore<S> {
    pub fn new(store: S, diagnostics: Diagnostics) -> Self {
        Self::with_cache(store, TileCache::new(), diagnostics)
    }

    pub fn with_cache(store: S, cache: TileCache, diagnostics: Diagnostics) -> Self {
        Self {
            store,
            cache,
            encoder: PngTileEncoder::new(),
            groups: Mutex::new(HashMap::new()),
            diagnostics,
        }
    }

    /// Replace the tile encoder.
    pub fn with_encoder(mut self, encoder: PngTileEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    /// Store one tile under `group`.
    ///
    /// The plane must be 8-bit. After the write, copies of the same key under
    /// any other group are deleted.
    pub async fn put(&self, key: TileKey, group: u32, plane: &PixelPlane) -> Result<(), TileError> {
        let data = self.encoder.encode(plane)?;
        let location = tile_location(&key, group);
        self.store.write(&location, data.clone()).await?;

        let previous = {
            let mut groups = self.groups.lock().await;
            let index = self.layer_index(&mut groups, key.layer).await?;
            index.insert(key, vec![group]).unwrap_or_default()
        };
        for stale in previous.into_iter().filter(|&g| g != group) {
            let name = tile_location(&key, stale);
            self.diagnostics.in_scope(|| {
                debug!(tile = %key, stale = %name, "Removing tile copy under other group")
            });
            self.store.remove(&name).await?;
        }

        self.cache.put(key, data).await;
        Ok(())
    }

    /// Encoded PNG bytes of a tile.
    pub async fn get(&self, key: &TileKey) -> Result<Bytes, TileError> {
        if let Some(data) = self.cache.get(key).await {
            return Ok(data);
        }

        let mut found = self.locate(key).await?;
        if found.len() > 1 {
            self.diagnostics.in_scope(|| {
                warn!(tile = %key, copies = found.len(), "Tile stored under several groups")
            });
        }
        let Some(group) = found.pop() else {
            return Err(key.not_found());
        };

        let name = tile_location(key, group);
        let data = self.store.read(&name).await?;
        self.cache.put(*key, data.clone()).await;
        Ok(data)
    }

    /// Decoded pixels of a tile.
    pub async fn get_plane(&self, key: &TileKey) -> Result<GrayImage, TileError> {
        let data = self.get(key).await?;
        self.encoder.decode(&data)
    }

    /// Whether the tile has been written under any group.
    pub async fn contains(&self, key: &TileKey) -> Result<bool, TileError> {
        if self.cache.contains(key).await {
            return Ok(true);
        }
        Ok(!self.locate(key).await?.is_empty())
    }

    /// Groups holding `key`, in ascending order.
    async fn locate(&self, key: &TileKey) -> Result<Vec<u32>, TileError> {
        let mut groups = self.groups.lock().await;
        let index = self.layer_index(&mut groups, key.layer).await?;
        Ok(index.get(key).cloned().unwrap_or_default())
    }

    /// Index of `layer`, listing the layer once if it is not indexed yet.
    async fn layer_index<'a>(
        &self,
        groups: &'a mut HashMap<u32, LayerIndex>,
        layer: u32,
    ) -> Result<&'a mut LayerIndex, TileError> {
        if !groups.contains_key(&layer) {
            let pattern = layer_tile_pattern()?;
            let names = self.store.list(&layer_location(layer), &pattern).await?;
            let mut index = LayerIndex::new();
            for name in &names {
                if let Some((key, group)) = parse_tile_name(&pattern, layer, name) {
                    index.entry(key).or_default().push(group);
                }
            }
            for found in index.values_mut() {
                found.sort_unstable();
            }
            self.diagnostics.in_scope(|| {
                debug!(layer, tiles = index.len(), "Indexed tile groups of layer")
            });
            groups.insert(layer, index);
        }
        Ok(groups.entry(layer).or_default())
    }
}
