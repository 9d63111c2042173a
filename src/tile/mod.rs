//! Pyramid tile layer.
//!
//! Stores 8-bit channel layers as Zoomify-style tile pyramids.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             PyramidBuilder              │
//! │   (level resampling, tile cutting,      │
//! │    group assignment)                    │
//! └────────────────────┬────────────────────┘
//!                      │ put / get
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │            PyramidTileStore             │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  TileCache   │  │  PNG Encoder    │  │
//! │  │  (encoded    │  │  (lossless,     │  │
//! │  │   tiles)     │  │   uint8 only)   │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │              DatasetStore               │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`PyramidTileStore`]: tile put/get keyed by [`TileKey`], one group per key
//! - [`TileCache`]: LRU cache for encoded tiles with size-based eviction
//! - [`PngTileEncoder`]: lossless PNG encoding of 8-bit tile planes
//! - [`PyramidBuilder`] / [`PyramidLayout`]: level geometry and tile cutting
//! - [`tile_location`]: pure mapping from key and group to dataset name

mod cache;
mod encoder;
mod pyramid;
mod store;

pub use cache::{TileCache, DEFAULT_TILE_CACHE_CAPACITY};
pub use encoder::{PngTileEncoder, TileCompression};
pub use pyramid::{PyramidBuilder, PyramidLayout, PyramidLevel, DEFAULT_TILE_SIZE, TILES_PER_GROUP};
pub use store::{layer_location, tile_location, PyramidTileStore, TileKey, LAYERS_PREFIX};
