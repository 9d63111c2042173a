//! Pyramid tile store tests.
//!
//! Tests verify:
//! - Tiles land at their group location on disk
//! - Rewriting a tile under another group leaves a single copy
//! - Cached tiles are served without touching the store

use std::sync::Arc;

use image::{GrayImage, Luma};
use tempfile::TempDir;

use tm_pipeline::diagnostics::Diagnostics;
use tm_pipeline::error::TileError;
use tm_pipeline::pixels::PixelPlane;
use tm_pipeline::store::{DatasetStore, FsStore, MemoryStore};
use tm_pipeline::tile::{tile_location, PyramidBuilder, PyramidTileStore, TileCache, TileKey};

fn tile(value: u8) -> PixelPlane {
    PixelPlane::U8(GrayImage::from_pixel(8, 8, Luma([value])))
}

#[tokio::test]
async fn test_fs_tile_put_get() {
    let dir = TempDir::new().unwrap();
    let tiles = PyramidTileStore::new(FsStore::new(dir.path()), Diagnostics::silent());

    let key = TileKey::new(1, 2, 3, 4);
    tiles.put(key, 0, &tile(42)).await.unwrap();

    let path = dir.path().join("layers/layer_001/TileGroup0/2-4-3.png");
    assert!(path.exists());

    // a fresh store has an empty cache and reads from disk
    let reopened = PyramidTileStore::new(FsStore::new(dir.path()), Diagnostics::silent());
    let plane = reopened.get_plane(&key).await.unwrap();
    assert_eq!(plane.dimensions(), (8, 8));
    assert_eq!(plane.get_pixel(7, 7)[0], 42);
    assert!(reopened.contains(&key).await.unwrap());
}

#[tokio::test]
async fn test_regrouping_removes_old_copy() {
    let dir = TempDir::new().unwrap();
    let tiles = PyramidTileStore::new(FsStore::new(dir.path()), Diagnostics::silent());
    let key = TileKey::new(0, 4, 1, 1);

    tiles.put(key, 0, &tile(1)).await.unwrap();
    tiles.put(key, 3, &tile(2)).await.unwrap();

    let store = tiles.store();
    assert!(!store.exists(&tile_location(&key, 0)).await.unwrap());
    assert!(store.exists(&tile_location(&key, 3)).await.unwrap());

    let reopened = PyramidTileStore::new(FsStore::new(dir.path()), Diagnostics::silent());
    assert_eq!(reopened.get_plane(&key).await.unwrap().get_pixel(0, 0)[0], 2);
}

#[tokio::test]
async fn test_cached_tiles_skip_store() {
    let store = Arc::new(MemoryStore::new());
    let writer = PyramidTileStore::new(store.clone(), Diagnostics::silent());
    let key = TileKey::new(0, 0, 0, 0);
    writer.put(key, 0, &tile(7)).await.unwrap();

    let reader = PyramidTileStore::with_cache(
        store.clone(),
        TileCache::with_capacity(1024 * 1024),
        Diagnostics::silent(),
    );
    let before = store.read_count();
    let first = reader.get(&key).await.unwrap();
    assert_eq!(store.read_count(), before + 1);

    let second = reader.get(&key).await.unwrap();
    assert_eq!(store.read_count(), before + 1);
    assert_eq!(first, second);
    assert_eq!(reader.cache().len().await, 1);
}

#[tokio::test]
async fn test_missing_tile() {
    let store = MemoryStore::new();
    let tiles = PyramidTileStore::new(store, Diagnostics::silent());
    let result = tiles.get(&TileKey::new(5, 0, 0, 0)).await;
    assert!(matches!(result, Err(TileError::NotFound { layer: 5, .. })));
}

#[tokio::test]
async fn test_non_u8_tiles_rejected() {
    let tiles = PyramidTileStore::new(MemoryStore::new(), Diagnostics::silent());
    let plane = PixelPlane::U16(image::ImageBuffer::from_pixel(4, 4, Luma([300u16])));
    assert!(tiles.put(TileKey::new(0, 0, 0, 0), 0, &plane).await.is_err());
}

#[tokio::test]
async fn test_builder_on_disk() {
    let dir = TempDir::new().unwrap();
    let tiles = PyramidTileStore::new(FsStore::new(dir.path()), Diagnostics::silent());
    let image = GrayImage::from_fn(600, 300, |x, _| Luma([(x % 256) as u8]));

    let layout = PyramidBuilder::new(Diagnostics::silent())
        .build(&tiles, 0, &image)
        .await
        .unwrap();
    // 150x75, 300x150, 600x300
    assert_eq!(layout.n_levels(), 3);
    assert_eq!(layout.n_tiles(), 1 + 2 + 6);

    let full = layout.max_level();
    let key = TileKey::new(0, full, 1, 2);
    let group = layout.tile_group(full, 1, 2).unwrap();
    assert!(dir.path().join(tile_location(&key, group)).exists());

    // right edge tile is cropped to the image
    let edge = tiles.get_plane(&key).await.unwrap();
    assert_eq!(edge.dimensions(), (600 - 512, 300 - 256));
}
