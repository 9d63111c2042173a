//! Test utilities for integration tests.
//!
//! Builds small experiments on disk (in a temporary directory) from
//! synthetic image planes and metadata documents.

use std::sync::Arc;

use bytes::Bytes;
use image::Luma;
use tempfile::TempDir;

use tm_pipeline::diagnostics::Diagnostics;
use tm_pipeline::experiment::{
    upload_additional_file, upload_image_file, upload_ome_xml_file, ExperimentManifest,
};
use tm_pipeline::metadata::{
    render_metadata, ImageRecord, MetadataTable, PixelInfo, SourceRef, StagePosition,
};
use tm_pipeline::pixels::{
    encode_png, ChannelImage, ChannelImageMetadata, PixelPlane, PixelType, Plane,
};
use tm_pipeline::store::{DatasetStore, FsStore};

// =============================================================================
// Planes and Images
// =============================================================================

/// A constant uint16 plane.
pub fn uint16_plane(width: u32, height: u32, value: u16) -> PixelPlane {
    PixelPlane::U16(Plane::from_pixel(width, height, Luma([value])))
}

/// A uint16 plane whose pixels encode their own coordinates.
pub fn gradient_plane(width: u32, height: u32) -> PixelPlane {
    PixelPlane::U16(Plane::from_fn(width, height, |x, y| {
        Luma([(y * width + x) as u16])
    }))
}

/// A channel image at grid position (`y`, `x`) of `well`.
pub fn channel_image(plane: PixelPlane, well: &str, y: u32, x: u32) -> ChannelImage {
    ChannelImage::new(
        plane,
        ChannelImageMetadata {
            name: format!("{well}_y{y}_x{x}.png"),
            cycle: 0,
            channel: 0,
            channel_name: "DAPI".to_string(),
            well: well.to_string(),
            y,
            x,
            tpoint: 0,
            zplane: 0,
            shift: None,
        },
    )
}

// =============================================================================
// Embedded Metadata
// =============================================================================

/// Builder for the embedded metadata of one image file.
#[derive(Debug, Clone)]
pub struct EmbeddedImage {
    pub record: ImageRecord,
}

impl EmbeddedImage {
    /// A record with pixel info only; everything else is left to handlers
    /// and patterns.
    pub fn new(width: u32, height: u32) -> Self {
        let mut record = ImageRecord::new(SourceRef {
            files: Vec::new(),
            series: 0,
            planes: vec![0],
        });
        record.pixels = Some(PixelInfo {
            pixel_type: PixelType::U16,
            width,
            height,
        });
        Self { record }
    }

    pub fn well(mut self, well: &str) -> Self {
        self.record.well = Some(well.to_string());
        self
    }

    pub fn channel(mut self, name: &str) -> Self {
        self.record.channel_name = Some(name.to_string());
        self
    }

    pub fn tpoint(mut self, tpoint: u32) -> Self {
        self.record.tpoint = Some(tpoint);
        self
    }

    pub fn zplane(mut self, zplane: u32) -> Self {
        self.record.zplane = Some(zplane);
        self
    }

    pub fn site(mut self, site: u32) -> Self {
        self.record.site = Some(site);
        self
    }

    pub fn stage(mut self, x: f64, y: f64) -> Self {
        self.record.stage = Some(StagePosition::new(x, y));
        self
    }

    /// Complete record: well, channel, plane 0 and timepoint.
    pub fn complete(width: u32, height: u32, well: &str, channel: &str, tpoint: u32) -> Self {
        Self::new(width, height)
            .well(well)
            .channel(channel)
            .zplane(0)
            .tpoint(tpoint)
    }

    pub fn document(&self) -> String {
        let mut table = MetadataTable::new();
        table.push(self.record.clone());
        render_metadata(&table)
    }
}

// =============================================================================
// Experiment on Disk
// =============================================================================

/// An experiment rooted in a temporary directory.
pub struct TestExperiment {
    pub dir: TempDir,
    pub store: Arc<FsStore>,
}

impl TestExperiment {
    pub async fn new(name: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsStore::new(dir.path()));
        ExperimentManifest::new(name)
            .write(store.as_ref())
            .await
            .unwrap();
        Self { dir, store }
    }

    /// Add an image file with its pixels and extracted metadata document.
    pub async fn add_image(
        &self,
        upload: u32,
        file: &str,
        plane: &PixelPlane,
        embedded: &EmbeddedImage,
    ) {
        let name = upload_image_file(upload, file);
        self.store
            .write(&name, encode_png(&name, plane).unwrap())
            .await
            .unwrap();
        self.store
            .write(
                &upload_ome_xml_file(upload, file),
                Bytes::from(embedded.document()),
            )
            .await
            .unwrap();
    }

    pub async fn add_side_file(&self, upload: u32, file: &str, content: &str) {
        self.store
            .write(
                &upload_additional_file(upload, file),
                Bytes::from(content.to_string()),
            )
            .await
            .unwrap();
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::silent()
    }
}
