//! Experiment layout.
//!
//! An experiment is a directory tree in a [`DatasetStore`]:
//!
//! ```text
//! experiment.json                          manifest
//! uploads/
//!   image_mapper.json                      global file mapper (cycle coordinates)
//!   upload_000/
//!     image_files/<file>                   raw image files
//!     additional_files/<file>              vendor side files
//!     ome_xml/<file>.ome.xml               extracted per-file metadata
//!     image_metadata.ome.xml               upload metadata table
//!     image_mapper.json                    upload file mapper
//! cycles/
//!   cycle_000/
//!     cycle.json                           marker
//!     image_metadata.ome.xml               cycle metadata table
//!     images/<name>                        channel image planes (PNG)
//!     illumstats/channel_000.json          illumination statistics
//!     shifts.json                          alignment shifts
//! jobs/<stage>/run_000001.json             job descriptions
//! layers/
//!   pyramid.json                           layer index
//!   layer_000/layer.json                   layer description
//!   layer_000/TileGroup0/0-0-0.png         pyramid tiles
//! ```
//!
//! Every location is computed by a pure function of its indices; nothing
//! here touches the store except [`Experiment::load`] and the manifest
//! helpers.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diagnostics::Diagnostics;
use crate::error::StoreError;
use crate::metadata::ImageNameTemplate;
use crate::store::{join_name, read_json, write_json, DatasetStore};
use crate::tile::{layer_location, LAYERS_PREFIX};

pub const MANIFEST_FILE: &str = "experiment.json";
pub const UPLOADS_PREFIX: &str = "uploads";
pub const CYCLES_PREFIX: &str = "cycles";

const IMAGE_FILES_DIR: &str = "image_files";
const ADDITIONAL_FILES_DIR: &str = "additional_files";
const OME_XML_DIR: &str = "ome_xml";
const METADATA_FILE: &str = "image_metadata.ome.xml";
const MAPPER_FILE: &str = "image_mapper.json";

// =============================================================================
// Path Functions
// =============================================================================

pub fn upload_name(index: u32) -> String {
    format!("upload_{index:03}")
}

pub fn upload_location(index: u32) -> String {
    join_name(&[UPLOADS_PREFIX, &upload_name(index)])
}

pub fn upload_image_file(index: u32, file: &str) -> String {
    join_name(&[&upload_location(index), IMAGE_FILES_DIR, file])
}

pub fn upload_additional_file(index: u32, file: &str) -> String {
    join_name(&[&upload_location(index), ADDITIONAL_FILES_DIR, file])
}

/// Extracted metadata document of one image file.
pub fn upload_ome_xml_file(index: u32, image_file: &str) -> String {
    join_name(&[
        &upload_location(index),
        OME_XML_DIR,
        &format!("{image_file}.ome.xml"),
    ])
}

pub fn upload_metadata_file(index: u32) -> String {
    join_name(&[&upload_location(index), METADATA_FILE])
}

pub fn upload_mapper_file(index: u32) -> String {
    join_name(&[&upload_location(index), MAPPER_FILE])
}

/// Mapper of every upload's planes to cycle images.
pub fn global_mapper_file() -> String {
    join_name(&[UPLOADS_PREFIX, MAPPER_FILE])
}

pub fn cycle_name(index: u32) -> String {
    format!("cycle_{index:03}")
}

pub fn cycle_location(index: u32) -> String {
    join_name(&[CYCLES_PREFIX, &cycle_name(index)])
}

pub fn cycle_marker_file(index: u32) -> String {
    join_name(&[&cycle_location(index), "cycle.json"])
}

pub fn cycle_metadata_file(index: u32) -> String {
    join_name(&[&cycle_location(index), METADATA_FILE])
}

pub fn cycle_image_file(index: u32, image_name: &str) -> String {
    join_name(&[&cycle_location(index), "images", image_name])
}

pub fn illumstats_file(cycle: u32, channel: u32) -> String {
    join_name(&[
        &cycle_location(cycle),
        "illumstats",
        &format!("channel_{channel:03}.json"),
    ])
}

pub fn shifts_file(cycle: u32) -> String {
    join_name(&[&cycle_location(cycle), "shifts.json"])
}

pub fn layer_metadata_file(layer: u32) -> String {
    join_name(&[&layer_location(layer), "layer.json"])
}

pub fn pyramid_index_file() -> String {
    join_name(&[LAYERS_PREFIX, "pyramid.json"])
}

/// Upload index encoded in an `upload_NNN` name.
pub fn parse_upload_name(name: &str) -> Option<u32> {
    name.strip_prefix("upload_")?.parse().ok()
}

/// Cycle index encoded in a `cycle_NNN` name.
pub fn parse_cycle_name(name: &str) -> Option<u32> {
    name.strip_prefix("cycle_")?.parse().ok()
}

// =============================================================================
// Manifest
// =============================================================================

/// Contents of `experiment.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentManifest {
    pub name: String,

    #[serde(default)]
    pub image_name_template: ImageNameTemplate,
}

impl ExperimentManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image_name_template: ImageNameTemplate::default(),
        }
    }

    pub async fn read<S: DatasetStore + ?Sized>(store: &S) -> Result<Self, StoreError> {
        read_json(store, MANIFEST_FILE).await
    }

    pub async fn write<S: DatasetStore + ?Sized>(&self, store: &S) -> Result<(), StoreError> {
        write_json(store, MANIFEST_FILE, self).await
    }
}

/// Contents of a cycle marker dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleMarker {
    pub index: u32,
    /// Timepoint the cycle was created for
    pub tpoint: u32,
}

// =============================================================================
// Experiment
// =============================================================================

/// One ingested batch of image files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub index: u32,
    pub name: String,
    /// Image file names, relative to the upload's image directory
    pub image_files: Vec<String>,
    /// Side file names, relative to the upload's additional directory
    pub additional_files: Vec<String>,
}

impl Upload {
    pub fn image_file(&self, file: &str) -> String {
        upload_image_file(self.index, file)
    }

    pub fn additional_file(&self, file: &str) -> String {
        upload_additional_file(self.index, file)
    }

    pub fn ome_xml_file(&self, image_file: &str) -> String {
        upload_ome_xml_file(self.index, image_file)
    }

    pub fn metadata_file(&self) -> String {
        upload_metadata_file(self.index)
    }

    pub fn mapper_file(&self) -> String {
        upload_mapper_file(self.index)
    }
}

/// A reconciled acquisition round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    pub index: u32,
    pub tpoint: u32,
}

impl Cycle {
    pub fn name(&self) -> String {
        cycle_name(self.index)
    }

    pub fn metadata_file(&self) -> String {
        cycle_metadata_file(self.index)
    }

    pub fn image_file(&self, image_name: &str) -> String {
        cycle_image_file(self.index, image_name)
    }
}

/// Experiment state as found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    pub name: String,
    pub image_name_template: ImageNameTemplate,
    /// Ordered by index
    pub uploads: Vec<Upload>,
    /// Ordered by index
    pub cycles: Vec<Cycle>,
}

impl Experiment {
    /// Read the manifest and discover uploads and cycles by listing the store.
    pub async fn load<S: DatasetStore + ?Sized>(
        store: &S,
        diagnostics: &Diagnostics,
    ) -> Result<Self, StoreError> {
        let manifest = ExperimentManifest::read(store).await?;

        let uploads = Self::discover_uploads(store).await?;
        let cycles = Self::discover_cycles(store).await?;
        diagnostics.in_scope(|| {
            debug!(
                experiment = %manifest.name,
                store = store.identifier(),
                uploads = uploads.len(),
                cycles = cycles.len(),
                "Loaded experiment"
            )
        });

        Ok(Self {
            name: manifest.name,
            image_name_template: manifest.image_name_template,
            uploads,
            cycles,
        })
    }

    pub fn upload(&self, index: u32) -> Option<&Upload> {
        self.uploads.iter().find(|u| u.index == index)
    }

    pub fn cycle(&self, index: u32) -> Option<&Cycle> {
        self.cycles.iter().find(|c| c.index == index)
    }

    async fn discover_uploads<S: DatasetStore + ?Sized>(
        store: &S,
    ) -> Result<Vec<Upload>, StoreError> {
        let pattern = static_pattern(r"upload_\d+/(image_files|additional_files)/[^/]+")?;
        let names = store.list(UPLOADS_PREFIX, &pattern).await?;

        let mut uploads: Vec<Upload> = Vec::new();
        for name in names {
            let mut parts = name.splitn(3, '/');
            let (Some(upload), Some(kind), Some(file)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Some(index) = parse_upload_name(upload) else {
                continue;
            };
            let position = match uploads.iter().position(|u| u.index == index) {
                Some(position) => position,
                None => {
                    uploads.push(Upload {
                        index,
                        name: upload_name(index),
                        image_files: Vec::new(),
                        additional_files: Vec::new(),
                    });
                    uploads.len() - 1
                }
            };
            let target = &mut uploads[position];
            if kind == IMAGE_FILES_DIR {
                target.image_files.push(file.to_string());
            } else {
                target.additional_files.push(file.to_string());
            }
        }
        uploads.sort_by_key(|u| u.index);
        Ok(uploads)
    }

    async fn discover_cycles<S: DatasetStore + ?Sized>(store: &S) -> Result<Vec<Cycle>, StoreError> {
        let pattern = static_pattern(r"cycle_\d+/cycle\.json")?;
        let names = store.list(CYCLES_PREFIX, &pattern).await?;

        let mut cycles = Vec::with_capacity(names.len());
        for name in names {
            let marker: CycleMarker = read_json(store, &join_name(&[CYCLES_PREFIX, &name])).await?;
            cycles.push(Cycle {
                index: marker.index,
                tpoint: marker.tpoint,
            });
        }
        cycles.sort_by_key(|c| c.index);
        Ok(cycles)
    }
}

fn static_pattern(pattern: &str) -> Result<Regex, StoreError> {
    Regex::new(pattern).map_err(|e| StoreError::InvalidName(e.to_string()))
}
