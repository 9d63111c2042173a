use serde::{Deserialize, Serialize};

use super::correction::{IllumStats, ImageShift};
use super::plane::PixelPlane;
use crate::error::StitchError;

/// Addressing metadata of a reconciled channel image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelImageMetadata {
    /// Canonical image name
    pub name: String,
    pub cycle: u32,
    pub channel: u32,
    pub channel_name: String,
    pub well: String,
    /// Zero-based grid row within the well
    pub y: u32,
    /// Zero-based grid column within the well
    pub x: u32,
    pub tpoint: u32,
    pub zplane: u32,
    /// Registration against the reference cycle, if computed
    #[serde(default)]
    pub shift: Option<ImageShift>,
}

/// A single-channel image plane together with its addressing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelImage {
    pub plane: PixelPlane,
    pub metadata: ChannelImageMetadata,
}

impl ChannelImage {
    pub fn new(plane: PixelPlane, metadata: ChannelImageMetadata) -> Self {
        Self { plane, metadata }
    }

    /// Illumination-corrected copy.
    pub fn corrected(&self, stats: &IllumStats) -> Result<ChannelImage, StitchError> {
        Ok(ChannelImage {
            plane: stats.correct(&self.plane)?,
            metadata: self.metadata.clone(),
        })
    }

    /// Copy shifted by the recorded alignment; unchanged without one.
    pub fn aligned(&self) -> ChannelImage {
        let plane = match &self.metadata.shift {
            Some(shift) => shift.apply(&self.plane),
            None => self.plane.clone(),
        };
        ChannelImage {
            plane,
            metadata: self.metadata.clone(),
        }
    }
}
