//! Illumination correction and cycle alignment applied before stitching.

use serde::{Deserialize, Serialize};

use super::plane::{Plane, PixelPlane};
use crate::error::StitchError;

// =============================================================================
// Illumination Statistics
// =============================================================================

/// Per-pixel illumination statistics of one channel, in log10 space.
///
/// Correction standardizes each pixel against the per-pixel mean and
/// standard deviation and then rescales with the plane-wide averages:
///
/// ```text
/// corrected = 10 ^ ((log10(v) - mean[x,y]) / std[x,y] * mean(std) + mean(mean))
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "IllumStatsDocument", into = "IllumStatsDocument")]
pub struct IllumStats {
    mean: Plane<f32>,
    std: Plane<f32>,
    mean_of_mean: f64,
    mean_of_std: f64,
}

impl IllumStats {
    /// Build statistics from log10 mean and standard deviation planes.
    pub fn new(mean: Plane<f32>, std: Plane<f32>) -> Result<Self, StitchError> {
        if mean.dimensions() != std.dimensions() {
            return Err(StitchError::InvalidArgument(format!(
                "mean plane is {:?} but std plane is {:?}",
                mean.dimensions(),
                std.dimensions()
            )));
        }
        let count = (mean.width() as f64 * mean.height() as f64).max(1.0);
        let mean_of_mean = mean.pixels().map(|p| p[0] as f64).sum::<f64>() / count;
        let mean_of_std = std.pixels().map(|p| p[0] as f64).sum::<f64>() / count;
        Ok(Self {
            mean,
            std,
            mean_of_mean,
            mean_of_std,
        })
    }

    /// `(width, height)` of the statistics planes.
    pub fn dimensions(&self) -> (u32, u32) {
        self.mean.dimensions()
    }

    /// Correct `plane` for illumination artifacts.
    ///
    /// Pixels with a zero standard deviation are left untouched.
    pub fn correct(&self, plane: &PixelPlane) -> Result<PixelPlane, StitchError> {
        if (plane.width(), plane.height()) != self.dimensions() {
            return Err(StitchError::InvalidArgument(format!(
                "illumination statistics are {:?} but image is {:?}",
                self.dimensions(),
                (plane.width(), plane.height())
            )));
        }
        Ok(plane.map_values(|x, y, value| {
            let std = self.std.get_pixel(x, y)[0] as f64;
            if std == 0.0 {
                return value;
            }
            let mean = self.mean.get_pixel(x, y)[0] as f64;
            let log = value.max(1.0).log10();
            let standardized = (log - mean) / std;
            10f64.powf(standardized * self.mean_of_std + self.mean_of_mean)
        }))
    }
}

/// Stored form of [`IllumStats`]: row-major planes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IllumStatsDocument {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl TryFrom<IllumStatsDocument> for IllumStats {
    type Error = StitchError;

    fn try_from(doc: IllumStatsDocument) -> Result<Self, Self::Error> {
        let (width, height) = (doc.width, doc.height);
        let plane = |values: Vec<f32>, what: &str| {
            Plane::from_raw(width, height, values).ok_or_else(|| {
                StitchError::InvalidArgument(format!(
                    "{what} plane does not hold {width}x{height} values"
                ))
            })
        };
        IllumStats::new(plane(doc.mean, "mean")?, plane(doc.std, "std")?)
    }
}

impl From<IllumStats> for IllumStatsDocument {
    fn from(stats: IllumStats) -> Self {
        let (width, height) = stats.dimensions();
        IllumStatsDocument {
            width,
            height,
            mean: stats.mean.into_raw(),
            std: stats.std.into_raw(),
        }
    }
}

// =============================================================================
// Alignment
// =============================================================================

/// Translation registering an image against the reference cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShift {
    pub x: i64,
    pub y: i64,
}

impl ImageShift {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Apply the shift without cropping: the plane keeps its size and the
    /// vacated border is zero.
    pub fn apply(&self, plane: &PixelPlane) -> PixelPlane {
        if self.x == 0 && self.y == 0 {
            return plane.clone();
        }
        plane.shifted(self.x, self.y)
    }
}
