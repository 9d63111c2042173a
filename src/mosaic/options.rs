use crate::error::StitchError;
use crate::pixels::{ChannelImage, IllumStats};

/// Parameters of a stitching call.
///
/// For mosaics `dx`/`dy` are the overlap of neighbouring images in pixels;
/// for collages they are the width/height of the spacers between cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StitchOptions {
    dx: u32,
    dy: u32,
    stats: Option<IllumStats>,
    align: bool,
}

impl StitchOptions {
    /// Offsets must be non-negative.
    pub fn new(dx: i64, dy: i64) -> Result<Self, StitchError> {
        let dx = u32::try_from(dx).map_err(|_| {
            StitchError::InvalidArgument(format!("dx must be a non-negative integer, got {dx}"))
        })?;
        let dy = u32::try_from(dy).map_err(|_| {
            StitchError::InvalidArgument(format!("dy must be a non-negative integer, got {dy}"))
        })?;
        Ok(Self {
            dx,
            dy,
            stats: None,
            align: false,
        })
    }

    /// Correct every image for illumination artifacts before joining.
    pub fn with_stats(mut self, stats: IllumStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Apply each image's recorded shift (uncropped) before joining.
    pub fn with_alignment(mut self, align: bool) -> Self {
        self.align = align;
        self
    }

    pub fn dx(&self) -> u32 {
        self.dx
    }

    pub fn dy(&self) -> u32 {
        self.dy
    }

    pub fn stats(&self) -> Option<&IllumStats> {
        self.stats.as_ref()
    }

    pub fn align(&self) -> bool {
        self.align
    }

    /// Apply correction and alignment to one image.
    pub(crate) fn prepare(&self, image: &ChannelImage) -> Result<ChannelImage, StitchError> {
        let image = match &self.stats {
            Some(stats) => image.corrected(stats)?,
            None => image.clone(),
        };
        Ok(if self.align { image.aligned() } else { image })
    }
}
