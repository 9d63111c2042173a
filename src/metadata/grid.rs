//! Acquisition grid positions.
//!
//! Two strategies assign each image a zero-based (row, column) within its
//! well, tried in order:
//!
//! 1. **Stage positions**: images are clustered by (well, channel, timepoint)
//!    and the distinct stage Y and X values of a cluster are ranked into rows
//!    and columns. This is all-or-nothing: a single image without a stage
//!    position rules the strategy out for the whole table.
//! 2. **Declared layout**: images of each (well, channel, timepoint, plane)
//!    cluster are enumerated in acquisition order and placed according to a
//!    [`StitchLayout`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::diagnostics::Diagnostics;
use crate::error::MetadataError;

use super::table::{GridPosition, ImageRecord, MetadataTable};

/// Stage coordinates closer than this (in stage units) are the same position.
pub const DEFAULT_STAGE_TOLERANCE: f64 = 0.5;

// =============================================================================
// Stitch Layout
// =============================================================================

/// Axis along which consecutive acquisitions advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MajorAxis {
    /// Fill a row before moving to the next one
    #[default]
    Row,
    /// Fill a column before moving to the next one
    Column,
}

/// Order in which consecutive rows (or columns) are traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Traversal {
    /// Every line in the same direction
    #[default]
    Raster,
    /// Alternate direction on every line
    Serpentine,
}

impl FromStr for MajorAxis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "row" | "horizontal" => Ok(MajorAxis::Row),
            "column" | "vertical" => Ok(MajorAxis::Column),
            other => Err(format!("unknown major axis '{other}' (expected row or column)")),
        }
    }
}

impl FromStr for Traversal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raster" => Ok(Traversal::Raster),
            "serpentine" | "zigzag" => Ok(Traversal::Serpentine),
            other => Err(format!(
                "unknown traversal '{other}' (expected raster or serpentine)"
            )),
        }
    }
}

impl fmt::Display for MajorAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MajorAxis::Row => "row",
            MajorAxis::Column => "column",
        })
    }
}

impl fmt::Display for Traversal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Traversal::Raster => "raster",
            Traversal::Serpentine => "serpentine",
        })
    }
}

/// Declared shape of the acquisition grid within a well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StitchLayout {
    pub rows: u32,
    pub columns: u32,
    pub major_axis: MajorAxis,
    pub traversal: Traversal,
}

impl StitchLayout {
    pub fn new(
        rows: u32,
        columns: u32,
        major_axis: MajorAxis,
        traversal: Traversal,
    ) -> Result<Self, MetadataError> {
        if rows == 0 || columns == 0 {
            return Err(MetadataError::InvalidLayout(format!(
                "grid must have at least one row and column, got {rows}x{columns}"
            )));
        }
        Ok(Self {
            rows,
            columns,
            major_axis,
            traversal,
        })
    }

    /// Number of grid cells.
    pub fn cells(&self) -> u32 {
        self.rows * self.columns
    }

    /// Grid position of the `index`-th acquisition, `None` past the last cell.
    pub fn position(&self, index: u32) -> Option<GridPosition> {
        if index >= self.cells() {
            return None;
        }
        let (line_length, line_count) = match self.major_axis {
            MajorAxis::Row => (self.columns, self.rows),
            MajorAxis::Column => (self.rows, self.columns),
        };
        let line = index / line_length;
        let mut offset = index % line_length;
        debug_assert!(line < line_count);
        if self.traversal == Traversal::Serpentine && line % 2 == 1 {
            offset = line_length - 1 - offset;
        }
        Some(match self.major_axis {
            MajorAxis::Row => GridPosition::new(line, offset),
            MajorAxis::Column => GridPosition::new(offset, line),
        })
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Assigns grid positions to the records of a metadata table.
#[derive(Debug, Clone)]
pub struct GridResolver {
    tolerance: f64,
    diagnostics: Diagnostics,
}

impl GridResolver {
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self {
            tolerance: DEFAULT_STAGE_TOLERANCE,
            diagnostics,
        }
    }

    /// Use a different stage position tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance.abs();
        self
    }

    /// Resolve grid positions, preferring stage positions and falling back
    /// to `layout` when they are unusable.
    pub fn resolve(
        &self,
        table: &MetadataTable,
        layout: Option<&StitchLayout>,
    ) -> Result<MetadataTable, MetadataError> {
        match self.from_stage_positions(table) {
            Ok(resolved) => Ok(resolved),
            Err(err) => match layout {
                Some(layout) => {
                    self.diagnostics.in_scope(|| {
                        warn!(
                            reason = %err,
                            rows = layout.rows,
                            columns = layout.columns,
                            "Stage positions unusable, falling back to stitch layout"
                        )
                    });
                    self.from_layout(table, layout)
                }
                None => Err(err),
            },
        }
    }

    /// Assign positions by ranking distinct stage coordinates.
    pub fn from_stage_positions(
        &self,
        table: &MetadataTable,
    ) -> Result<MetadataTable, MetadataError> {
        if let Some(record) = table.iter().find(|r| r.stage.is_none()) {
            return Err(MetadataError::StagePositions(format!(
                "image {} has no stage position",
                record.id
            )));
        }

        let mut resolved = table.clone();
        for (key, members) in clusters(table, |r| {
            (r.well.clone(), r.channel_name.clone(), r.channel, r.tpoint)
        }) {
            let stages: Vec<_> = members.iter().filter_map(|&i| table.images[i].stage).collect();
            let ys: Vec<f64> = stages.iter().map(|s| s.y).collect();
            let xs: Vec<f64> = stages.iter().map(|s| s.x).collect();
            let rows = distinct_values(&ys, self.tolerance);
            let columns = distinct_values(&xs, self.tolerance);

            let sites = distinct_sites(table, &members);
            if sites > 1 && rows.len() * columns.len() < 2 {
                return Err(MetadataError::StagePositions(format!(
                    "{} sites of well {} share a single stage position",
                    sites,
                    key.0.as_deref().unwrap_or("?")
                )));
            }

            let mut taken: BTreeMap<(GridPosition, Option<u32>), Option<u32>> = BTreeMap::new();
            for &i in &members {
                let record = &table.images[i];
                let Some(stage) = record.stage else {
                    continue;
                };
                let position = GridPosition::new(
                    rank(&rows, stage.y, self.tolerance),
                    rank(&columns, stage.x, self.tolerance),
                );
                if let Some(other_site) = taken.insert((position, record.zplane), record.site) {
                    if other_site != record.site || record.site.is_none() {
                        return Err(MetadataError::StagePositions(format!(
                            "images of different sites map to grid position ({}, {}) in well {}",
                            position.row,
                            position.column,
                            key.0.as_deref().unwrap_or("?")
                        )));
                    }
                }
                resolved.images[i].grid = Some(position);
            }
        }

        self.diagnostics
            .in_scope(|| debug!(images = table.len(), "Resolved grid from stage positions"));
        Ok(resolved)
    }

    /// Assign positions from a declared layout, in acquisition order.
    pub fn from_layout(
        &self,
        table: &MetadataTable,
        layout: &StitchLayout,
    ) -> Result<MetadataTable, MetadataError> {
        let mut resolved = table.clone();
        for (key, mut members) in clusters(table, |r| {
            (r.well.clone(), r.channel_name.clone(), r.channel, r.tpoint, r.zplane)
        }) {
            if members.len() > layout.cells() as usize {
                return Err(MetadataError::InvalidLayout(format!(
                    "{} images in well {} do not fit a {}x{} grid",
                    members.len(),
                    key.0.as_deref().unwrap_or("?"),
                    layout.rows,
                    layout.columns
                )));
            }
            members.sort_by_key(|&i| (table.images[i].site, i));
            for (index, &i) in members.iter().enumerate() {
                resolved.images[i].grid = layout.position(index as u32);
            }
        }

        self.diagnostics.in_scope(|| {
            debug!(
                images = table.len(),
                rows = layout.rows,
                columns = layout.columns,
                major_axis = %layout.major_axis,
                traversal = %layout.traversal,
                "Resolved grid from stitch layout"
            )
        });
        Ok(resolved)
    }
}

/// Group record indices by `key`, in key order.
fn clusters<K: Ord>(
    table: &MetadataTable,
    key: impl Fn(&ImageRecord) -> K,
) -> BTreeMap<K, Vec<usize>> {
    let mut clusters: BTreeMap<K, Vec<usize>> = BTreeMap::new();
    for (i, record) in table.iter().enumerate() {
        clusters.entry(key(record)).or_default().push(i);
    }
    clusters
}

/// Sorted representatives of `values`, merging values within `tolerance`.
fn distinct_values(values: &[f64], tolerance: f64) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    let mut distinct: Vec<f64> = Vec::new();
    for value in sorted {
        match distinct.last() {
            Some(last) if value - last <= tolerance => {}
            _ => distinct.push(value),
        }
    }
    distinct
}

/// Index of the representative `value` belongs to.
fn rank(distinct: &[f64], value: f64, tolerance: f64) -> u32 {
    distinct
        .iter()
        .rposition(|&d| value >= d - tolerance)
        .unwrap_or(0) as u32
}

fn distinct_sites(table: &MetadataTable, members: &[usize]) -> usize {
    let mut sites = BTreeSet::new();
    let mut unnamed = 0;
    for &i in members {
        match table.images[i].site {
            Some(site) => {
                sites.insert(site);
            }
            None => unnamed += 1,
        }
    }
    sites.len() + unnamed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{SourceRef, StagePosition};

    fn record(site: u32, x: Option<f64>, y: Option<f64>) -> ImageRecord {
        let mut r = ImageRecord::new(SourceRef::new(format!("s{site}.tif"), 0, 0));
        r.well = Some("A01".to_string());
        r.site = Some(site);
        r.channel = Some(0);
        r.channel_name = Some("DAPI".to_string());
        r.tpoint = Some(0);
        r.zplane = Some(0);
        r.stage = x.zip(y).map(|(x, y)| StagePosition::new(x, y));
        r
    }

    fn table(records: Vec<ImageRecord>) -> MetadataTable {
        let mut table = MetadataTable::new();
        for r in records {
            table.push(r);
        }
        table
    }

    fn resolver() -> GridResolver {
        GridResolver::new(Diagnostics::silent())
    }

    fn grid(table: &MetadataTable) -> Vec<(u32, u32)> {
        table
            .iter()
            .map(|r| r.grid.map(|g| (g.row, g.column)).unwrap())
            .collect()
    }

    #[test]
    fn test_stage_positions_ranked() {
        let t = table(vec![
            record(0, Some(100.0), Some(50.0)),
            record(1, Some(-200.0), Some(50.2)),
            record(2, Some(100.3), Some(-10.0)),
            record(3, Some(-200.0), Some(-10.0)),
        ]);
        let resolved = resolver().from_stage_positions(&t).unwrap();
        assert_eq!(grid(&resolved), vec![(1, 1), (1, 0), (0, 1), (0, 0)]);
    }

    #[test]
    fn test_stage_positions_deterministic() {
        let t = table(vec![
            record(0, Some(0.0), Some(0.0)),
            record(1, Some(10.0), Some(0.0)),
            record(2, Some(20.0), Some(0.0)),
        ]);
        let first = resolver().from_stage_positions(&t).unwrap();
        for _ in 0..5 {
            assert_eq!(resolver().from_stage_positions(&t).unwrap(), first);
        }
    }

    #[test]
    fn test_partial_stage_positions_rule_out_strategy() {
        let t = table(vec![record(0, Some(0.0), Some(0.0)), record(1, None, None)]);
        assert!(matches!(
            resolver().from_stage_positions(&t),
            Err(MetadataError::StagePositions(_))
        ));
    }

    #[test]
    fn test_single_position_for_many_sites_fails() {
        let t = table(vec![
            record(0, Some(5.0), Some(5.0)),
            record(1, Some(5.0), Some(5.0)),
        ]);
        assert!(matches!(
            resolver().from_stage_positions(&t),
            Err(MetadataError::StagePositions(_))
        ));
    }

    #[test]
    fn test_fallback_to_layout() {
        let t = table(vec![
            record(0, None, None),
            record(1, None, None),
            record(2, None, None),
            record(3, None, None),
        ]);
        let layout = StitchLayout::new(2, 2, MajorAxis::Row, Traversal::Serpentine).unwrap();
        let resolved = resolver().resolve(&t, Some(&layout)).unwrap();
        assert_eq!(grid(&resolved), vec![(0, 0), (0, 1), (1, 1), (1, 0)]);

        assert!(resolver().resolve(&t, None).is_err());
    }

    #[test]
    fn test_layout_positions() {
        let raster = StitchLayout::new(2, 3, MajorAxis::Row, Traversal::Raster).unwrap();
        assert_eq!(raster.position(4), Some(GridPosition::new(1, 1)));
        assert_eq!(raster.position(6), None);

        let by_column = StitchLayout::new(2, 3, MajorAxis::Column, Traversal::Serpentine).unwrap();
        let positions: Vec<_> = (0..6)
            .map(|i| by_column.position(i).map(|p| (p.row, p.column)).unwrap())
            .collect();
        assert_eq!(positions, vec![(0, 0), (1, 0), (1, 1), (0, 1), (0, 2), (1, 2)]);

        assert!(StitchLayout::new(0, 3, MajorAxis::Row, Traversal::Raster).is_err());
    }

    #[test]
    fn test_layout_too_small() {
        let t = table(vec![record(0, None, None), record(1, None, None), record(2, None, None)]);
        let layout = StitchLayout::new(1, 2, MajorAxis::Row, Traversal::Raster).unwrap();
        assert!(matches!(
            resolver().from_layout(&t, &layout),
            Err(MetadataError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_layout_follows_acquisition_order() {
        let t = table(vec![record(2, None, None), record(0, None, None), record(1, None, None)]);
        let layout = StitchLayout::new(1, 3, MajorAxis::Row, Traversal::Raster).unwrap();
        let resolved = resolver().from_layout(&t, &layout).unwrap();
        assert_eq!(grid(&resolved), vec![(0, 2), (0, 0), (0, 1)]);
    }

    #[test]
    fn test_parse_axis_and_traversal() {
        assert_eq!("column".parse::<MajorAxis>().unwrap(), MajorAxis::Column);
        assert_eq!("zigzag".parse::<Traversal>().unwrap(), Traversal::Serpentine);
        assert!("diagonal".parse::<MajorAxis>().is_err());
    }
}
