//! Merging of per-upload metadata into cycle coordinates.
//!
//! Every distinct timepoint becomes one cycle. Uploads are consumed in
//! order; within an upload timepoints are consumed ascending. A timepoint
//! seen in an earlier upload merges into its existing cycle.
//!
//! ```text
//! upload_000 (t=0, t=1) ──┐        cycle_000 (t=0)
//!                         ├──────► cycle_001 (t=1)
//! upload_001 (t=1, t=2) ──┘        cycle_002 (t=2)
//! ```
//!
//! The reconciler is in-memory only; [`add_upload`](CycleReconciler::add_upload)
//! either applies a whole upload or leaves the state untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

use crate::diagnostics::Diagnostics;
use crate::error::MetadataError;
use crate::experiment::{cycle_image_file, upload_image_file, Cycle};
use crate::metadata::{
    image_ref_id, FieldName, FileMapperEntry, ImageNameFields, ImageNameTemplate, ImageRecord,
    MetadataTable,
};

/// Identity of an image within a cycle: well, grid row, grid column,
/// channel, plane.
type ImageKey = (String, u32, u32, u32, u32);

/// Metadata of one upload as written by its run job.
#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub upload: u32,
    pub table: MetadataTable,
    pub mapper: Vec<FileMapperEntry>,
}

/// A cycle and its metadata table.
#[derive(Debug, Clone)]
pub struct CycleTable {
    pub cycle: Cycle,
    pub table: MetadataTable,
}

#[derive(Debug)]
pub struct CycleReconciler {
    experiment: String,
    template: ImageNameTemplate,
    cycles: Vec<CycleTable>,
    mapper: Vec<FileMapperEntry>,
    diagnostics: Diagnostics,
}

impl CycleReconciler {
    pub fn new(
        experiment: impl Into<String>,
        template: ImageNameTemplate,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            experiment: experiment.into(),
            template,
            cycles: Vec::new(),
            mapper: Vec::new(),
            diagnostics,
        }
    }

    pub fn cycles(&self) -> &[CycleTable] {
        &self.cycles
    }

    pub fn cycle(&self, index: u32) -> Option<&CycleTable> {
        self.cycles.iter().find(|c| c.cycle.index == index)
    }

    /// Global mapper in cycle coordinates, in the order entries were added.
    pub fn mapper(&self) -> &[FileMapperEntry] {
        &self.mapper
    }

    /// Merge one upload. Returns the indices of the cycles it touched,
    /// ascending.
    pub fn add_upload(&mut self, upload: &UploadMetadata) -> Result<Vec<u32>, MetadataError> {
        check_mapper(upload)?;
        let keys = upload
            .table
            .iter()
            .map(|record| image_key(record).map(|key| (record.id, key)))
            .collect::<Result<HashMap<_, _>, _>>()?;

        // Staged copies of every touched cycle; committed only on success
        let mut staged: BTreeMap<u32, CycleTable> = BTreeMap::new();
        let mut next_index = self.cycles.len() as u32;
        // upload image id -> (cycle, cycle image id)
        let mut lut: HashMap<usize, (u32, usize)> = HashMap::new();

        for tpoint in upload.table.tpoints() {
            let index = match self.cycles.iter().find(|c| c.cycle.tpoint == tpoint) {
                Some(existing) => existing.cycle.index,
                None => {
                    let index = next_index;
                    next_index += 1;
                    index
                }
            };
            let target = staged.entry(index).or_insert_with(|| {
                self.cycles
                    .iter()
                    .find(|c| c.cycle.index == index)
                    .cloned()
                    .unwrap_or_else(|| CycleTable {
                        cycle: Cycle { index, tpoint },
                        table: MetadataTable::new(),
                    })
            });

            let mut seen: HashSet<ImageKey> = target
                .table
                .iter()
                .filter_map(|record| image_key(record).ok())
                .collect();

            let mut records: Vec<&ImageRecord> = upload
                .table
                .iter()
                .filter(|record| record.tpoint == Some(tpoint))
                .collect();
            records.sort_by(|a, b| keys[&a.id].cmp(&keys[&b.id]));

            for record in records {
                let key = &keys[&record.id];
                if !seen.insert(key.clone()) {
                    return Err(MetadataError::Inconsistent(format!(
                        "upload {}: well {} position ({}, {}) channel {} plane {} \
                         at timepoint {} is described by more than one image",
                        upload.upload, key.0, key.1, key.2, key.3, key.4, tpoint
                    )));
                }
                let (well, y, x, c, z) = key;
                let mut reconciled = record.clone();
                reconciled.tpoint = Some(index);
                reconciled.name = Some(self.template.format(&ImageNameFields {
                    experiment: &self.experiment,
                    t: index,
                    w: well,
                    y: *y,
                    x: *x,
                    c: *c,
                    z: *z,
                }));
                let id = target.table.push(reconciled);
                lut.insert(record.id, (index, id));
            }

            target.table.plate.name = Some(target.cycle.name());
            let (rows, columns) = (upload.table.plate.rows, upload.table.plate.columns);
            target.table.plate.rows = max_option(target.table.plate.rows, rows);
            target.table.plate.columns = max_option(target.table.plate.columns, columns);
            target.table.update_plate_dimensions();
        }

        let mut entries = Vec::with_capacity(upload.mapper.len());
        for entry in &upload.mapper {
            let Some(&(cycle, id)) = lut.get(&entry.ref_index) else {
                return Err(MetadataError::Inconsistent(format!(
                    "upload {}: mapper entry for {} has no timepoint",
                    upload.upload, entry.ref_id
                )));
            };
            let name = staged
                .get(&cycle)
                .and_then(|c| c.table.image(id))
                .and_then(|record| record.name.clone())
                .unwrap_or_default();
            entries.push(FileMapperEntry {
                series: entry.series,
                planes: entry.planes.clone(),
                files: entry
                    .files
                    .iter()
                    .map(|file| upload_image_file(upload.upload, file))
                    .collect(),
                ref_index: id,
                ref_id: image_ref_id(id),
                ref_file: cycle_image_file(cycle, &name),
            });
        }

        let touched: Vec<u32> = staged.keys().copied().collect();
        for (index, table) in staged {
            match self.cycles.iter_mut().find(|c| c.cycle.index == index) {
                Some(existing) => *existing = table,
                None => {
                    self.diagnostics.in_scope(|| {
                        info!(
                            cycle = index,
                            tpoint = table.cycle.tpoint,
                            upload = upload.upload,
                            "Created cycle"
                        )
                    });
                    self.cycles.push(table);
                }
            }
        }
        self.mapper.extend(entries);

        self.diagnostics.in_scope(|| {
            debug!(
                upload = upload.upload,
                images = upload.table.len(),
                cycles = ?touched,
                "Reconciled upload"
            )
        });
        Ok(touched)
    }
}

fn image_key(record: &ImageRecord) -> Result<ImageKey, MetadataError> {
    let mut missing = BTreeSet::new();
    if record.well.is_none() {
        missing.insert(FieldName::Well);
    }
    if record.channel.is_none() {
        missing.insert(FieldName::ChannelName);
    }
    if record.zplane.is_none() {
        missing.insert(FieldName::Plane);
    }
    if record.tpoint.is_none() {
        missing.insert(FieldName::Timepoint);
    }
    if !missing.is_empty() {
        return Err(MetadataError::Missing(missing));
    }
    let grid = record.grid.ok_or_else(|| {
        MetadataError::InvalidLayout(format!("image {} has no grid position", record.id))
    })?;
    Ok((
        record.well.clone().unwrap_or_default(),
        grid.row,
        grid.column,
        record.channel.unwrap_or_default(),
        record.zplane.unwrap_or_default(),
    ))
}

/// Every entry must point at a distinct image of the upload table.
fn check_mapper(upload: &UploadMetadata) -> Result<(), MetadataError> {
    let mut referenced = HashSet::new();
    for entry in &upload.mapper {
        if upload.table.image(entry.ref_index).is_none() {
            return Err(MetadataError::Inconsistent(format!(
                "upload {}: mapper entry points at unknown image {}",
                upload.upload, entry.ref_id
            )));
        }
        if !referenced.insert(entry.ref_index) {
            return Err(MetadataError::Inconsistent(format!(
                "upload {}: image {} is referenced by more than one mapper entry",
                upload.upload, entry.ref_id
            )));
        }
    }
    Ok(())
}

fn max_option(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
