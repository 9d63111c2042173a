use crate::pixels::ChannelImage;

/// Row-major 2-D arrangement of image references, possibly with gaps.
///
/// Built once per stitching call and never persisted.
#[derive(Debug, Clone)]
pub struct ImageGrid<'a> {
    rows: usize,
    columns: usize,
    cells: Vec<Option<&'a ChannelImage>>,
}

impl<'a> ImageGrid<'a> {
    /// Empty grid of the given shape.
    pub fn new(rows: usize, columns: usize) -> Self {
        Self {
            rows,
            columns,
            cells: vec![None; rows * columns],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn get(&self, row: usize, column: usize) -> Option<&'a ChannelImage> {
        if row >= self.rows || column >= self.columns {
            return None;
        }
        self.cells[row * self.columns + column]
    }

    /// Place `image` at `(row, column)`, returning the previous occupant.
    pub(crate) fn set(
        &mut self,
        row: usize,
        column: usize,
        image: &'a ChannelImage,
    ) -> Option<&'a ChannelImage> {
        self.cells[row * self.columns + column].replace(image)
    }

    /// Cells of one row, left to right.
    pub fn row(&self, row: usize) -> &[Option<&'a ChannelImage>] {
        &self.cells[row * self.columns..(row + 1) * self.columns]
    }

    /// Positions of empty cells, row-major.
    pub fn gaps(&self) -> Vec<(usize, usize)> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.is_none())
            .map(|(i, _)| (i / self.columns, i % self.columns))
            .collect()
    }

    /// Number of occupied cells.
    pub fn occupied(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }
}
