//! Sparse row bookkeeping for matrix-valued outputs.
//!
//! One task of a matrix chain evaluates one row. While the row's columns are
//! computed, each rank-2 value stages its (column, value) pairs here; after
//! the last column, `end_of_row` hooks record which absolute derivative
//! indices are non-zero for the row. The index list is pre-sized to the
//! chain's total derivative count and reused across rows, so the hot loop
//! never allocates.

use crate::float::Float;

/// Per-row staging and derivative-index record for one rank-2 value.
#[derive(Clone, Debug)]
pub struct RowStash<F: Float> {
    cols: Vec<u32>,
    vals: Vec<F>,
    indices: Vec<u32>,
    num_indices: usize,
}

impl<F: Float> RowStash<F> {
    pub fn new(num_derivatives: usize, max_columns: usize) -> Self {
        RowStash {
            cols: Vec::with_capacity(max_columns),
            vals: Vec::with_capacity(max_columns),
            indices: vec![0; num_derivatives],
            num_indices: 0,
        }
    }

    /// Stage one computed element of the current row.
    pub fn push(&mut self, col: u32, val: F) {
        self.cols.push(col);
        self.vals.push(val);
    }

    /// Number of elements staged so far for the current row.
    pub fn num_entries(&self) -> usize {
        self.cols.len()
    }

    pub fn col(&self, k: usize) -> u32 {
        self.cols[k]
    }

    pub fn val(&self, k: usize) -> F {
        self.vals[k]
    }

    /// The row's non-zero derivative indices.
    pub fn indices(&self) -> &[u32] {
        &self.indices[..self.num_indices]
    }

    /// Append one derivative index. Callers de-duplicate; capacity overflow
    /// is a defect in chain sizing.
    pub fn push_index(&mut self, index: u32) {
        assert!(
            self.num_indices < self.indices.len(),
            "row stash overflow: more than {} derivative indices recorded for one row",
            self.indices.len()
        );
        self.indices[self.num_indices] = index;
        self.num_indices += 1;
    }

    /// Append a block of indices shifted by `offset`, skipping any already
    /// present (first occurrence wins).
    pub fn extend_offset(&mut self, source: &[u32], offset: u32) {
        for &idx in source {
            let shifted = idx + offset;
            if !self.indices[..self.num_indices].contains(&shifted) {
                self.push_index(shifted);
            }
        }
    }

    pub fn clear_row(&mut self) {
        self.cols.clear();
        self.vals.clear();
        self.num_indices = 0;
    }
}
