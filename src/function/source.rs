//! Leaf nodes feeding external data into a chain.
//!
//! A source owns its input data outright and claims one derivative index per
//! logical element, so every downstream derivative and adjoint force is
//! expressed against these inputs. Forces folded back by the adjoint pass
//! accumulate here until the caller reads and resets them.

use crate::float::Float;
use crate::node::{EvalContext, MatrixNode, Node, NodeId};
use crate::value::{ValueRef, ValueSpec};
use crate::workspace::Workspace;

/// A vector of externally supplied inputs, one task per entry.
pub struct SourceVector<F: Float> {
    label: String,
    data: Vec<F>,
    forces: Vec<F>,
}

impl<F: Float> SourceVector<F> {
    pub fn new(label: impl Into<String>, data: Vec<F>) -> Self {
        let forces = vec![F::zero(); data.len()];
        SourceVector {
            label: label.into(),
            data,
            forces,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Replace the input data between evaluations. The length is fixed at
    /// construction.
    pub fn set_data(&mut self, data: &[F]) {
        assert_eq!(
            data.len(),
            self.data.len(),
            "source {} holds {} entries",
            self.label,
            self.data.len()
        );
        self.data.copy_from_slice(data);
    }
}

impl<F: Float> Node<F> for SourceVector<F> {
    fn label(&self) -> &str {
        &self.label
    }

    fn output_specs(&self) -> Vec<ValueSpec<F>> {
        vec![ValueSpec::vector(self.label.clone(), self.data.len())]
    }

    fn arguments(&self) -> &[ValueRef] {
        &[]
    }

    fn num_input_derivatives(&self) -> usize {
        self.data.len()
    }

    fn perform_task(
        &self,
        me: NodeId,
        task: usize,
        ctx: &EvalContext<'_, F>,
        ws: &mut Workspace<F>,
    ) {
        let slot = ctx.out_slot(me, 0);
        ws.add_value(slot, self.data[task]);
        let idx = ctx.input_deriv_range(me).start + task;
        ws.add_derivative(slot, idx, F::one());
        ws.update_index(slot, idx);
    }

    fn scatter_input_forces(&mut self, forces: &[F]) {
        for (acc, &f) in self.forces.iter_mut().zip(forces) {
            *acc += f;
        }
    }

    fn input_forces(&self) -> &[F] {
        &self.forces
    }

    fn reset_input_forces(&mut self) {
        for f in &mut self.forces {
            *f = F::zero();
        }
    }
}

/// A matrix of externally supplied inputs, one task per row, with an
/// optional externally maintained column list per row.
pub struct SourceMatrix<F: Float> {
    label: String,
    rows: usize,
    cols: usize,
    num_columns: usize,
    /// Dense row-major backing, `rows * cols`.
    data: Vec<F>,
    row_cols: Option<Vec<Vec<u32>>>,
    forces: Vec<F>,
}

impl<F: Float> SourceMatrix<F> {
    pub fn new(label: impl Into<String>, rows: usize, cols: usize, data: Vec<F>) -> Self {
        assert_eq!(data.len(), rows * cols, "matrix source data is row-major dense");
        let forces = vec![F::zero(); rows * cols];
        SourceMatrix {
            label: label.into(),
            rows,
            cols,
            num_columns: cols,
            data,
            row_cols: None,
            forces,
        }
    }

    /// Restrict each row to an externally maintained column list. The store
    /// keeps `num_columns` entries per row; no list may exceed it.
    pub fn with_sparsity(mut self, row_cols: Vec<Vec<u32>>, num_columns: usize) -> Self {
        assert_eq!(row_cols.len(), self.rows, "one column list per row");
        for (row, cols) in row_cols.iter().enumerate() {
            assert!(
                cols.len() <= num_columns,
                "row {row} of {} lists {} columns but only {num_columns} are stored",
                self.label,
                cols.len()
            );
        }
        self.row_cols = Some(row_cols);
        self.num_columns = num_columns;
        self
    }

}

impl<F: Float> Node<F> for SourceMatrix<F> {
    fn label(&self) -> &str {
        &self.label
    }

    fn output_specs(&self) -> Vec<ValueSpec<F>> {
        vec![ValueSpec::matrix(self.label.clone(), self.rows, self.cols)]
    }

    fn arguments(&self) -> &[ValueRef] {
        &[]
    }

    fn num_input_derivatives(&self) -> usize {
        self.rows * self.cols
    }

    fn perform_task(
        &self,
        _me: NodeId,
        _task: usize,
        _ctx: &EvalContext<'_, F>,
        _ws: &mut Workspace<F>,
    ) {
        panic!(
            "matrix node {} must be driven through the row protocol",
            self.label
        );
    }

    fn scatter_input_forces(&mut self, forces: &[F]) {
        for (acc, &f) in self.forces.iter_mut().zip(forces) {
            *acc += f;
        }
    }

    fn input_forces(&self) -> &[F] {
        &self.forces
    }

    fn reset_input_forces(&mut self) {
        for f in &mut self.forces {
            *f = F::zero();
        }
    }

    fn matrix(&self) -> Option<&dyn MatrixNode<F>> {
        Some(self)
    }
}

impl<F: Float> MatrixNode<F> for SourceMatrix<F> {
    fn num_columns(&self) -> usize {
        self.num_columns
    }

    fn active_columns(&self, row: usize, _ctx: &EvalContext<'_, F>, cols: &mut Vec<u32>) {
        match &self.row_cols {
            Some(lists) => cols.extend_from_slice(&lists[row]),
            None => cols.extend(0..self.cols as u32),
        }
    }

    fn compute_element(
        &self,
        me: NodeId,
        row: usize,
        col: usize,
        ctx: &EvalContext<'_, F>,
        ws: &mut Workspace<F>,
    ) {
        let slot = ctx.out_slot(me, 0);
        ws.set_value(slot, self.data[row * self.cols + col]);
        let idx = ctx.input_deriv_range(me).start + row * self.cols + col;
        ws.add_derivative(slot, idx, F::one());
        ws.update_index(slot, idx);
    }

    fn end_of_row(
        &self,
        me: NodeId,
        row: usize,
        cols: &[u32],
        ctx: &EvalContext<'_, F>,
        ws: &mut Workspace<F>,
    ) {
        let stash = ctx.stash(ValueRef::new(me, 0));
        let base = ctx.input_deriv_range(me).start + row * self.cols;
        ws.stash_mut(stash).extend_offset(cols, base as u32);
    }
}
