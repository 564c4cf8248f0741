//! Typed output ports.
//!
//! A [`Value`] is one named output component of a node: a scalar, a vector,
//! or a matrix, optionally carrying a dense derivative block (scalar
//! reductions) and optionally materialized for random access (`stored`).
//! Slot indices, buffer offsets and derivative ranges deliberately do *not*
//! live here: they belong to the per-evaluation [`EvalPlan`](crate::plan::EvalPlan),
//! which is rebuilt whenever the task-domain size changes.

use crate::float::Float;
use crate::node::NodeId;

/// Names one output component of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValueRef {
    pub node: NodeId,
    pub comp: usize,
}

impl ValueRef {
    pub fn new(node: NodeId, comp: usize) -> Self {
        ValueRef { node, comp }
    }
}

/// Rank and shape of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Scalar,
    Vector {
        len: usize,
    },
    Matrix {
        rows: usize,
        cols: usize,
        symmetric: bool,
    },
}

impl ValueKind {
    pub fn rank(&self) -> usize {
        match self {
            ValueKind::Scalar => 0,
            ValueKind::Vector { .. } => 1,
            ValueKind::Matrix { .. } => 2,
        }
    }

    /// Logical element count (rows * cols for matrices).
    pub fn num_elements(&self) -> usize {
        match *self {
            ValueKind::Scalar => 1,
            ValueKind::Vector { len } => len,
            ValueKind::Matrix { rows, cols, .. } => rows * cols,
        }
    }

    /// Size of the first shape dimension: one task per entry.
    pub fn task_count(&self) -> usize {
        match *self {
            ValueKind::Scalar => 1,
            ValueKind::Vector { len } => len,
            ValueKind::Matrix { rows, .. } => rows,
        }
    }
}

/// Periodic domain of a value, if any.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Periodicity<F: Float> {
    NotPeriodic,
    /// Half-open domain `[min, max)`.
    Domain { min: F, max: F },
}

/// Static description of one output component.
#[derive(Clone, Debug)]
pub struct ValueSpec<F: Float> {
    pub name: String,
    pub kind: ValueKind,
    /// Dense per-derivative-index block is kept alongside the value. Used by
    /// scalar reductions whose gradient with respect to every chain input is
    /// accumulated during the task loop.
    pub has_derivatives: bool,
    /// Whether a random-access copy of the data is retained. Streamed
    /// intermediates inside a chain are not stored; chain construction flips
    /// this on when a consumer falls back to non-fused mode.
    pub stored: bool,
    pub periodicity: Periodicity<F>,
    /// Hint: the derivative is identically zero wherever the value is zero.
    pub zero_value_zero_derivative: bool,
}

impl<F: Float> ValueSpec<F> {
    /// A scalar reduction output carrying its dense derivative block.
    pub fn scalar(name: impl Into<String>) -> Self {
        ValueSpec {
            name: name.into(),
            kind: ValueKind::Scalar,
            has_derivatives: true,
            stored: true,
            periodicity: Periodicity::NotPeriodic,
            zero_value_zero_derivative: false,
        }
    }

    /// A vector output, stored by default.
    pub fn vector(name: impl Into<String>, len: usize) -> Self {
        ValueSpec {
            name: name.into(),
            kind: ValueKind::Vector { len },
            has_derivatives: false,
            stored: true,
            periodicity: Periodicity::NotPeriodic,
            zero_value_zero_derivative: false,
        }
    }

    /// A matrix output, stored by default.
    pub fn matrix(name: impl Into<String>, rows: usize, cols: usize) -> Self {
        ValueSpec {
            name: name.into(),
            kind: ValueKind::Matrix {
                rows,
                cols,
                symmetric: false,
            },
            has_derivatives: false,
            stored: true,
            periodicity: Periodicity::NotPeriodic,
            zero_value_zero_derivative: false,
        }
    }

    pub fn streamed(mut self) -> Self {
        self.stored = false;
        self
    }

    pub fn symmetric(mut self, symmetric: bool) -> Self {
        if let ValueKind::Matrix { symmetric: s, .. } = &mut self.kind {
            *s = symmetric;
        }
        self
    }

    pub fn periodic(mut self, min: F, max: F) -> Self {
        self.periodicity = Periodicity::Domain { min, max };
        self
    }
}

/// One output component together with its storage, dense derivative block,
/// externally registered forces and (for matrices) sparse-column bookkeeping.
#[derive(Clone, Debug)]
pub struct Value<F: Float> {
    pub spec: ValueSpec<F>,
    /// Row-major storage. Scalars use one element; sparse matrices store
    /// `rows * num_columns` entries addressed through `bookkeeping`.
    data: Vec<F>,
    /// Dense derivative block for scalar reductions, one entry per chain
    /// derivative index. Sized by the runner at scatter time.
    derivatives: Vec<F>,
    /// Externally registered forces, one per stored element.
    forces: Vec<F>,
    has_force: bool,
    /// Column capacity of the sparse matrix store (== cols when dense).
    num_columns: usize,
    /// Per-row `[count, col, col, ...]` records with stride `num_columns + 1`.
    bookkeeping: Vec<u32>,
}

impl<F: Float> Value<F> {
    pub fn new(spec: ValueSpec<F>) -> Self {
        let num_columns = match spec.kind {
            ValueKind::Matrix { cols, .. } => cols,
            _ => 0,
        };
        let mut value = Value {
            spec,
            data: Vec::new(),
            derivatives: Vec::new(),
            forces: Vec::new(),
            has_force: false,
            num_columns,
            bookkeeping: Vec::new(),
        };
        if value.spec.stored || value.rank() == 0 {
            value.build_data_store();
        }
        value
    }

    pub fn rank(&self) -> usize {
        self.spec.kind.rank()
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Number of entries in the random-access store.
    pub fn stored_len(&self) -> usize {
        match self.spec.kind {
            ValueKind::Scalar => 1,
            ValueKind::Vector { len } => len,
            ValueKind::Matrix { rows, .. } => rows * self.num_columns,
        }
    }

    /// Allocate the random-access store and mark the value as stored.
    pub fn build_data_store(&mut self) {
        self.spec.stored = true;
        let len = self.stored_len();
        self.data.resize(len, F::zero());
        self.forces.resize(len, F::zero());
        if let ValueKind::Matrix { rows, .. } = self.spec.kind {
            self.bookkeeping.resize(rows * (self.num_columns + 1), 0);
        }
    }

    /// Cap the number of stored columns per matrix row (neighbor-list-scale
    /// sparsity). Resizes the backing store.
    pub fn reshape_columns(&mut self, num_columns: usize) {
        debug_assert!(self.rank() == 2, "reshape_columns on non-matrix {}", self.name());
        self.num_columns = num_columns;
        if self.spec.stored {
            self.build_data_store();
        }
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn get(&self, index: usize) -> F {
        self.data[index]
    }

    pub fn set(&mut self, index: usize, v: F) {
        self.data[index] = v;
    }

    pub fn data(&self) -> &[F] {
        &self.data
    }

    /// Look up a matrix element by logical (row, col). Returns the flat
    /// position in the sparse store and the value, or `None` when the column
    /// is absent from the row's bookkeeping.
    pub fn find_matrix_element(&self, row: usize, col: usize) -> Option<(usize, F)> {
        debug_assert!(self.rank() == 2 && self.spec.stored);
        let stride = self.num_columns + 1;
        let count = self.bookkeeping[row * stride] as usize;
        for k in 0..count {
            if self.bookkeeping[row * stride + 1 + k] as usize == col {
                let flat = row * self.num_columns + k;
                return Some((flat, self.data[flat]));
            }
        }
        None
    }

    /// Record the column list of one matrix row.
    pub(crate) fn set_row_bookkeeping(&mut self, row: usize, cols: &[u32]) {
        let stride = self.num_columns + 1;
        assert!(
            cols.len() <= self.num_columns,
            "row {row} of {} lists {} columns but only {} are stored",
            self.spec.name,
            cols.len(),
            self.num_columns
        );
        self.bookkeeping[row * stride] = cols.len() as u32;
        self.bookkeeping[row * stride + 1..row * stride + 1 + cols.len()].copy_from_slice(cols);
    }

    /// Column indices recorded for one matrix row.
    pub fn row_columns(&self, row: usize) -> &[u32] {
        let stride = self.num_columns + 1;
        let count = self.bookkeeping[row * stride] as usize;
        &self.bookkeeping[row * stride + 1..row * stride + 1 + count]
    }

    pub(crate) fn resize_derivatives(&mut self, num_derivatives: usize) {
        self.derivatives.resize(num_derivatives, F::zero());
    }

    pub fn set_derivative(&mut self, index: usize, v: F) {
        self.derivatives[index] = v;
    }

    pub fn derivatives(&self) -> &[F] {
        &self.derivatives
    }

    /// Register an external force on one stored element. Forces accumulate
    /// until the owning chain's adjoint pass consumes them.
    pub fn add_force(&mut self, index: usize, force: F) {
        assert!(
            index < self.forces.len(),
            "force registered on element {index} of {} which stores {} elements",
            self.spec.name,
            self.forces.len()
        );
        self.forces[index] += force;
        self.has_force = true;
    }

    pub fn force_was_added(&self) -> bool {
        self.has_force
    }

    pub fn force(&self, index: usize) -> F {
        self.forces[index]
    }

    pub(crate) fn clear_forces(&mut self) {
        for f in &mut self.forces {
            *f = F::zero();
        }
        self.has_force = false;
    }
}
