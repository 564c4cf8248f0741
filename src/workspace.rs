//! Per-task scratch space.
//!
//! One `Workspace` is owned by each parallel worker for the duration of an
//! evaluation. It holds the dense array of streamed-quantity slots, one
//! sparse derivative record per slot, and the row stashes of matrix chains.
//! The derivative records are a flat arena sized once to the chain's slot
//! and derivative counts: a dense value lane for O(1) accumulation plus an
//! active-index list with an explicit length, so clearing touches only the
//! entries a task actually wrote.

use crate::float::Float;
use crate::plan::EvalPlan;
use crate::stash::RowStash;

pub struct Workspace<F: Float> {
    num_quantities: usize,
    num_derivatives: usize,
    /// Current value of each streamed quantity.
    values: Vec<F>,
    /// Dense derivative lanes, `num_quantities * num_derivatives`.
    derivs: Vec<F>,
    /// Active derivative indices per slot, insertion-ordered.
    active: Vec<u32>,
    num_active: Vec<usize>,
    /// Membership flags making `update_index` idempotent and O(1).
    on_list: Vec<bool>,
    task_index: usize,
    /// Set by the runner: true while a matrix row (rather than a vector
    /// task) is being driven.
    matrix_call: bool,
    stashes: Vec<RowStash<F>>,
}

impl<F: Float> Workspace<F> {
    pub fn new(plan: &EvalPlan) -> Self {
        Self::with_sizes(
            plan.num_quantities,
            plan.num_derivatives,
            plan.max_columns,
            plan.num_stashes,
        )
    }

    pub fn with_sizes(
        num_quantities: usize,
        num_derivatives: usize,
        max_columns: usize,
        num_stashes: usize,
    ) -> Self {
        Workspace {
            num_quantities,
            num_derivatives,
            values: vec![F::zero(); num_quantities],
            derivs: vec![F::zero(); num_quantities * num_derivatives],
            active: vec![0; num_quantities * num_derivatives],
            num_active: vec![0; num_quantities],
            on_list: vec![false; num_quantities * num_derivatives],
            task_index: 0,
            matrix_call: false,
            stashes: (0..num_stashes)
                .map(|_| RowStash::new(num_derivatives, max_columns))
                .collect(),
        }
    }

    pub fn num_quantities(&self) -> usize {
        self.num_quantities
    }

    pub fn num_derivatives(&self) -> usize {
        self.num_derivatives
    }

    pub fn task_index(&self) -> usize {
        self.task_index
    }

    pub(crate) fn set_task_index(&mut self, task: usize) {
        self.task_index = task;
    }

    pub fn is_matrix_call(&self) -> bool {
        self.matrix_call
    }

    pub(crate) fn set_matrix_call(&mut self, matrix: bool) {
        self.matrix_call = matrix;
    }

    // ── slot values ──

    pub fn get(&self, slot: usize) -> F {
        self.values[slot]
    }

    pub fn set_value(&mut self, slot: usize, v: F) {
        self.values[slot] = v;
    }

    pub fn add_value(&mut self, slot: usize, v: F) {
        self.values[slot] += v;
    }

    // ── sparse derivative records ──

    pub fn add_derivative(&mut self, slot: usize, index: usize, v: F) {
        debug_assert!(index < self.num_derivatives, "derivative index out of range");
        self.derivs[slot * self.num_derivatives + index] += v;
    }

    pub fn derivative(&self, slot: usize, index: usize) -> F {
        self.derivs[slot * self.num_derivatives + index]
    }

    /// Mark a derivative index active for a slot. Idempotent.
    pub fn update_index(&mut self, slot: usize, index: usize) {
        let flat = slot * self.num_derivatives + index;
        if !self.on_list[flat] {
            self.on_list[flat] = true;
            self.active[slot * self.num_derivatives + self.num_active[slot]] = index as u32;
            self.num_active[slot] += 1;
        }
    }

    pub fn num_active(&self, slot: usize) -> usize {
        self.num_active[slot]
    }

    pub fn active_index(&self, slot: usize, k: usize) -> usize {
        self.active[slot * self.num_derivatives + k] as usize
    }

    // ── clearing ──

    /// Reset one slot's value and every derivative entry it touched.
    pub fn clear_slot(&mut self, slot: usize) {
        self.values[slot] = F::zero();
        let base = slot * self.num_derivatives;
        for k in 0..self.num_active[slot] {
            let idx = self.active[base + k] as usize;
            self.derivs[base + idx] = F::zero();
            self.on_list[base + idx] = false;
        }
        self.num_active[slot] = 0;
    }

    /// Reset every slot and every row stash between tasks. Stale sparse
    /// indices must never leak from one task into the next.
    pub fn clear_all(&mut self) {
        for slot in 0..self.num_quantities {
            self.clear_slot(slot);
        }
        for stash in &mut self.stashes {
            stash.clear_row();
        }
    }

    // ── matrix row stashes ──

    pub fn stash(&self, index: usize) -> &RowStash<F> {
        &self.stashes[index]
    }

    pub fn stash_mut(&mut self, index: usize) -> &mut RowStash<F> {
        &mut self.stashes[index]
    }

    /// Copy the derivative indices of one stash into another with an
    /// additive offset, de-duplicating against what is already recorded.
    /// Used when a matrix consumer coalesces its argument's row sparsity.
    pub fn coalesce_stash_indices(&mut self, from: usize, to: usize, offset: u32) {
        assert!(from != to, "cannot coalesce a row stash into itself");
        let (src, dst) = if from < to {
            let (lo, hi) = self.stashes.split_at_mut(to);
            (&lo[from], &mut hi[0])
        } else {
            let (lo, hi) = self.stashes.split_at_mut(from);
            (&hi[0], &mut lo[to])
        };
        let indices: &[u32] = src.indices();
        dst.extend_offset(indices, offset);
    }
}
