//! An element function mapped over matrix rows.

use super::ElementFunction;
use crate::error::ChainError;
use crate::float::Float;
use crate::graph::Graph;
use crate::node::{EvalContext, MatrixNode, Node, NodeId};
use crate::plan::EvalPlan;
use crate::value::{Value, ValueKind, ValueRef, ValueSpec};
use crate::workspace::Workspace;

/// Applies an [`ElementFunction`] to each element of its matrix arguments,
/// driven one row per task through the sparse row protocol. Scalar arguments
/// are broadcast; a zero-rank function reduces every element to scalars.
pub struct FunctionOfMatrix<F: Float, T: ElementFunction<F>> {
    label: String,
    func: T,
    args: Vec<ValueRef>,
    rows: usize,
    cols: usize,
    num_columns: usize,
    symmetric: bool,
    specs: Vec<ValueSpec<F>>,
}

impl<F: Float, T: ElementFunction<F>> FunctionOfMatrix<F, T> {
    pub fn new(
        graph: &Graph<F>,
        label: impl Into<String>,
        func: T,
        args: Vec<ValueRef>,
    ) -> Result<Self, ChainError> {
        let label = label.into();
        if !func.derivatives_implemented() {
            return Err(ChainError::DerivativesUnimplemented {
                label: label.clone(),
            });
        }
        let mut shape: Option<(usize, usize)> = None;
        let mut num_columns = 0;
        let mut symmetric = true;
        for &arg in &args {
            let value = graph.value(arg);
            match value.spec.kind {
                ValueKind::Scalar => {}
                ValueKind::Matrix {
                    rows,
                    cols,
                    symmetric: s,
                } => {
                    match shape {
                        None => {
                            shape = Some((rows, cols));
                            num_columns = value.num_columns();
                        }
                        Some(first) if first != (rows, cols) => {
                            return Err(ChainError::ArgumentMismatch {
                                label,
                                reason: format!(
                                    "{} is {}x{} but an earlier argument is {}x{}",
                                    value.name(),
                                    rows,
                                    cols,
                                    first.0,
                                    first.1
                                ),
                            });
                        }
                        Some(_) => {}
                    }
                    symmetric &= s;
                }
                ValueKind::Vector { .. } => {
                    return Err(ChainError::UnsupportedArgument {
                        label,
                        argument: value.name().to_string(),
                        reason: "vector arguments need the vector form of this node".into(),
                    });
                }
            }
        }
        let Some((rows, cols)) = shape else {
            return Err(ChainError::ArgumentMismatch {
                label,
                reason: "at least one matrix argument is required".into(),
            });
        };

        let ncomp = func.num_components();
        let zero_rank = func.zero_rank();
        let specs = (0..ncomp)
            .map(|c| {
                let name = if ncomp == 1 {
                    label.clone()
                } else {
                    format!("{label}.{c}")
                };
                let spec = if zero_rank {
                    ValueSpec::scalar(name)
                } else {
                    ValueSpec::matrix(name, rows, cols).symmetric(symmetric)
                };
                match func.periodic_domain() {
                    Some((min, max)) => spec.periodic(min, max),
                    None => spec,
                }
            })
            .collect();

        Ok(FunctionOfMatrix {
            label,
            func,
            args,
            rows,
            cols,
            num_columns,
            symmetric,
            specs,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }
}

impl<F: Float, T: ElementFunction<F>> Node<F> for FunctionOfMatrix<F, T> {
    fn label(&self) -> &str {
        &self.label
    }

    fn output_specs(&self) -> Vec<ValueSpec<F>> {
        self.specs.clone()
    }

    fn arguments(&self) -> &[ValueRef] {
        &self.args
    }

    /// A reduction's scalar is finished only after the whole task loop, so
    /// consumers must read it through its store.
    fn renders_chain_unsafe(&self) -> bool {
        self.func.zero_rank()
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

    fn finalize(&self, _buffer: &[F], plan: &EvalPlan, values: &mut [Value<F>]) {
        let scale = self.func.finish_scale(plan.num_tasks);
        if scale == F::one() {
            return;
        }
        for value in values.iter_mut().filter(|v| v.rank() == 0) {
            let scaled = value.get(0) * scale;
            value.set(0, scaled);
            for j in 0..value.derivatives().len() {
                let d = value.derivatives()[j] * scale;
                value.set_derivative(j, d);
            }
        }
    }

    fn matrix(&self) -> Option<&dyn MatrixNode<F>> {
        Some(self)
    }
}

impl<F: Float, T: ElementFunction<F>> MatrixNode<F> for FunctionOfMatrix<F, T> {
    fn num_columns(&self) -> usize {
        self.num_columns
    }

    fn active_columns(&self, row: usize, ctx: &EvalContext<'_, F>, cols: &mut Vec<u32>) {
        // Only meaningful when this node heads its own chain, in which case
        // its matrix arguments are stored and carry column bookkeeping.
        for &arg in &self.args {
            let value = ctx.value(arg);
            if value.rank() == 2 && value.spec.stored {
                cols.extend_from_slice(value.row_columns(row));
                return;
            }
        }
        cols.extend(0..self.cols as u32);
    }

    fn compute_element(
        &self,
        me: NodeId,
        row: usize,
        col: usize,
        ctx: &EvalContext<'_, F>,
        ws: &mut Workspace<F>,
    ) {
        let nargs = self.args.len();
        let ncomp = self.func.num_components();
        let mut argv = vec![F::zero(); nargs];
        let mut vals = vec![F::zero(); ncomp];
        let mut derivs = vec![F::zero(); ncomp * nargs];
        // Flat store positions of stored matrix arguments, when present.
        let mut flats: Vec<Option<usize>> = vec![None; nargs];

        for (i, &arg) in self.args.iter().enumerate() {
            let value = ctx.value(arg);
            argv[i] = if value.rank() == 0 {
                value.get(0)
            } else if ctx.is_streamed(arg) {
                ws.get(ctx.slot(arg))
            } else if let Some((flat, v)) = value.find_matrix_element(row, col) {
                flats[i] = Some(flat);
                v
            } else {
                F::zero()
            };
        }

        self.func.calc(&argv, &mut vals, &mut derivs);

        for c in 0..ncomp {
            let out = ctx.out_slot(me, c);
            if self.func.zero_rank() {
                ws.add_value(out, vals[c]);
            } else {
                ws.set_value(out, vals[c]);
            }
            for (i, &arg) in self.args.iter().enumerate() {
                let d = derivs[c * nargs + i];
                if d == F::zero() {
                    continue;
                }
                let value = ctx.value(arg);
                if value.rank() > 0 && ctx.is_streamed(arg) {
                    let aslot = ctx.slot(arg);
                    for k in 0..ws.num_active(aslot) {
                        let idx = ws.active_index(aslot, k);
                        ws.add_derivative(out, idx, d * ws.derivative(aslot, idx));
                        ws.update_index(out, idx);
                    }
                } else if value.rank() == 0 {
                    let range = ctx.value_deriv_range(arg);
                    ws.add_derivative(out, range.start, d);
                    ws.update_index(out, range.start);
                } else if let Some(flat) = flats[i] {
                    let range = ctx.value_deriv_range(arg);
                    ws.add_derivative(out, range.start + flat, d);
                    ws.update_index(out, range.start + flat);
                }
            }
        }
    }

    fn end_of_row(
        &self,
        me: NodeId,
        row: usize,
        cols: &[u32],
        ctx: &EvalContext<'_, F>,
        ws: &mut Workspace<F>,
    ) {
        if self.func.zero_rank() {
            // Scalar outputs carry their sparsity in the dense block.
            return;
        }
        for c in 0..self.func.num_components() {
            let out = ctx.stash(ValueRef::new(me, c));
            for &arg in &self.args {
                let value = ctx.value(arg);
                if value.rank() == 0 {
                    let range = ctx.value_deriv_range(arg);
                    ws.stash_mut(out).extend_offset(&[0], range.start as u32);
                } else if ctx.is_streamed(arg) {
                    // Upstream indices are already absolute.
                    let from = ctx.stash(arg);
                    if from != out {
                        ws.coalesce_stash_indices(from, out, 0);
                    }
                } else {
                    let range = ctx.value_deriv_range(arg);
                    let flats: Vec<u32> = cols
                        .iter()
                        .filter_map(|&col| {
                            value
                                .find_matrix_element(row, col as usize)
                                .map(|(flat, _)| flat as u32)
                        })
                        .collect();
                    ws.stash_mut(out).extend_offset(&flats, range.start as u32);
                }
            }
        }
    }
}
