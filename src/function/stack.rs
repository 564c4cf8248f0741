//! Stacking vectors into the columns of a matrix.

use crate::error::ChainError;
use crate::float::Float;
use crate::graph::Graph;
use crate::node::{EvalContext, MatrixNode, Node, NodeId};
use crate::value::{Periodicity, ValueRef, ValueSpec};
use crate::workspace::Workspace;

/// Stacks equal-length vector arguments into an `n x k` matrix, one argument
/// per column. The stack heads a row-driven chain, so matrix functions of it
/// fuse downstream; the vector arguments themselves are read through their
/// stores and each keeps its own derivative range.
#[derive(Debug)]
pub struct VStack<F: Float> {
    label: String,
    args: Vec<ValueRef>,
    len: usize,
    periodicity: Periodicity<F>,
}

impl<F: Float> VStack<F> {
    /// Validate that every argument is a plain vector of the same length
    /// and periodic domain.
    pub fn new(
        graph: &Graph<F>,
        label: impl Into<String>,
        args: Vec<ValueRef>,
    ) -> Result<Self, ChainError> {
        let label = label.into();
        let mut len = 0;
        let mut periodicity = Periodicity::NotPeriodic;
        for (i, &arg) in args.iter().enumerate() {
            let value = graph.value(arg);
            if value.rank() != 1 || value.spec.has_derivatives {
                return Err(ChainError::UnsupportedArgument {
                    label,
                    argument: value.name().to_string(),
                    reason: "every stacked argument must be a plain vector".into(),
                });
            }
            let alen = value.spec.kind.num_elements();
            if i == 0 {
                len = alen;
                periodicity = value.spec.periodicity;
            } else if alen != len {
                return Err(ChainError::ArgumentMismatch {
                    label,
                    reason: format!(
                        "{} has {} entries but an earlier argument has {}",
                        value.name(),
                        alen,
                        len
                    ),
                });
            } else if value.spec.periodicity != periodicity {
                return Err(ChainError::ArgumentMismatch {
                    label,
                    reason: format!(
                        "domain of {} differs from the other stacked arguments",
                        value.name()
                    ),
                });
            }
        }
        if args.is_empty() {
            return Err(ChainError::ArgumentMismatch {
                label,
                reason: "at least one vector argument is required".into(),
            });
        }

        Ok(VStack {
            label,
            args,
            len,
            periodicity,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.len, self.args.len())
    }
}

impl<F: Float> Node<F> for VStack<F> {
    fn label(&self) -> &str {
        &self.label
    }

    fn output_specs(&self) -> Vec<ValueSpec<F>> {
        let spec = ValueSpec::matrix(self.label.clone(), self.len, self.args.len());
        match self.periodicity {
            Periodicity::Domain { min, max } => vec![spec.periodic(min, max)],
            Periodicity::NotPeriodic => vec![spec],
        }
    }

    fn arguments(&self) -> &[ValueRef] {
        &self.args
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

    fn matrix(&self) -> Option<&dyn MatrixNode<F>> {
        Some(self)
    }
}

impl<F: Float> MatrixNode<F> for VStack<F> {
    fn num_columns(&self) -> usize {
        self.args.len()
    }

    fn active_columns(&self, _row: usize, _ctx: &EvalContext<'_, F>, cols: &mut Vec<u32>) {
        cols.extend(0..self.args.len() as u32);
    }

    fn compute_element(
        &self,
        me: NodeId,
        row: usize,
        col: usize,
        ctx: &EvalContext<'_, F>,
        ws: &mut Workspace<F>,
    ) {
        let arg = self.args[col];
        let out = ctx.out_slot(me, 0);
        ws.set_value(out, ctx.value(arg).get(row));
        let idx = ctx.value_deriv_range(arg).start + row;
        ws.add_derivative(out, idx, F::one());
        ws.update_index(out, idx);
    }

    fn end_of_row(
        &self,
        me: NodeId,
        row: usize,
        _cols: &[u32],
        ctx: &EvalContext<'_, F>,
        ws: &mut Workspace<F>,
    ) {
        let out = ctx.stash(ValueRef::new(me, 0));
        for &arg in &self.args {
            let range = ctx.value_deriv_range(arg);
            ws.stash_mut(out)
                .extend_offset(&[row as u32], range.start as u32);
        }
    }
}
