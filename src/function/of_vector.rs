//! An element function mapped over a vector task domain.

use super::ElementFunction;
use crate::error::ChainError;
use crate::float::Float;
use crate::graph::Graph;
use crate::node::{EvalContext, Node, NodeId};
use crate::plan::EvalPlan;
use crate::value::{Value, ValueRef, ValueSpec};
use crate::workspace::Workspace;

/// Applies an [`ElementFunction`] to each entry of its vector arguments.
/// Scalar arguments are broadcast; a zero-rank function reduces the whole
/// domain to scalars instead.
pub struct FunctionOfVector<F: Float, T: ElementFunction<F>> {
    label: String,
    func: T,
    args: Vec<ValueRef>,
    len: usize,
    specs: Vec<ValueSpec<F>>,
}

impl<F: Float, T: ElementFunction<F>> FunctionOfVector<F, T> {
    /// Validate argument shapes against the graph and build the node.
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
        let mut len: Option<usize> = None;
        for &arg in &args {
            let value = graph.value(arg);
            match value.rank() {
                0 => {}
                1 => {
                    let alen = value.spec.kind.num_elements();
                    match len {
                        None => len = Some(alen),
                        Some(l) if alen != l => {
                            return Err(ChainError::ArgumentMismatch {
                                label,
                                reason: format!(
                                    "{} has {} entries but an earlier argument has {}",
                                    value.name(),
                                    alen,
                                    l
                                ),
                            });
                        }
                        Some(_) => {}
                    }
                }
                _ => {
                    return Err(ChainError::UnsupportedArgument {
                        label,
                        argument: value.name().to_string(),
                        reason: "matrix arguments need the matrix form of this node".into(),
                    });
                }
            }
        }
        let Some(len) = len else {
            return Err(ChainError::ArgumentMismatch {
                label,
                reason: "at least one vector argument is required".into(),
            });
        };

        let ncomp = func.num_components();
        let specs = (0..ncomp)
            .map(|c| {
                let name = if ncomp == 1 {
                    label.clone()
                } else {
                    format!("{label}.{c}")
                };
                let spec = if func.zero_rank() {
                    ValueSpec::scalar(name)
                } else {
                    ValueSpec::vector(name, len)
                };
                match func.periodic_domain() {
                    Some((min, max)) => spec.periodic(min, max),
                    None => spec,
                }
            })
            .collect();

        Ok(FunctionOfVector {
            label,
            func,
            args,
            len,
            specs,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<F: Float, T: ElementFunction<F>> Node<F> for FunctionOfVector<F, T> {
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
        me: NodeId,
        task: usize,
        ctx: &EvalContext<'_, F>,
        ws: &mut Workspace<F>,
    ) {
        let nargs = self.args.len();
        let ncomp = self.func.num_components();
        let mut argv = vec![F::zero(); nargs];
        let mut vals = vec![F::zero(); ncomp];
        let mut derivs = vec![F::zero(); ncomp * nargs];

        for (i, &arg) in self.args.iter().enumerate() {
            let value = ctx.value(arg);
            argv[i] = if value.rank() == 0 {
                value.get(0)
            } else if ctx.is_streamed(arg) {
                ws.get(ctx.slot(arg))
            } else {
                value.get(task)
            };
        }

        self.func.calc(&argv, &mut vals, &mut derivs);

        for c in 0..ncomp {
            let out = ctx.out_slot(me, c);
            ws.add_value(out, vals[c]);
            for (i, &arg) in self.args.iter().enumerate() {
                let d = derivs[c * nargs + i];
                if d == F::zero() {
                    continue;
                }
                let value = ctx.value(arg);
                if value.rank() > 0 && ctx.is_streamed(arg) {
                    // Chain rule through the upstream slot's sparse record.
                    let aslot = ctx.slot(arg);
                    for k in 0..ws.num_active(aslot) {
                        let idx = ws.active_index(aslot, k);
                        ws.add_derivative(out, idx, d * ws.derivative(aslot, idx));
                        ws.update_index(out, idx);
                    }
                } else {
                    let range = ctx.value_deriv_range(arg);
                    let idx = if value.rank() == 0 {
                        range.start
                    } else {
                        range.start + task
                    };
                    ws.add_derivative(out, idx, d);
                    ws.update_index(out, idx);
                }
            }
        }
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
}
