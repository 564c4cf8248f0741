//! Adjoint force propagation.
//!
//! Downstream consumers register forces on a chain's stored outputs; `apply`
//! folds them through the chain's derivatives into a single vector indexed by
//! the chain-wide derivative space, then distributes each range of that
//! vector to its source: stored upstream values receive accumulated forces
//! (consumed when their own chain applies), and nodes claiming external
//! inputs receive their slice through `scatter_input_forces`.
//!
//! Scalar outputs carry a dense derivative block, so their adjoint is a
//! single axpy over the stored block with no second task loop. Forces on
//! vector and matrix outputs re-run the task loop in force mode, striped and
//! reduced exactly like the value pass.

use crate::comm::Communicator;
use crate::error::ChainError;
use crate::float::Float;
use crate::graph::Graph;
use crate::node::NodeId;
use crate::plan::{DerivSource, EvalPlan};
use crate::runner::{local_pass, Pass, RunOptions};
use crate::value::ValueRef;

/// Propagate the forces registered on `id`'s outputs to their inputs.
///
/// Forces on rank>0 outputs are driven by the chain head: calling this on a
/// fused mid-chain node propagates only that node's scalar outputs.
pub fn apply<F: Float>(
    graph: &mut Graph<F>,
    id: NodeId,
    comm: &dyn Communicator<F>,
) -> Result<(), ChainError> {
    apply_with(graph, id, comm, RunOptions::default())
}

pub fn apply_with<F: Float>(
    graph: &mut Graph<F>,
    id: NodeId,
    comm: &dyn Communicator<F>,
    opts: RunOptions,
) -> Result<(), ChainError> {
    let head = graph.head_of(id);
    let plan = EvalPlan::build(graph, head)?;
    let mut forces = vec![F::zero(); plan.num_derivatives];
    let mut any = false;
    let mut consumed: Vec<ValueRef> = Vec::new();

    // Scalar outputs: fold force * stored dense derivative block.
    for comp in 0..graph.num_components(id) {
        let vref = ValueRef::new(id, comp);
        let value = graph.value(vref);
        if value.rank() == 0 && value.spec.has_derivatives && value.force_was_added() {
            let f = value.force(0);
            for (j, &d) in value.derivatives().iter().enumerate() {
                forces[j] += f * d;
            }
            consumed.push(vref);
            any = true;
        }
    }

    // Vector and matrix outputs: second task loop in force mode.
    if id == head {
        let mut forced = false;
        for &member in &plan.chain {
            for comp in 0..graph.num_components(member) {
                let vref = ValueRef::new(member, comp);
                let value = graph.value(vref);
                if value.rank() > 0 && value.spec.stored && value.force_was_added() {
                    consumed.push(vref);
                    forced = true;
                }
            }
        }
        if forced {
            let mut local = local_pass(
                graph,
                &plan,
                comm.rank(),
                comm.size(),
                opts.max_threads,
                Pass::Forces,
            );
            comm.sum(&mut local);
            for (f, l) in forces.iter_mut().zip(local) {
                *f += l;
            }
            any = true;
        }
    }

    if !any {
        return Ok(());
    }
    distribute(graph, &plan, &forces);
    for vref in consumed {
        graph.value_mut(vref).clear_forces();
    }
    Ok(())
}

/// Hand each derivative range its slice of the folded force vector.
fn distribute<F: Float>(graph: &mut Graph<F>, plan: &EvalPlan, forces: &[F]) {
    for &(source, range) in plan.ranges() {
        match source {
            DerivSource::Value(vref) => {
                for k in 0..range.len {
                    let f = forces[range.start + k];
                    if f != F::zero() {
                        graph.value_mut(vref).add_force(k, f);
                    }
                }
            }
            DerivSource::Inputs(node) => {
                graph
                    .node_mut(node)
                    .scatter_input_forces(&forces[range.start..range.end()]);
            }
        }
    }
}
