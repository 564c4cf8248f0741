//! Computation units and their capability interfaces.
//!
//! A [`Node`] reads zero or more argument values produced upstream and writes
//! one or more output values. During the task loop it only ever touches the
//! per-task [`Workspace`]; the graph's values are read-only until the runner
//! scatters the reduced buffer back. Matrix-producing nodes additionally
//! expose the [`MatrixNode`] capability, which the runner drives one row per
//! task.

use crate::float::Float;
use crate::graph::Graph;
use crate::plan::{DerivRange, EvalPlan};
use crate::value::{Value, ValueRef, ValueSpec};
use crate::workspace::Workspace;

/// Handle of a node inside a [`Graph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A unit of computation in the task stream.
///
/// Implementations must be pure during `perform_task`: a task reads the
/// graph through the [`EvalContext`] and writes only into the workspace.
pub trait Node<F: Float>: Send + Sync {
    /// Unique label, used in every diagnostic.
    fn label(&self) -> &str;

    /// Output component descriptions, consumed once when the node is added.
    fn output_specs(&self) -> Vec<ValueSpec<F>>;

    /// Upstream values this node consumes, in argument order.
    fn arguments(&self) -> &[ValueRef];

    /// Inactive nodes are skipped by the task loop.
    fn is_active(&self) -> bool {
        true
    }

    /// May this node be evaluated after `earlier` inside one chain?
    fn can_follow(&self, _earlier: &dyn Node<F>) -> bool {
        true
    }

    /// Declared property replacing upstream type inspection: consumers of
    /// this node's outputs must not fuse with it.
    fn renders_chain_unsafe(&self) -> bool {
        false
    }

    /// Number of derivative indices this node claims for its own external
    /// inputs. An atomistic node claims 3 per site plus 9 for the cell; a
    /// plain data source claims one per element. Zero for pure functions.
    fn num_input_derivatives(&self) -> usize {
        0
    }

    /// Compute one task into the workspace's slots and sparse derivative
    /// records. Must not mutate anything outside the workspace.
    fn perform_task(&self, me: NodeId, task: usize, ctx: &EvalContext<'_, F>, ws: &mut Workspace<F>);

    /// Post-reduction hook with the full buffer visible, run once per
    /// evaluation after the scatter (normalization, final nonlinearity).
    fn finalize(&self, _buffer: &[F], _plan: &EvalPlan, _values: &mut [Value<F>]) {}

    /// Receive this node's slice of the adjoint force vector.
    fn scatter_input_forces(&mut self, _forces: &[F]) {}

    /// Forces accumulated on this node's external inputs by adjoint passes,
    /// one per claimed derivative index. Empty for pure functions.
    fn input_forces(&self) -> &[F] {
        &[]
    }

    fn reset_input_forces(&mut self) {}

    /// Matrix capability accessor.
    fn matrix(&self) -> Option<&dyn MatrixNode<F>> {
        None
    }
}

/// Capability of matrix-valued nodes: one task evaluates one row.
pub trait MatrixNode<F: Float>: Send + Sync {
    /// Column capacity of the output store; sparse rows never exceed it.
    fn num_columns(&self) -> usize;

    /// Column indices visited for `row`. Consumes the externally maintained
    /// neighbor list; the engine never builds one.
    fn active_columns(&self, row: usize, ctx: &EvalContext<'_, F>, cols: &mut Vec<u32>);

    /// Compute one matrix element into the workspace.
    fn compute_element(
        &self,
        me: NodeId,
        row: usize,
        col: usize,
        ctx: &EvalContext<'_, F>,
        ws: &mut Workspace<F>,
    );

    /// Invoked once after every column of `row`; populates the row stash of
    /// each output with the de-duplicated derivative indices for the row.
    fn end_of_row(
        &self,
        me: NodeId,
        row: usize,
        cols: &[u32],
        ctx: &EvalContext<'_, F>,
        ws: &mut Workspace<F>,
    );
}

/// Read-only view of the graph and plan handed to every task.
pub struct EvalContext<'a, F: Float> {
    pub graph: &'a Graph<F>,
    pub plan: &'a EvalPlan,
}

impl<'a, F: Float> EvalContext<'a, F> {
    /// Streamed-quantity slot of a value in this chain.
    pub fn slot(&self, value: ValueRef) -> usize {
        self.plan.slot(value)
    }

    /// Slot of one of the current node's own outputs.
    pub fn out_slot(&self, me: NodeId, comp: usize) -> usize {
        self.plan.slot(ValueRef::new(me, comp))
    }

    /// Whether an argument is read from the shared workspace rather than
    /// from its random-access store. In-chain values stream even when a
    /// store is also kept.
    pub fn is_streamed(&self, value: ValueRef) -> bool {
        self.plan.in_chain(value.node)
    }

    pub fn value(&self, value: ValueRef) -> &'a Value<F> {
        self.graph.value(value)
    }

    /// Derivative range reserved for a stored argument value.
    pub fn value_deriv_range(&self, value: ValueRef) -> DerivRange {
        self.plan.value_range(value).unwrap_or_else(|| {
            panic!(
                "no derivative range reserved for {}: upstream storage was never built",
                self.graph.value(value).name()
            )
        })
    }

    /// Derivative range reserved for a node's own external inputs.
    pub fn input_deriv_range(&self, node: NodeId) -> DerivRange {
        self.plan.inputs_range(node).unwrap_or_else(|| {
            panic!(
                "node {} claims no input derivatives",
                self.graph.node(node).label()
            )
        })
    }

    /// Row-stash slot of a rank-2 value in this chain.
    pub fn stash(&self, value: ValueRef) -> usize {
        self.plan.stash(value)
    }

    pub fn num_derivatives(&self) -> usize {
        self.plan.num_derivatives
    }

    pub fn num_tasks(&self) -> usize {
        self.plan.num_tasks
    }
}
