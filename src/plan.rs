//! Per-evaluation plan: slot, buffer and derivative-range allocation.
//!
//! The plan is rebuilt from the chain each time `run_all` is entered, since
//! the task-domain size may change between steps. Nothing here mutates the
//! graph: slot indices, buffer offsets and derivative ranges live in the
//! plan, keyed by value and node identity.

use std::collections::{HashMap, HashSet};

use crate::error::ChainError;
use crate::float::Float;
use crate::graph::Graph;
use crate::node::NodeId;
use crate::value::ValueRef;

/// A contiguous block of derivative indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DerivRange {
    pub start: usize,
    pub len: usize,
}

impl DerivRange {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// What a derivative range belongs to: a stored value consumed by the chain,
/// or a node's own external-input block (e.g. 3 per site plus 9 for the
/// cell). Identity-keyed so that two consumers sharing an argument never
/// reserve the same range twice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DerivSource {
    Value(ValueRef),
    Inputs(NodeId),
}

/// The evaluation plan for one chain.
pub struct EvalPlan {
    /// Execution order, head first.
    pub chain: Vec<NodeId>,
    pub num_tasks: usize,
    pub num_quantities: usize,
    pub num_derivatives: usize,
    pub buffer_len: usize,
    pub max_columns: usize,
    pub num_stashes: usize,
    pub has_matrix: bool,
    slots: HashMap<ValueRef, usize>,
    buf_start: HashMap<ValueRef, usize>,
    /// Ordered arena of derivative ranges, prefix-summed in chain order.
    ranges: Vec<(DerivSource, DerivRange)>,
    range_index: HashMap<DerivSource, usize>,
    stash_pos: HashMap<ValueRef, usize>,
    members: HashSet<NodeId>,
}

impl EvalPlan {
    /// Build the plan for the chain headed by `head`.
    ///
    /// Fails with [`ChainError::TaskCountMismatch`] if any output component
    /// in the chain disagrees on the task-domain size; this is detected here,
    /// before any task executes.
    pub fn build<F: Float>(graph: &Graph<F>, head: NodeId) -> Result<EvalPlan, ChainError> {
        let chain: Vec<NodeId> = graph.chain_of(head).to_vec();
        debug_assert_eq!(chain.first(), Some(&head), "plan built off a non-head node");

        let members: HashSet<NodeId> = chain.iter().copied().collect();

        // Step 1: task-domain size, agreed by every component in the chain.
        let num_tasks = Self::task_count(graph, &chain)?;

        // Step 2: streamed-quantity slots. Arguments first, then outputs,
        // walking head to tail; shared arguments keep their first slot.
        let mut slots: HashMap<ValueRef, usize> = HashMap::new();
        let mut num_quantities = 0;
        for &id in &chain {
            for &arg in graph.node(id).arguments() {
                slots.entry(arg).or_insert_with(|| {
                    let s = num_quantities;
                    num_quantities += 1;
                    s
                });
            }
            for comp in 0..graph.num_components(id) {
                let vref = ValueRef::new(id, comp);
                slots.entry(vref).or_insert_with(|| {
                    let s = num_quantities;
                    num_quantities += 1;
                    s
                });
            }
        }

        // Step 3: derivative ranges, prefix-summed in chain order. A stored
        // argument reserves one index per stored element, exactly once per
        // owning value; each node then reserves its own external-input block.
        let mut ranges: Vec<(DerivSource, DerivRange)> = Vec::new();
        let mut range_index: HashMap<DerivSource, usize> = HashMap::new();
        let mut num_derivatives = 0;
        for &id in &chain {
            for &arg in graph.node(id).arguments() {
                // In-chain arguments flow through the stream and carry their
                // sparsity by chain rule; only out-of-chain values claim a
                // block of the derivative space.
                if members.contains(&arg.node) {
                    continue;
                }
                let value = graph.value(arg);
                let source = DerivSource::Value(arg);
                if range_index.contains_key(&source) {
                    continue;
                }
                let len = if value.spec.stored {
                    value.stored_len()
                } else {
                    value.spec.kind.num_elements()
                };
                range_index.insert(source, ranges.len());
                ranges.push((
                    source,
                    DerivRange {
                        start: num_derivatives,
                        len,
                    },
                ));
                num_derivatives += len;
            }
            let claimed = graph.node(id).num_input_derivatives();
            if claimed > 0 {
                let source = DerivSource::Inputs(id);
                range_index.insert(source, ranges.len());
                ranges.push((
                    source,
                    DerivRange {
                        start: num_derivatives,
                        len: claimed,
                    },
                ));
                num_derivatives += claimed;
            }
        }

        // Step 4: buffer offsets, disjoint and monotone in chain order.
        // Scalar reductions contribute 1 + num_derivatives when they carry a
        // dense derivative block; stored vectors and matrices contribute
        // their stored length; streamed intermediates contribute nothing.
        let mut buf_start: HashMap<ValueRef, usize> = HashMap::new();
        let mut buffer_len = 0;
        for &id in &chain {
            for comp in 0..graph.num_components(id) {
                let vref = ValueRef::new(id, comp);
                let value = graph.value(vref);
                buf_start.insert(vref, buffer_len);
                buffer_len += match value.rank() {
                    0 => {
                        if value.spec.has_derivatives {
                            1 + num_derivatives
                        } else {
                            1
                        }
                    }
                    _ if value.spec.stored => value.stored_len(),
                    _ => 0,
                };
            }
        }

        // Step 5: row stashes for every rank-2 value in the chain.
        let mut stash_pos: HashMap<ValueRef, usize> = HashMap::new();
        let mut max_columns = 0;
        let mut has_matrix = false;
        for &id in &chain {
            if graph.node(id).matrix().is_some() {
                has_matrix = true;
            }
            for comp in 0..graph.num_components(id) {
                let vref = ValueRef::new(id, comp);
                let value = graph.value(vref);
                if value.rank() == 2 {
                    stash_pos.insert(vref, stash_pos.len());
                    max_columns = max_columns.max(value.num_columns());
                }
            }
        }

        Ok(EvalPlan {
            num_stashes: stash_pos.len(),
            chain,
            num_tasks,
            num_quantities,
            num_derivatives,
            buffer_len,
            max_columns,
            has_matrix,
            slots,
            buf_start,
            ranges,
            range_index,
            stash_pos,
            members,
        })
    }

    fn task_count<F: Float>(graph: &Graph<F>, chain: &[NodeId]) -> Result<usize, ChainError> {
        let head = chain[0];
        let first = graph.value(ValueRef::new(head, 0));
        // A reduction heading its own chain has no shape of its own: its
        // task domain is the first shape dimension of its first argument.
        let expected = if first.rank() == 0 {
            match graph.node(head).arguments().first() {
                Some(&arg) => graph.value(arg).spec.kind.task_count(),
                None => 1,
            }
        } else if first.spec.has_derivatives {
            first.spec.kind.num_elements()
        } else {
            first.spec.kind.task_count()
        };
        for &id in chain {
            for comp in 0..graph.num_components(id) {
                let value = graph.value(ValueRef::new(id, comp));
                let found = if value.rank() == 0 {
                    match graph.node(id).arguments().first() {
                        Some(&arg) => graph.value(arg).spec.kind.task_count(),
                        None => continue,
                    }
                } else if value.spec.has_derivatives {
                    value.spec.kind.num_elements()
                } else {
                    value.spec.kind.task_count()
                };
                if found != expected {
                    return Err(ChainError::TaskCountMismatch {
                        label: graph.node(id).label().to_string(),
                        expected,
                        found,
                    });
                }
            }
        }
        Ok(expected)
    }

    pub fn in_chain(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    /// Streamed-quantity slot of a value. Panics for values outside the
    /// chain: that indicates a defect in chain construction.
    pub fn slot(&self, value: ValueRef) -> usize {
        *self
            .slots
            .get(&value)
            .expect("value has no streamed-quantity slot in this chain")
    }

    pub fn buf_start(&self, value: ValueRef) -> usize {
        *self
            .buf_start
            .get(&value)
            .expect("value has no buffer offset in this chain")
    }

    pub fn value_range(&self, value: ValueRef) -> Option<DerivRange> {
        self.range_index
            .get(&DerivSource::Value(value))
            .map(|&k| self.ranges[k].1)
    }

    pub fn inputs_range(&self, node: NodeId) -> Option<DerivRange> {
        self.range_index
            .get(&DerivSource::Inputs(node))
            .map(|&k| self.ranges[k].1)
    }

    /// The ordered derivative-range arena.
    pub fn ranges(&self) -> &[(DerivSource, DerivRange)] {
        &self.ranges
    }

    pub fn stash(&self, value: ValueRef) -> usize {
        *self
            .stash_pos
            .get(&value)
            .expect("value has no row stash in this chain")
    }

    pub fn try_stash(&self, value: ValueRef) -> Option<usize> {
        self.stash_pos.get(&value).copied()
    }

    pub fn slots(&self) -> &HashMap<ValueRef, usize> {
        &self.slots
    }
}
