//! The node graph and its fused chains.
//!
//! Nodes live in an arena keyed by [`NodeId`]. Every node belongs to exactly
//! one chain (initially a singleton); adding a node walks its argument
//! dependencies and tries to append it to the chain of the nodes that
//! produce them, merging upstream chains first. A node that cannot join any
//! candidate falls back to non-fused mode: its upstream arguments are forced
//! to build random-access stores and are pulled by index instead of through
//! the shared workspace.
//!
//! Chain topology is build-once, read-many: nothing mutates it after setup,
//! so the task loop reads it without synchronization.

use crate::error::ChainError;
use crate::float::Float;
use crate::node::{Node, NodeId};
use crate::value::{Value, ValueRef};

struct Entry<F: Float> {
    node: Box<dyn Node<F>>,
    values: Vec<Value<F>>,
    chain: usize,
}

/// Arena of nodes, their output values, and the chains fusing them.
pub struct Graph<F: Float> {
    entries: Vec<Entry<F>>,
    chains: Vec<Vec<NodeId>>,
}

impl<F: Float> Default for Graph<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Float> Graph<F> {
    pub fn new() -> Self {
        Graph {
            entries: Vec::new(),
            chains: Vec::new(),
        }
    }

    /// Add a node and fuse it with the chain of its arguments where
    /// possible. Nodes must be added in dependency order.
    pub fn add_node(&mut self, node: Box<dyn Node<F>>) -> Result<NodeId, ChainError> {
        if self.find_by_label(node.label()).is_some() {
            return Err(ChainError::DuplicateLabel {
                label: node.label().to_string(),
            });
        }
        for &arg in node.arguments() {
            assert!(
                arg.node.index() < self.entries.len()
                    && arg.comp < self.entries[arg.node.index()].values.len(),
                "argument of {} refers to a value that does not exist yet",
                node.label()
            );
        }

        let mut values: Vec<Value<F>> = node
            .output_specs()
            .into_iter()
            .map(Value::new)
            .collect();
        if let Some(matrix) = node.matrix() {
            let cap = matrix.num_columns();
            for value in values.iter_mut().filter(|v| v.rank() == 2) {
                value.reshape_columns(cap);
            }
        }

        let id = NodeId(self.entries.len() as u32);
        let chain = self.chains.len();
        self.chains.push(vec![id]);
        self.entries.push(Entry {
            node,
            values,
            chain,
        });
        self.build_argument_store(id)?;
        Ok(id)
    }

    /// Walk the new node's arguments, merge the chains supplying them and
    /// attempt the join. On any non-fatal failure, fall back to non-fused
    /// mode by forcing every rank>0 argument to store its data.
    fn build_argument_store(&mut self, id: NodeId) -> Result<(), ChainError> {
        let args: Vec<ValueRef> = self.node(id).arguments().to_vec();
        if args.is_empty() {
            return Ok(());
        }

        let mut fuse = true;
        for &arg in &args {
            let value = self.value(arg);
            // Field-like values (dense per-element derivatives) never fuse.
            if value.rank() > 0 && value.spec.has_derivatives {
                fuse = false;
            }
            if self.node(arg.node).renders_chain_unsafe() {
                fuse = false;
            }
        }

        if fuse {
            let alabels: Vec<String> = {
                let mut l: Vec<String> = Vec::new();
                for &arg in &args {
                    let label = self.node(arg.node).label().to_string();
                    if !l.contains(&label) {
                        l.push(label);
                    }
                }
                l
            };

            // Distinct chain heads of the rank>0 arguments; these chains
            // must be merged before the join.
            let mut heads: Vec<NodeId> = Vec::new();
            for &arg in &args {
                if self.value(arg).rank() == 0 {
                    continue;
                }
                let head = self.head_of(arg.node);
                if !heads.contains(&head) {
                    heads.push(head);
                }
            }

            let mut joined = false;
            if !heads.is_empty() {
                let target = self.entries[heads[0].index()].chain;
                let first_label = vec![self.node(heads[0]).label().to_string()];
                let mut merged = true;
                for &head in &heads[1..] {
                    if !self.try_join(target, &first_label, head)? {
                        merged = false;
                        break;
                    }
                }
                if merged {
                    // Append this node to the chain of any rank>0 argument.
                    for &arg in &args {
                        if self.value(arg).rank() == 0 {
                            continue;
                        }
                        let chain = self.entries[arg.node.index()].chain;
                        if self.try_join(chain, &alabels, id)? {
                            joined = true;
                            break;
                        }
                    }
                }
            }
            if joined {
                return Ok(());
            }
        }

        // Non-fused fallback: pull every rank>0 argument by random access.
        for &arg in &args {
            if self.value(arg).rank() > 0 {
                self.value_mut(arg).build_data_store();
            }
        }
        Ok(())
    }

    /// Append the chain headed by `id` to the tail of `target`.
    ///
    /// Returns `Ok(true)` on success or when `id` is already a member,
    /// `Ok(false)` when fusion is not possible (the caller falls back to
    /// stored arguments), and an error when the join would violate a
    /// required evaluation order.
    fn try_join(
        &mut self,
        target: usize,
        candidate_labels: &[String],
        id: NodeId,
    ) -> Result<bool, ChainError> {
        let own = self.entries[id.index()].chain;
        if own == target {
            return Ok(true);
        }
        if self.chains[own].first() != Some(&id) {
            return Err(ChainError::AlreadyChained {
                label: self.node(id).label().to_string(),
            });
        }

        // Matrix chains fuse only matrix nodes: a row-driven task loop and a
        // plain vector task loop cannot share one workspace pass.
        let target_matrix = self.chains[target]
            .iter()
            .any(|&n| self.node(n).matrix().is_some());
        let joining_matrix = self.chains[own]
            .iter()
            .any(|&n| self.node(n).matrix().is_some());
        if target_matrix != joining_matrix {
            return Ok(false);
        }

        // Everything the node needs must already be computed in the target
        // chain, unless the upstream stores all of its outputs.
        let chain_labels: Vec<&str> = self.chains[target]
            .iter()
            .map(|&n| self.node(n).label())
            .collect();
        if chain_labels.contains(&self.node(id).label()) {
            return Ok(true);
        }
        for label in candidate_labels {
            if chain_labels.iter().any(|l| l == label) {
                continue;
            }
            let supplier = self
                .find_by_label(label)
                .expect("candidate label names a node that was never added");
            let stores_all = self.entries[supplier.index()]
                .values
                .iter()
                .all(|v| v.spec.stored);
            if !stores_all {
                return Ok(false);
            }
        }

        // Validate the required evaluation order over the joined sequence.
        let order: Vec<NodeId> = self.chains[target]
            .iter()
            .chain(self.chains[own].iter())
            .copied()
            .collect();
        for j in 1..order.len() {
            for i in 0..j {
                let later = self.node(order[j]);
                let earlier = self.node(order[i]);
                if !later.can_follow(earlier) {
                    return Err(ChainError::OrderViolation {
                        earlier: earlier.label().to_string(),
                        later: later.label().to_string(),
                    });
                }
            }
        }

        let moved = std::mem::take(&mut self.chains[own]);
        for &n in &moved {
            self.entries[n.index()].chain = target;
        }
        self.chains[target].extend(moved);
        Ok(true)
    }

    // ── accessors ──

    pub fn node(&self, id: NodeId) -> &dyn Node<F> {
        self.entries[id.index()].node.as_ref()
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut dyn Node<F> {
        self.entries[id.index()].node.as_mut()
    }

    pub fn num_nodes(&self) -> usize {
        self.entries.len()
    }

    pub fn num_components(&self, id: NodeId) -> usize {
        self.entries[id.index()].values.len()
    }

    pub fn value(&self, vref: ValueRef) -> &Value<F> {
        &self.entries[vref.node.index()].values[vref.comp]
    }

    pub fn value_mut(&mut self, vref: ValueRef) -> &mut Value<F> {
        &mut self.entries[vref.node.index()].values[vref.comp]
    }

    pub fn find_by_label(&self, label: &str) -> Option<NodeId> {
        self.entries
            .iter()
            .position(|e| e.node.label() == label)
            .map(|i| NodeId(i as u32))
    }

    /// The chain containing `id`, head first.
    pub fn chain_containing(&self, id: NodeId) -> &[NodeId] {
        &self.chains[self.entries[id.index()].chain]
    }

    /// The chain headed by `head`. Identical to [`chain_containing`] but
    /// asserts the caller holds the head.
    pub(crate) fn chain_of(&self, head: NodeId) -> &[NodeId] {
        let chain = self.chain_containing(head);
        debug_assert_eq!(chain.first(), Some(&head));
        chain
    }

    pub fn head_of(&self, id: NodeId) -> NodeId {
        self.chain_containing(id)[0]
    }

    pub fn is_chain_head(&self, id: NodeId) -> bool {
        self.head_of(id) == id
    }

    /// Register an external force on one stored element of a value.
    pub fn add_force(&mut self, vref: ValueRef, element: usize, force: F) {
        self.value_mut(vref).add_force(element, force);
    }

    /// Sizing query: total number of chain-input derivatives seen by `id`.
    pub fn num_derivatives(&self, id: NodeId) -> Result<usize, ChainError> {
        let head = self.head_of(id);
        Ok(crate::plan::EvalPlan::build(self, head)?.num_derivatives)
    }

    pub(crate) fn split_entry(
        &mut self,
        id: NodeId,
    ) -> (&mut dyn Node<F>, &mut [Value<F>]) {
        let entry = &mut self.entries[id.index()];
        (entry.node.as_mut(), entry.values.as_mut_slice())
    }
}
