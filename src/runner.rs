//! Parallel task runner with deterministic reduction.
//!
//! One evaluation of a chain is: build the plan, stripe the task domain over
//! the communicator's ranks, split each rank's tasks into fair chunks over a
//! rayon pool, accumulate each worker into a private buffer, merge the
//! private buffers in worker order, all-reduce across ranks, then scatter the
//! reduced buffer back into the graph's stored values. Workers never write
//! shared state and the merge order is fixed by worker index, so a given
//! configuration reproduces the same result run to run regardless of
//! scheduling.

use rayon::prelude::*;

use crate::comm::Communicator;
use crate::error::ChainError;
use crate::float::Float;
use crate::graph::Graph;
use crate::node::{EvalContext, NodeId};
use crate::plan::EvalPlan;
use crate::value::ValueRef;
use crate::workspace::Workspace;

/// What the task loop accumulates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Pass {
    /// Values and scalar derivative blocks into the chain buffer.
    Values,
    /// Adjoint forces into a `num_derivatives`-long force vector.
    Forces,
}

/// Knobs for one evaluation.
pub struct RunOptions {
    /// Upper bound on rayon workers per rank. The runner lowers this so each
    /// worker keeps roughly ten tasks; tiny task domains run serially.
    pub max_threads: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            max_threads: rayon::current_num_threads(),
        }
    }
}

/// Evaluate the chain headed by `head` and scatter the results into its
/// stored values. A no-op when `head` is fused mid-chain: the chain head
/// drives every member.
pub fn run_all<F: Float>(
    graph: &mut Graph<F>,
    head: NodeId,
    comm: &dyn Communicator<F>,
) -> Result<(), ChainError> {
    run_with(graph, head, comm, RunOptions::default())
}

pub fn run_with<F: Float>(
    graph: &mut Graph<F>,
    head: NodeId,
    comm: &dyn Communicator<F>,
    opts: RunOptions,
) -> Result<(), ChainError> {
    if !graph.is_chain_head(head) {
        return Ok(());
    }
    let plan = EvalPlan::build(graph, head)?;
    let mut buffer = local_pass(
        graph,
        &plan,
        comm.rank(),
        comm.size(),
        opts.max_threads,
        Pass::Values,
    );
    comm.sum(&mut buffer);
    scatter(graph, &plan, &buffer);
    Ok(())
}

/// This rank's pre-reduction accumulation buffer. Exposed so the striping
/// and merge order can be checked without a real multi-rank communicator.
pub fn local_buffer<F: Float>(
    graph: &Graph<F>,
    head: NodeId,
    rank: usize,
    size: usize,
    max_threads: usize,
) -> Result<Vec<F>, ChainError> {
    let plan = EvalPlan::build(graph, head)?;
    Ok(local_pass(graph, &plan, rank, size, max_threads, Pass::Values))
}

/// Keep roughly ten tasks per worker across the whole communicator.
fn worker_count(max_threads: usize, size: usize, num_tasks: usize) -> usize {
    let mut nt = max_threads.max(1);
    if nt * size * 10 > num_tasks {
        nt = num_tasks / (size * 10);
    }
    nt.max(1)
}

pub(crate) fn local_pass<F: Float>(
    graph: &Graph<F>,
    plan: &EvalPlan,
    rank: usize,
    size: usize,
    max_threads: usize,
    pass: Pass,
) -> Vec<F> {
    let len = match pass {
        Pass::Values => plan.buffer_len,
        Pass::Forces => plan.num_derivatives,
    };
    let size = size.max(1);
    let mut buffer = vec![F::zero(); len];
    let my_tasks: Vec<usize> = (rank..plan.num_tasks).step_by(size).collect();
    if my_tasks.is_empty() {
        return buffer;
    }

    let nt = worker_count(max_threads, size, plan.num_tasks).min(my_tasks.len());
    if nt <= 1 {
        let mut ws = Workspace::new(plan);
        let mut cols = Vec::with_capacity(plan.max_columns);
        for &task in &my_tasks {
            run_task(graph, plan, task, pass, &mut ws, &mut cols, &mut buffer);
        }
    } else {
        let chunk = my_tasks.len().div_ceil(nt);
        let partials: Vec<Vec<F>> = my_tasks
            .par_chunks(chunk)
            .map(|tasks| {
                let mut ws = Workspace::new(plan);
                let mut cols = Vec::with_capacity(plan.max_columns);
                let mut buf = vec![F::zero(); len];
                for &task in tasks {
                    run_task(graph, plan, task, pass, &mut ws, &mut cols, &mut buf);
                }
                buf
            })
            .collect();
        // Merge in worker order so the reduction is order-deterministic.
        for partial in partials {
            for (b, p) in buffer.iter_mut().zip(partial) {
                *b += p;
            }
        }
    }
    buffer
}

fn run_task<F: Float>(
    graph: &Graph<F>,
    plan: &EvalPlan,
    task: usize,
    pass: Pass,
    ws: &mut Workspace<F>,
    cols: &mut Vec<u32>,
    buf: &mut [F],
) {
    ws.clear_all();
    ws.set_task_index(task);
    if plan.has_matrix {
        run_row(graph, plan, task, pass, ws, cols, buf);
    } else {
        let ctx = EvalContext { graph, plan };
        for &id in &plan.chain {
            let node = graph.node(id);
            if !node.is_active() {
                continue;
            }
            node.perform_task(id, task, &ctx, ws);
        }
    }
    gather(graph, plan, task, pass, ws, buf);
}

/// Drive one matrix row: the chain head controls which columns exist, every
/// member computes its element for each column in chain order, rank-2 slots
/// are staged into the row stash and cleared per column while scalar
/// accumulators persist across the row, and the end-of-row hooks run last.
fn run_row<F: Float>(
    graph: &Graph<F>,
    plan: &EvalPlan,
    row: usize,
    pass: Pass,
    ws: &mut Workspace<F>,
    cols: &mut Vec<u32>,
    buf: &mut [F],
) {
    let ctx = EvalContext { graph, plan };
    let head = plan.chain[0];
    let Some(controller) = graph.node(head).matrix() else {
        panic!(
            "chain head {} drives a row loop but is not matrix-valued",
            graph.node(head).label()
        );
    };
    cols.clear();
    controller.active_columns(row, &ctx, cols);
    ws.set_matrix_call(true);

    for &col in cols.iter() {
        for &id in &plan.chain {
            let node = graph.node(id);
            if !node.is_active() {
                continue;
            }
            let Some(matrix) = node.matrix() else {
                panic!(
                    "node {} sits in a matrix chain without the matrix capability",
                    node.label()
                );
            };
            matrix.compute_element(id, row, col as usize, &ctx, ws);
        }
        for &id in &plan.chain {
            for comp in 0..graph.num_components(id) {
                let vref = ValueRef::new(id, comp);
                let value = graph.value(vref);
                if value.rank() != 2 {
                    continue;
                }
                let slot = plan.slot(vref);
                let stash = plan.stash(vref);
                let element = ws.get(slot);
                // Position of this column in the row's sparse store.
                let k = ws.stash(stash).num_entries();
                if value.spec.stored {
                    let flat = row * value.num_columns() + k;
                    match pass {
                        Pass::Values => buf[plan.buf_start(vref) + flat] += element,
                        Pass::Forces => {
                            if value.force_was_added() {
                                let f = value.force(flat);
                                for j in 0..ws.num_active(slot) {
                                    let idx = ws.active_index(slot, j);
                                    buf[idx] += f * ws.derivative(slot, idx);
                                }
                            }
                        }
                    }
                }
                ws.stash_mut(stash).push(col, element);
                ws.clear_slot(slot);
            }
        }
    }

    for &id in &plan.chain {
        let node = graph.node(id);
        if !node.is_active() {
            continue;
        }
        if let Some(matrix) = node.matrix() {
            matrix.end_of_row(id, row, cols, &ctx, ws);
        }
    }
    ws.set_matrix_call(false);
}

/// Fold one finished task's workspace into the accumulation buffer. Rank-2
/// values were already folded per column by the row protocol.
fn gather<F: Float>(
    graph: &Graph<F>,
    plan: &EvalPlan,
    task: usize,
    pass: Pass,
    ws: &Workspace<F>,
    buf: &mut [F],
) {
    for &id in &plan.chain {
        for comp in 0..graph.num_components(id) {
            let vref = ValueRef::new(id, comp);
            let value = graph.value(vref);
            let slot = plan.slot(vref);
            match value.rank() {
                0 => {
                    if pass == Pass::Values {
                        let bs = plan.buf_start(vref);
                        buf[bs] += ws.get(slot);
                        if value.spec.has_derivatives {
                            for k in 0..ws.num_active(slot) {
                                let idx = ws.active_index(slot, k);
                                buf[bs + 1 + idx] += ws.derivative(slot, idx);
                            }
                        }
                    }
                    // Scalar forces are folded from the stored dense
                    // derivative block, not from the task loop.
                }
                2 => {}
                _ => {
                    if !value.spec.stored {
                        continue;
                    }
                    match pass {
                        Pass::Values => buf[plan.buf_start(vref) + task] += ws.get(slot),
                        Pass::Forces => {
                            if value.force_was_added() {
                                let f = value.force(task);
                                for k in 0..ws.num_active(slot) {
                                    let idx = ws.active_index(slot, k);
                                    buf[idx] += f * ws.derivative(slot, idx);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Write the reduced buffer back into stored values, rebuild matrix column
/// bookkeeping from the controlling node, and run the finalize hooks.
fn scatter<F: Float>(graph: &mut Graph<F>, plan: &EvalPlan, buffer: &[F]) {
    // Column lists come from the controller before any value mutates.
    let row_cols: Vec<Vec<u32>> = if plan.has_matrix {
        let ctx = EvalContext {
            graph: &*graph,
            plan,
        };
        let head = plan.chain[0];
        let Some(controller) = graph.node(head).matrix() else {
            panic!(
                "chain head {} drives a row loop but is not matrix-valued",
                graph.node(head).label()
            );
        };
        (0..plan.num_tasks)
            .map(|row| {
                let mut cols = Vec::with_capacity(plan.max_columns);
                controller.active_columns(row, &ctx, &mut cols);
                cols
            })
            .collect()
    } else {
        Vec::new()
    };

    for &id in &plan.chain {
        for comp in 0..graph.num_components(id) {
            let vref = ValueRef::new(id, comp);
            let (rank, stored, has_derivs) = {
                let v = graph.value(vref);
                (v.rank(), v.spec.stored, v.spec.has_derivatives)
            };
            if rank == 0 {
                let bs = plan.buf_start(vref);
                let nd = plan.num_derivatives;
                let value = graph.value_mut(vref);
                value.set(0, buffer[bs]);
                if has_derivs {
                    value.resize_derivatives(nd);
                    for j in 0..nd {
                        value.set_derivative(j, buffer[bs + 1 + j]);
                    }
                }
            } else if stored {
                let bs = plan.buf_start(vref);
                let value = graph.value_mut(vref);
                for k in 0..value.stored_len() {
                    value.set(k, buffer[bs + k]);
                }
                if rank == 2 {
                    for (row, cols) in row_cols.iter().enumerate() {
                        value.set_row_bookkeeping(row, cols);
                    }
                }
            }
        }
    }
    for &id in &plan.chain {
        let (node, values) = graph.split_entry(id);
        node.finalize(buffer, plan, values);
    }
}
