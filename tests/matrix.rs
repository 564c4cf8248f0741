use approx::assert_relative_eq;
use pangolin::stash::RowStash;
use pangolin::{
    apply, run_all, ChainError, Combine, FunctionOfMatrix, Graph, NodeId, Serial, SourceMatrix,
    SourceVector, Sum, VStack, ValueRef,
};

fn dense_data(rows: usize, cols: usize) -> Vec<f64> {
    (0..rows * cols).map(|i| (i + 1) as f64).collect()
}

/// m -> f = scale * m -> s = sum over all elements.
fn build_scaled_sum(
    source: SourceMatrix<f64>,
    scale: f64,
) -> (Graph<f64>, NodeId, NodeId, NodeId) {
    let mut graph = Graph::new();
    let m = graph.add_node(Box::new(source)).unwrap();
    let f = {
        let node = FunctionOfMatrix::new(
            &graph,
            "f",
            Combine::linear(vec![scale]),
            vec![ValueRef::new(m, 0)],
        )
        .unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    let s = {
        let node = FunctionOfMatrix::new(&graph, "s", Sum, vec![ValueRef::new(f, 0)]).unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    (graph, m, f, s)
}

// ── dense rows ──

#[test]
fn matrix_functions_fuse_into_one_row_driven_chain() {
    let (graph, m, f, s) = build_scaled_sum(SourceMatrix::new("m", 3, 3, dense_data(3, 3)), 2.0);
    assert_eq!(graph.chain_containing(s), &[m, f, s]);
}

#[test]
fn dense_matrix_round_trip() {
    let (mut graph, m, f, s) = build_scaled_sum(SourceMatrix::new("m", 3, 3, dense_data(3, 3)), 3.0);
    run_all(&mut graph, m, &Serial).unwrap();

    let fval = graph.value(ValueRef::new(f, 0));
    for row in 0..3 {
        for col in 0..3 {
            let (_, v) = fval.find_matrix_element(row, col).unwrap();
            assert_relative_eq!(v, 3.0 * (row * 3 + col + 1) as f64, max_relative = 1e-14);
        }
    }
    // sum of 1..=9 is 45.
    assert_relative_eq!(graph.value(ValueRef::new(s, 0)).get(0), 135.0, max_relative = 1e-13);

    let derivs = graph.value(ValueRef::new(s, 0)).derivatives();
    assert_eq!(derivs.len(), 9);
    for &d in derivs {
        assert_relative_eq!(d, 3.0, max_relative = 1e-13);
    }
}

// ── sparse rows ──

fn sparse_source() -> SourceMatrix<f64> {
    // Pattern: row 0 -> {0, 2}, row 1 -> {1}, row 2 -> {0, 2}.
    SourceMatrix::new("m", 3, 3, dense_data(3, 3))
        .with_sparsity(vec![vec![0, 2], vec![1], vec![0, 2]], 2)
}

#[test]
fn sparse_rows_store_only_active_columns() {
    let (mut graph, m, f, _) = build_scaled_sum(sparse_source(), 2.0);
    run_all(&mut graph, m, &Serial).unwrap();

    let fval = graph.value(ValueRef::new(f, 0));
    assert_eq!(fval.num_columns(), 2);
    assert_eq!(fval.row_columns(0), &[0, 2]);
    assert_eq!(fval.row_columns(1), &[1]);

    let (_, v) = fval.find_matrix_element(0, 2).unwrap();
    assert_relative_eq!(v, 2.0 * 3.0, max_relative = 1e-14);
    assert!(fval.find_matrix_element(0, 1).is_none());
    assert!(fval.find_matrix_element(1, 0).is_none());
}

#[test]
fn sparse_and_dense_runs_agree_on_listed_elements() {
    let (mut dense_graph, dm, df, ds) =
        build_scaled_sum(SourceMatrix::new("m", 3, 3, dense_data(3, 3)), 2.0);
    run_all(&mut dense_graph, dm, &Serial).unwrap();

    // Zero the entries the sparse pattern drops, so the reductions agree.
    let mut data = dense_data(3, 3);
    for (row, col) in [(0, 1), (1, 0), (1, 2), (2, 1)] {
        data[row * 3 + col] = 0.0;
    }
    let (mut dense2_graph, d2m, _d2f, d2s) =
        build_scaled_sum(SourceMatrix::new("m", 3, 3, data.clone()), 2.0);
    run_all(&mut dense2_graph, d2m, &Serial).unwrap();
    let (mut sparse_graph, sm, sf, ss) = build_scaled_sum(
        SourceMatrix::new("m", 3, 3, data).with_sparsity(vec![vec![0, 2], vec![1], vec![0, 2]], 2),
        2.0,
    );
    run_all(&mut sparse_graph, sm, &Serial).unwrap();

    let dense_f = dense_graph.value(ValueRef::new(df, 0));
    let sparse_f = sparse_graph.value(ValueRef::new(sf, 0));
    for (row, col) in [(0, 0), (0, 2), (1, 1), (2, 0), (2, 2)] {
        let (_, dv) = dense_f.find_matrix_element(row, col).unwrap();
        let (_, sv) = sparse_f.find_matrix_element(row, col).unwrap();
        assert_relative_eq!(dv, sv, max_relative = 1e-14);
    }
    assert_relative_eq!(
        sparse_graph.value(ValueRef::new(ss, 0)).get(0),
        dense2_graph.value(ValueRef::new(d2s, 0)).get(0),
        max_relative = 1e-13
    );
    let _ = ds;
}

// ── adjoint ──

#[test]
fn matrix_element_forces_reach_the_source() {
    let (mut graph, m, f, _) = build_scaled_sum(SourceMatrix::new("m", 3, 3, dense_data(3, 3)), 4.0);
    run_all(&mut graph, m, &Serial).unwrap();

    let (flat, _) = graph
        .value(ValueRef::new(f, 0))
        .find_matrix_element(1, 2)
        .unwrap();
    graph.add_force(ValueRef::new(f, 0), flat, 2.5);
    apply(&mut graph, m, &Serial).unwrap();

    let forces = graph.node(m).input_forces();
    for row in 0..3 {
        for col in 0..3 {
            let expected = if (row, col) == (1, 2) { 2.5 * 4.0 } else { 0.0 };
            assert_relative_eq!(forces[row * 3 + col], expected, max_relative = 1e-12);
        }
    }
}

#[test]
fn scalar_force_over_a_matrix_reduction() {
    // s = sum of (2 m)^2 elementwise would need a squared chain; use the
    // square directly on the source instead.
    let mut graph = Graph::new();
    let m = graph
        .add_node(Box::new(SourceMatrix::new("m", 2, 2, vec![1.0, 2.0, 3.0, 4.0])))
        .unwrap();
    let sq = {
        let node = FunctionOfMatrix::new(
            &graph,
            "sq",
            Combine::new(vec![1.0], vec![2]),
            vec![ValueRef::new(m, 0)],
        )
        .unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    let s = {
        let node = FunctionOfMatrix::new(&graph, "s", Sum, vec![ValueRef::new(sq, 0)]).unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    run_all(&mut graph, m, &Serial).unwrap();
    assert_relative_eq!(graph.value(ValueRef::new(s, 0)).get(0), 30.0, max_relative = 1e-13);

    graph.add_force(ValueRef::new(s, 0), 0, 1.0);
    apply(&mut graph, s, &Serial).unwrap();
    let forces = graph.node(m).input_forces();
    for (i, x) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
        assert_relative_eq!(forces[i], 2.0 * x, max_relative = 1e-12);
    }
}

// ── shared upstream ──

#[test]
fn two_consumers_of_one_matrix_combine_correctly() {
    let mut graph = Graph::new();
    let m = graph
        .add_node(Box::new(sparse_source()))
        .unwrap();
    let g = {
        let node = FunctionOfMatrix::new(
            &graph,
            "g",
            Combine::linear(vec![2.0]),
            vec![ValueRef::new(m, 0)],
        )
        .unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    let h = {
        let node = FunctionOfMatrix::new(
            &graph,
            "h",
            Combine::linear(vec![3.0]),
            vec![ValueRef::new(m, 0)],
        )
        .unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    let c = {
        let node = FunctionOfMatrix::new(
            &graph,
            "c",
            Combine::linear(vec![1.0, 1.0]),
            vec![ValueRef::new(g, 0), ValueRef::new(h, 0)],
        )
        .unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    assert_eq!(graph.chain_containing(c), &[m, g, h, c]);

    run_all(&mut graph, m, &Serial).unwrap();
    let cval = graph.value(ValueRef::new(c, 0));
    let (_, v) = cval.find_matrix_element(2, 2).unwrap();
    // (2 + 3) * m[2][2], m holds 1..=9 row-major.
    assert_relative_eq!(v, 5.0 * 9.0, max_relative = 1e-13);

    // Both branches fold the force back onto the same source element.
    let (flat, _) = cval.find_matrix_element(2, 2).unwrap();
    graph.add_force(ValueRef::new(c, 0), flat, 1.0);
    apply(&mut graph, m, &Serial).unwrap();
    assert_relative_eq!(
        graph.node(m).input_forces()[2 * 3 + 2],
        5.0,
        max_relative = 1e-12
    );
}

// ── stacked vectors ──

#[test]
fn stacked_vectors_form_a_row_driven_chain() {
    let mut graph = Graph::new();
    let d1 = graph
        .add_node(Box::new(SourceVector::new("d1", vec![1.0, 2.0, 3.0])))
        .unwrap();
    let d2 = graph
        .add_node(Box::new(SourceVector::new("d2", vec![4.0, 5.0, 6.0])))
        .unwrap();
    let v = {
        let node = VStack::new(
            &graph,
            "v",
            vec![ValueRef::new(d1, 0), ValueRef::new(d2, 0)],
        )
        .unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    let g = {
        let node = FunctionOfMatrix::new(
            &graph,
            "g",
            Combine::linear(vec![2.0]),
            vec![ValueRef::new(v, 0)],
        )
        .unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    let s = {
        let node = FunctionOfMatrix::new(&graph, "s", Sum, vec![ValueRef::new(g, 0)]).unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };

    // The vector sources merge into one upstream chain; the stack heads a
    // row-driven chain of its own that the matrix functions fuse with.
    assert_eq!(graph.head_of(d2), d1);
    assert_eq!(graph.chain_containing(s), &[v, g, s]);

    run_all(&mut graph, d1, &Serial).unwrap();
    run_all(&mut graph, v, &Serial).unwrap();

    let vval = graph.value(ValueRef::new(v, 0));
    for row in 0..3 {
        let (_, a) = vval.find_matrix_element(row, 0).unwrap();
        let (_, b) = vval.find_matrix_element(row, 1).unwrap();
        assert_relative_eq!(a, (row + 1) as f64, max_relative = 1e-14);
        assert_relative_eq!(b, (row + 4) as f64, max_relative = 1e-14);
    }
    // 2 * (6 + 15).
    assert_relative_eq!(graph.value(ValueRef::new(s, 0)).get(0), 42.0, max_relative = 1e-13);
}

#[test]
fn forces_on_a_stack_reduction_reach_the_vector_sources() {
    let mut graph = Graph::new();
    let d1 = graph
        .add_node(Box::new(SourceVector::new("d1", vec![1.0, 2.0, 3.0])))
        .unwrap();
    let d2 = graph
        .add_node(Box::new(SourceVector::new("d2", vec![4.0, 5.0, 6.0])))
        .unwrap();
    let v = {
        let node = VStack::new(
            &graph,
            "v",
            vec![ValueRef::new(d1, 0), ValueRef::new(d2, 0)],
        )
        .unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    let g = {
        let node = FunctionOfMatrix::new(
            &graph,
            "g",
            Combine::linear(vec![2.0]),
            vec![ValueRef::new(v, 0)],
        )
        .unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    let s = {
        let node = FunctionOfMatrix::new(&graph, "s", Sum, vec![ValueRef::new(g, 0)]).unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };

    run_all(&mut graph, d1, &Serial).unwrap();
    run_all(&mut graph, v, &Serial).unwrap();

    graph.add_force(ValueRef::new(s, 0), 0, 1.0);
    apply(&mut graph, s, &Serial).unwrap();
    // The stack hands the forces to its argument values; their own chain
    // folds them back onto the external inputs.
    apply(&mut graph, d1, &Serial).unwrap();

    for t in 0..3 {
        assert_relative_eq!(graph.node(d1).input_forces()[t], 2.0, max_relative = 1e-12);
        assert_relative_eq!(graph.node(d2).input_forces()[t], 2.0, max_relative = 1e-12);
    }
}

#[test]
fn stacking_mismatched_lengths_is_rejected() {
    let mut graph = Graph::new();
    let d1 = graph
        .add_node(Box::new(SourceVector::new("d1", vec![1.0, 2.0, 3.0])))
        .unwrap();
    let d2 = graph
        .add_node(Box::new(SourceVector::new("d2", vec![4.0, 5.0])))
        .unwrap();
    let err = VStack::new(
        &graph,
        "v",
        vec![ValueRef::new(d1, 0), ValueRef::new(d2, 0)],
    )
    .unwrap_err();
    assert!(matches!(err, ChainError::ArgumentMismatch { ref label, .. } if label == "v"));
}

// ── row stash bookkeeping ──

#[test]
fn row_stash_deduplicates_first_occurrence_wins() {
    let mut stash: RowStash<f64> = RowStash::new(8, 4);
    stash.extend_offset(&[1, 2], 0);
    stash.extend_offset(&[2, 3], 0);
    stash.extend_offset(&[0, 3], 4);
    assert_eq!(stash.indices(), &[1, 2, 3, 4, 7]);

    stash.push(0, 1.5);
    stash.push(2, -0.5);
    assert_eq!(stash.num_entries(), 2);
    assert_eq!(stash.col(1), 2);
    assert_relative_eq!(stash.val(1), -0.5);

    stash.clear_row();
    assert_eq!(stash.num_entries(), 0);
    assert!(stash.indices().is_empty());
}

#[test]
#[should_panic(expected = "row stash overflow")]
fn row_stash_overflow_is_a_defect() {
    let mut stash: RowStash<f64> = RowStash::new(2, 4);
    stash.extend_offset(&[0, 1, 2], 0);
}
