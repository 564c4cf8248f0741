use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pangolin::{
    apply, run_with, Combine, FunctionOfMatrix, FunctionOfVector, Graph, NodeId, RunOptions,
    Serial, SourceMatrix, SourceVector, Sum, ValueRef,
};

fn vector_chain(n: usize) -> (Graph<f64>, NodeId) {
    let data: Vec<f64> = (0..n).map(|i| (i as f64 * 0.31).sin() + 1.2).collect();
    let mut graph = Graph::new();
    let d = graph
        .add_node(Box::new(SourceVector::new("d", data)))
        .unwrap();
    let f = {
        let node = FunctionOfVector::new(
            &graph,
            "f",
            Combine::new(vec![2.4, 1.0], vec![1, 2]),
            vec![ValueRef::new(d, 0), ValueRef::new(d, 0)],
        )
        .unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    let node = FunctionOfVector::new(&graph, "s", Sum, vec![ValueRef::new(f, 0)]).unwrap();
    graph.add_node(Box::new(node)).unwrap();
    (graph, d)
}

fn matrix_chain(n: usize) -> (Graph<f64>, NodeId) {
    let data: Vec<f64> = (0..n * n).map(|i| (i as f64 * 0.17).cos() + 1.1).collect();
    let mut graph = Graph::new();
    let m = graph
        .add_node(Box::new(SourceMatrix::new("m", n, n, data)))
        .unwrap();
    let f = {
        let node = FunctionOfMatrix::new(
            &graph,
            "f",
            Combine::new(vec![1.0], vec![2]),
            vec![ValueRef::new(m, 0)],
        )
        .unwrap();
        graph.add_node(Box::new(node)).unwrap()
    };
    let node = FunctionOfMatrix::new(&graph, "s", Sum, vec![ValueRef::new(f, 0)]).unwrap();
    graph.add_node(Box::new(node)).unwrap();
    (graph, m)
}

fn bench_vector_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_chain");
    for n in [100, 1_000, 10_000] {
        let (mut graph, head) = vector_chain(n);

        group.bench_with_input(BenchmarkId::new("serial", n), &n, |b, _| {
            b.iter(|| {
                run_with(
                    black_box(&mut graph),
                    head,
                    &Serial,
                    RunOptions { max_threads: 1 },
                )
                .unwrap()
            })
        });

        group.bench_with_input(BenchmarkId::new("threaded", n), &n, |b, _| {
            b.iter(|| {
                run_with(
                    black_box(&mut graph),
                    head,
                    &Serial,
                    RunOptions::default(),
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_matrix_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("matrix_chain");
    for n in [16, 64, 128] {
        let (mut graph, head) = matrix_chain(n);

        group.bench_with_input(BenchmarkId::new("serial", n), &n, |b, _| {
            b.iter(|| {
                run_with(
                    black_box(&mut graph),
                    head,
                    &Serial,
                    RunOptions { max_threads: 1 },
                )
                .unwrap()
            })
        });

        group.bench_with_input(BenchmarkId::new("threaded", n), &n, |b, _| {
            b.iter(|| {
                run_with(
                    black_box(&mut graph),
                    head,
                    &Serial,
                    RunOptions::default(),
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_adjoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("adjoint_pass");
    for n in [1_000, 10_000] {
        let (mut graph, head) = vector_chain(n);
        run_with(&mut graph, head, &Serial, RunOptions::default()).unwrap();
        let s = graph.find_by_label("s").unwrap();

        group.bench_with_input(BenchmarkId::new("scalar_force", n), &n, |b, _| {
            b.iter(|| {
                graph.add_force(ValueRef::new(s, 0), 0, 1.0);
                apply(black_box(&mut graph), s, &Serial).unwrap();
            })
        });

        let f = graph.find_by_label("f").unwrap();
        group.bench_with_input(BenchmarkId::new("vector_force", n), &n, |b, _| {
            b.iter(|| {
                for t in (0..n).step_by(7) {
                    graph.add_force(ValueRef::new(f, 0), t, 0.5);
                }
                apply(black_box(&mut graph), head, &Serial).unwrap();
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_vector_chain, bench_matrix_chain, bench_adjoint);
criterion_main!(benches);
