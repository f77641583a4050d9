//! Propagation benchmarks
//!
//! - `chain`: a state atom feeding seventy chained derive atoms, written and
//!   read back through the tail.
//! - `diamond`: one state atom fanned out to many compute atoms and joined
//!   again, written and drained with `stabilize()`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use strata_core::{Atom, Graph};

// =============================================================================
// Deep chain
// =============================================================================

fn bench_chain(c: &mut Criterion) {
    let graph = Graph::new();
    let (head, set_head) = graph.state(1_i64);
    let mut tail: Atom<i64> = graph.derive(move |r| Ok(r.read(&head)? + 1));
    for _ in 1..70 {
        let prev = tail;
        tail = graph.derive(move |r| Ok(r.read(&prev)? + 1));
    }
    graph.get(&tail).unwrap();

    let mut value = 1_i64;
    c.bench_function("chain/70_derive", |b| {
        b.iter(|| {
            value += 1;
            set_head.set(&graph, value).unwrap();
            black_box(graph.get(&tail).unwrap())
        });
    });
}

// =============================================================================
// Wide diamond
// =============================================================================

fn bench_diamond(c: &mut Criterion) {
    let mut group = c.benchmark_group("diamond");

    for width in [10_usize, 100, 1000] {
        let graph = Graph::new();
        let (source, set_source) = graph.state(0_i64);
        let fanned: Vec<Atom<i64>> = (0..width as i64)
            .map(|i| graph.compute(move |r| Ok(r.read(&source)? + i)))
            .collect();
        let join = graph.compute(move |r| {
            let mut sum = 0;
            for atom in &fanned {
                sum += r.read(atom)?;
            }
            Ok(sum)
        });
        graph.stabilize();

        let mut value = 0_i64;
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                value += 1;
                set_source.set(&graph, value).unwrap();
                graph.stabilize();
                black_box(graph.get(&join).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_chain, bench_diamond);
criterion_main!(benches);
