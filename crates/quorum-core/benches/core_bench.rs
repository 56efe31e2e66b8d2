//! Criterion benchmarks for quorum-core.
//!
//! ## Benchmark groups
//!
//! 1. **token_estimation** — Token counting at various text sizes.
//! 2. **assembly** — Context bundle construction over synthetic snapshots.
//! 3. **clustering** — Hypothesis convergence at various population sizes.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/quorum-core/Cargo.toml
//! # Run only the clustering group:
//! cargo bench --manifest-path crates/quorum-core/Cargo.toml -- clustering
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use quorum_core::config::ContextConfig;
use quorum_core::context::{estimate_tokens, ContextAssembler};
use quorum_core::converge::cluster;
use quorum_core::indexer::pipeline::{parse_sources, ProjectSnapshot};
use quorum_core::models::{BusinessFlow, CodeLocation, FlowOrigin, Hypothesis, Language, Severity};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a synthetic snapshot of `n` Python functions forming a call chain.
fn synthetic_snapshot(n: usize) -> ProjectSnapshot {
    let sources: Vec<(String, Language, String)> = (0..n)
        .map(|i| {
            let callee = if i + 1 < n {
                format!("    fn_{}()\n", i + 1)
            } else {
                "    pass\n".to_string()
            };
            (
                format!("mod_{i}.py"),
                Language::Python,
                format!("def fn_{i}(value):\n    total = value + {i}\n{callee}"),
            )
        })
        .collect();
    parse_sources(sources, 4)
}

fn entry_flow(snapshot: &ProjectSnapshot) -> BusinessFlow {
    let entry = snapshot
        .records
        .values()
        .find(|r| r.name == "fn_0")
        .expect("synthetic snapshot has an entry");
    BusinessFlow {
        name: entry.qualified_name.clone(),
        origin: FlowOrigin::EntryPoint,
        function_ids: vec![entry.id.clone()],
    }
}

/// Build a hypothesis population with `distinct` underlying claims repeated
/// round-robin across `total` entries.
fn synthetic_hypotheses(total: usize, distinct: usize) -> Vec<Hypothesis> {
    (0..total)
        .map(|i| {
            let claim = i % distinct;
            Hypothesis {
                flow_name: "bench_flow".into(),
                rule_key: "injection".into(),
                iteration: i as u32,
                severity: Some(Severity::High),
                locations: vec![CodeLocation {
                    file: format!("mod_{claim}.py"),
                    line: claim as i64 + 1,
                }],
                rationale: format!(
                    "claim number {claim} about tainted data reaching sink {claim}"
                ),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

fn bench_token_estimation(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_estimation");
    for size in [64usize, 1024, 16 * 1024] {
        let text = "fn body text ".repeat(size / 13 + 1);
        group.bench_with_input(BenchmarkId::from_parameter(size), &text, |b, text| {
            b.iter(|| estimate_tokens(black_box(text)));
        });
    }
    group.finish();
}

fn bench_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("assembly");
    for n in [10usize, 100] {
        let snapshot = synthetic_snapshot(n);
        let flow = entry_flow(&snapshot);
        let config = ContextConfig::default();
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            let assembler =
                ContextAssembler::new(&snapshot.records, &snapshot.call_graph, None, &config);
            b.iter(|| assembler.assemble(black_box(&flow)));
        });
    }
    group.finish();
}

fn bench_clustering(c: &mut Criterion) {
    let mut group = c.benchmark_group("clustering");
    for (total, distinct) in [(25usize, 5usize), (100, 10)] {
        let hypotheses = synthetic_hypotheses(total, distinct);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{total}x{distinct}")),
            &hypotheses,
            |b, hypotheses| {
                b.iter(|| cluster(black_box(hypotheses), 0.6));
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_token_estimation,
    bench_assembly,
    bench_clustering
);
criterion_main!(benches);
