//! Search-path benchmarks: graph vs linear scan, plain vs RaBitQ.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use zvec_core::{ElementType, Index, ParamMap, QueryParams};

const DIM: usize = 128;
const DOCS: usize = 20_000;

fn dataset(rng: &mut StdRng, count: usize) -> Vec<Vec<f32>> {
    (0..count)
        .map(|_| (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

fn build_index(algorithm: &str, vectors: &[Vec<f32>]) -> Index {
    let mut params = ParamMap::new();
    params.insert("hnsw.builder.seed".into(), "42".into());
    let index = Index::create(
        algorithm,
        ElementType::Fp32,
        DIM,
        "squared_euclidean",
        &params,
    )
    .unwrap();
    for (i, v) in vectors.iter().enumerate() {
        index.add(i as u64 + 1, v).unwrap();
    }
    index
}

fn bench_search(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let vectors = dataset(&mut rng, DOCS);
    let queries = dataset(&mut rng, 64);

    let hnsw = build_index("hnsw", &vectors);
    let flat = build_index("flat", &vectors);
    let rabitq = build_index("hnsw_rabitq", &vectors);

    let params = || QueryParams {
        topk: 10,
        ef_search: 64,
        ..QueryParams::default()
    };

    let mut group = c.benchmark_group("topk10");
    let mut cursor = 0usize;
    group.bench_function("hnsw_graph", |b| {
        b.iter(|| {
            cursor = (cursor + 1) % queries.len();
            black_box(hnsw.search(&queries[cursor], params()).unwrap())
        });
    });
    group.bench_function("flat_scan", |b| {
        b.iter(|| {
            cursor = (cursor + 1) % queries.len();
            black_box(flat.search(&queries[cursor], params()).unwrap())
        });
    });
    group.bench_function("rabitq_graph_rerank", |b| {
        b.iter(|| {
            cursor = (cursor + 1) % queries.len();
            black_box(rabitq.search(&queries[cursor], params()).unwrap())
        });
    });
    group.finish();
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
