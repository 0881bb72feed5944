//! RaBitQ build/search/persistence tests.

use std::sync::Arc;

use super::*;
use crate::config::{HnswBuilderOptions, HnswSearcherOptions, OpenOptions, ParamMap};
use crate::context::{QueryParams, SearchContext};
use crate::store::MemoryQuota;

fn builder(dimension: usize, params: RabitqParams) -> RabitqBuilder {
    let metric = Metric::create(
        SQUARED_EUCLIDEAN,
        ElementType::Fp32,
        &ParamMap::new(),
    )
    .unwrap();
    let options = HnswBuilderOptions {
        m: 8,
        m0: 16,
        ef_construction: 64,
        seed: 77,
        ..HnswBuilderOptions::default()
    };
    RabitqBuilder::new(metric, dimension, options, params, Arc::new(MemoryQuota::new(0)))
        .unwrap()
}

fn dataset(count: usize, dimension: usize) -> Vec<Vec<f32>> {
    (0..count)
        .map(|i| {
            (0..dimension)
                .map(|d| {
                    (((i * 13 + d * 5) % 89) as f32) / 89.0 - 0.5
                        + (i as f32) * 1e-4
                })
                .collect()
        })
        .collect()
}

fn run_query(builder: &RabitqBuilder, query: &[f32], topk: u32) -> Vec<(u64, f32)> {
    let mut ctx = SearchContext::new(QueryParams {
        topk,
        ef_search: 128,
        ..QueryParams::default()
    })
    .unwrap();
    builder.search_into(&mut ctx, 0, query, 0).unwrap();
    ctx.result(0).iter().map(|h| (h.key, h.score)).collect()
}

#[test]
fn test_params_from_map() {
    let mut map = ParamMap::new();
    map.insert("rabitq.ex_bits".into(), "6".into());
    map.insert("rabitq.num_clusters".into(), "4".into());
    map.insert("rabitq.rotator_type".into(), "dense".into());
    let params = RabitqParams::from_params(&map).unwrap();
    assert_eq!(params.ex_bits, 6);
    assert_eq!(params.num_clusters, 4);
    assert_eq!(params.rotator_type, RotatorType::DenseRandom);

    map.insert("rabitq.ex_bits".into(), "9".into());
    assert_eq!(RabitqParams::from_params(&map).unwrap_err().code(), -1001);
}

#[test]
fn test_rerank_returns_exact_distances() {
    let builder = builder(16, RabitqParams::default());
    let vectors = dataset(120, 16);
    for (i, v) in vectors.iter().enumerate() {
        builder.add(i as u64 + 1, v).unwrap();
    }

    let hits = run_query(&builder, &vectors[30], 5);
    // The query vector itself must surface with exact distance 0.
    assert_eq!(hits[0].0, 31);
    assert!(hits[0].1.abs() < 1e-5, "exact rerank score, got {}", hits[0].1);
    // Scores ascend.
    for pair in hits.windows(2) {
        assert!(pair[0].1 <= pair[1].1);
    }
}

#[test]
fn test_unsupported_metric_rejected() {
    let metric =
        Metric::create(crate::metric::COSINE, ElementType::Fp32, &ParamMap::new()).unwrap();
    let err = RabitqBuilder::new(
        metric,
        8,
        HnswBuilderOptions::default(),
        RabitqParams::default(),
        Arc::new(MemoryQuota::new(0)),
    )
    .unwrap_err();
    assert_eq!(err.code(), -1005);
}

#[test]
fn test_train_with_clusters_refreshes_codes() {
    let params = RabitqParams {
        num_clusters: 4,
        ex_bits: 4,
        ..RabitqParams::default()
    };
    let builder = builder(8, params);
    let vectors = dataset(100, 8);
    for (i, v) in vectors.iter().enumerate() {
        builder.add(i as u64 + 1, v).unwrap();
    }
    builder.train().unwrap();

    let hits = run_query(&builder, &vectors[10], 3);
    assert_eq!(hits[0].0, 11);
}

#[test]
fn test_train_without_data_rejected() {
    let params = RabitqParams {
        num_clusters: 2,
        ..RabitqParams::default()
    };
    let builder = builder(8, params);
    assert_eq!(builder.train().unwrap_err().code(), -1001);
    // Clustering disabled: train is a no-op even when empty.
    let plain = self::builder(8, RabitqParams::default());
    plain.train().unwrap();
}

#[test]
fn test_dump_and_reload_searches_agree() {
    let params = RabitqParams {
        num_clusters: 2,
        ex_bits: 5,
        ..RabitqParams::default()
    };
    let builder = builder(12, params);
    let vectors = dataset(150, 12);
    for (i, v) in vectors.iter().enumerate() {
        builder.add(i as u64 + 1, v).unwrap();
    }
    builder.train().unwrap();

    let queries: Vec<Vec<f32>> = dataset(4, 12);
    let before: Vec<Vec<(u64, f32)>> =
        queries.iter().map(|q| run_query(&builder, q, 5)).collect();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rabitq.zvi");
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = ContainerWriter::new(std::io::BufWriter::new(file));
    builder.dump(&mut writer).unwrap();
    writer.finish().unwrap();

    let store = IndexStore::open(&path, OpenOptions::read_only()).unwrap();
    let metric = Metric::create(SQUARED_EUCLIDEAN, ElementType::Fp32, &ParamMap::new())
        .unwrap();
    let searcher = RabitqSearcher::load(
        &store,
        metric,
        HnswSearcherOptions {
            brute_force_threshold: 0,
            ..HnswSearcherOptions::default()
        },
    )
    .unwrap();

    for (query, expected) in queries.iter().zip(before.iter()) {
        let mut ctx = SearchContext::new(QueryParams {
            topk: 5,
            ef_search: 128,
            ..QueryParams::default()
        })
        .unwrap();
        searcher.search_into(&mut ctx, 0, query).unwrap();
        let got: Vec<(u64, f32)> = ctx.result(0).iter().map(|h| (h.key, h.score)).collect();
        // Rerank distances are exact on both sides, so ordering agrees.
        assert_eq!(
            got.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            expected.iter().map(|(k, _)| *k).collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_search_by_keys_returns_originals() {
    let builder = builder(8, RabitqParams::default());
    let vectors = dataset(40, 8);
    for (i, v) in vectors.iter().enumerate() {
        builder.add(i as u64 + 1, v).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rabitq.zvi");
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = ContainerWriter::new(std::io::BufWriter::new(file));
    builder.dump(&mut writer).unwrap();
    writer.finish().unwrap();

    let store = IndexStore::open(&path, OpenOptions::read_only()).unwrap();
    let metric = Metric::create(SQUARED_EUCLIDEAN, ElementType::Fp32, &ParamMap::new())
        .unwrap();
    let searcher =
        RabitqSearcher::load(&store, metric, HnswSearcherOptions::default()).unwrap();

    let found = searcher.search_by_keys(&[7, 999]);
    assert!(found[1].is_none());
    let bytes = &found[0].as_ref().unwrap().1;
    let decoded: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(decoded, vectors[6]);
}

#[test]
fn test_external_provider_overrides_store() {
    struct Zeros(usize);
    impl VectorProvider for Zeros {
        fn vector(&self, _key: Key) -> Result<Vec<f32>> {
            Ok(vec![0.0; self.0])
        }
    }

    let builder = builder(8, RabitqParams::default());
    let vectors = dataset(30, 8);
    for (i, v) in vectors.iter().enumerate() {
        builder.add(i as u64 + 1, v).unwrap();
    }
    builder.set_vector_provider(Arc::new(Zeros(8)));

    // All rerank distances collapse to distance-to-zero.
    let hits = run_query(&builder, &vectors[0], 3);
    let expected: f32 = vectors[0].iter().map(|v| v * v).sum();
    for (_, score) in hits {
        assert!((score - expected).abs() < 1e-5);
    }
}

#[test]
fn test_reservoir_is_bounded_and_deterministic() {
    let mut a = Reservoir::new(8, 5);
    let mut b = Reservoir::new(8, 5);
    for i in 0..1000u32 {
        a.offer(i);
        b.offer(i);
    }
    assert_eq!(a.items().len(), 8);
    assert_eq!(a.items(), b.items());
}
