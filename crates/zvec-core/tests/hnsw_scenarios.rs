//! End-to-end scenarios against the public facade.

use std::sync::Arc;

use zvec_core::{
    to_code, ElementType, Index, KeyFilter, ParamMap, QueryParams,
};

fn hnsw_index(dimension: usize, metric: &str) -> Index {
    Index::create("hnsw", ElementType::Fp32, dimension, metric, &ParamMap::new()).unwrap()
}

#[test]
fn test_empty_index_query() {
    let index = hnsw_index(64, "inner_product");
    assert_eq!(index.get_doc_count(), 0);

    let result = index.search(
        &vec![0.1; 64],
        QueryParams {
            topk: 10,
            ..QueryParams::default()
        },
    );
    assert_eq!(to_code(&result), 0);
    assert!(result.unwrap().is_empty());
}

#[test]
fn test_single_vector_index() {
    let index = hnsw_index(64, "inner_product");
    let v = vec![0.1f32; 64];
    index.add(7, &v).unwrap();
    assert_eq!(index.get_doc_count(), 1);

    let hits = index
        .search(
            &v,
            QueryParams {
                topk: 10,
                ef_search: 20,
                ..QueryParams::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key, 7);
    // Inner product returns the negation: -<v, v> = -0.64.
    assert!((hits[0].score - (-0.64)).abs() < 1e-4, "score {}", hits[0].score);
}

#[test]
fn test_cosine_normalization_scores() {
    let index = hnsw_index(8, "cosine");
    let mut a = vec![0.0f32; 8];
    a[0] = 1.0;
    let mut b = vec![0.0f32; 8];
    b[0] = 0.5;
    b[1] = 0.5 * 3.0f32.sqrt();

    index.add(1, &a).unwrap();
    index.add(2, &b).unwrap();

    let hits = index
        .search(
            &a,
            QueryParams {
                topk: 2,
                ..QueryParams::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].key, 1);
    assert!(hits[0].score.abs() < 1e-5);
    assert_eq!(hits[1].key, 2);
    assert!((hits[1].score - 0.5).abs() < 1e-5);
}

#[test]
fn test_binary_quantizer_round_trip() {
    use zvec_core::quantize::BinaryQuantizer;

    let v: Vec<f32> = (0..128)
        .map(|i| match i % 4 {
            0 => -0.3,
            1 => 0.4,
            2 => -0.5,
            _ => 0.6,
        })
        .collect();
    let q = BinaryQuantizer::default();
    let mut words = vec![0u32; BinaryQuantizer::encoded_words(128)];
    q.encode(&v, &mut words);
    assert_eq!(words.len(), 4);

    let mut decoded = vec![0.0f32; 128];
    q.decode(&words, 128, &mut decoded);
    for (i, value) in decoded.iter().enumerate() {
        let expected = if i % 2 == 0 { -1.0 } else { 1.0 };
        assert_eq!(*value, expected, "dimension {i}");
    }
}

#[test]
fn test_search_topk_zero_is_empty() {
    let index = hnsw_index(8, "squared_euclidean");
    index.add(1, &[0.5; 8]).unwrap();
    let hits = index
        .search(
            &[0.5; 8],
            QueryParams {
                topk: 0,
                ..QueryParams::default()
            },
        )
        .unwrap();
    assert!(hits.is_empty());
}

#[test]
fn test_filter_rejecting_all_keys_terminates_empty() {
    let index = hnsw_index(8, "squared_euclidean");
    for i in 1..=200u64 {
        let v: Vec<f32> = (0..8).map(|d| ((i * 7 + d) % 23) as f32).collect();
        index.add(i, &v).unwrap();
    }

    let hits = index
        .search(
            &[1.0; 8],
            QueryParams {
                topk: 10,
                filter: Some(KeyFilter::Predicate(Arc::new(|_| false))),
                ..QueryParams::default()
            },
        )
        .unwrap();
    assert!(hits.is_empty());
}

#[test]
fn test_remove_entry_point_then_search() {
    let index = hnsw_index(8, "squared_euclidean");
    for i in 1..=50u64 {
        let v: Vec<f32> = (0..8).map(|d| ((i * 11 + d * 3) % 31) as f32).collect();
        index.add(i, &v).unwrap();
    }

    let stats = index.stats();
    assert_eq!(stats.doc_count, 50);

    // Whatever the entry point is, deleting keys never breaks search.
    for key in 1..=10u64 {
        index.remove(key).unwrap();
    }
    assert_eq!(index.get_doc_count(), 40);

    let hits = index
        .search(
            &[1.0; 8],
            QueryParams {
                topk: 40,
                ef_search: 64,
                ..QueryParams::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 40);
    assert!(hits.iter().all(|h| h.key > 10));
}

#[test]
fn test_group_by_selects_best_groups() {
    let index = hnsw_index(4, "squared_euclidean");
    // Keys 1..30; group = key / 10.
    for i in 1..=30u64 {
        index.add(i, &[i as f32, 0.0, 0.0, 0.0]).unwrap();
    }

    let hits = index
        .search(
            &[0.0; 4],
            QueryParams {
                topk: 10,
                group_by: Some(Arc::new(|key| key / 10)),
                group_topk: 2,
                group_num: 2,
                ..QueryParams::default()
            },
        )
        .unwrap();
    // Two best groups by best score: group 0 (keys 1, 2), group 1 (10, 11).
    let keys: Vec<u64> = hits.iter().map(|h| h.key).collect();
    assert_eq!(keys, vec![1, 2, 10, 11]);
}

#[test]
fn test_group_topk_zero_rejected() {
    let index = hnsw_index(4, "squared_euclidean");
    let err = index
        .search(
            &[0.0; 4],
            QueryParams {
                group_by: Some(Arc::new(|key| key)),
                group_topk: 0,
                group_num: 1,
                ..QueryParams::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.code(), -1001);
}

#[test]
fn test_fetch_vector_attaches_bytes() {
    let index = hnsw_index(4, "squared_euclidean");
    index.add(3, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let hits = index
        .search(
            &[1.0, 2.0, 3.0, 4.0],
            QueryParams {
                topk: 1,
                fetch_vector: true,
                ..QueryParams::default()
            },
        )
        .unwrap();
    let bytes = hits[0].vector.as_ref().unwrap();
    let decoded: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(decoded, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_search_by_keys_exact_retrieval() {
    let index = hnsw_index(4, "squared_euclidean");
    index.add(5, &[5.0, 0.0, 0.0, 0.0]).unwrap();
    index.add(6, &[6.0, 0.0, 0.0, 0.0]).unwrap();

    let found = index.search_by_keys(&[6, 42]).unwrap();
    assert!(found[1].is_none());
    let decoded: Vec<f32> = found[0]
        .as_ref()
        .unwrap()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(decoded, vec![6.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_reserved_algorithms_not_implemented() {
    for name in ["ivf", "flat_sparse"] {
        let err = Index::create(name, ElementType::Fp32, 8, "inner_product", &ParamMap::new())
            .unwrap_err();
        assert_eq!(err.code(), -1010, "algorithm {name}");
    }
    let err = Index::create("kdtree", ElementType::Fp32, 8, "inner_product", &ParamMap::new())
        .unwrap_err();
    assert_eq!(err.code(), -1005);
}

#[test]
fn test_closed_index_rejects_operations() {
    let mut index = hnsw_index(4, "inner_product");
    index.close();
    assert_eq!(
        index.search(&[0.0; 4], QueryParams::default()).unwrap_err().code(),
        -1001
    );
    assert_eq!(index.add(1, &[0.0; 4]).unwrap_err().code(), -1001);
}

#[test]
fn test_flat_and_hnsw_agree_exactly() {
    let flat = Index::create("flat", ElementType::Fp32, 8, "squared_euclidean", &ParamMap::new())
        .unwrap();
    let hnsw = hnsw_index(8, "squared_euclidean");

    let vectors: Vec<Vec<f32>> = (0..250)
        .map(|i| (0..8).map(|d| (((i * 17 + d * 3) % 101) as f32) / 101.0).collect())
        .collect();
    for (i, v) in vectors.iter().enumerate() {
        flat.add(i as u64 + 1, v).unwrap();
        hnsw.add(i as u64 + 1, v).unwrap();
    }

    let params = || QueryParams {
        topk: 10,
        ef_search: 250,
        ..QueryParams::default()
    };
    for probe in [0usize, 99, 200] {
        let exact: std::collections::BTreeSet<u64> = flat
            .search(&vectors[probe], params())
            .unwrap()
            .iter()
            .map(|h| h.key)
            .collect();
        let approx: std::collections::BTreeSet<u64> = hnsw
            .search(&vectors[probe], params())
            .unwrap()
            .iter()
            .map(|h| h.key)
            .collect();
        assert_eq!(exact, approx, "probe {probe}");
    }
}

#[test]
fn test_stats_surface() {
    let index = hnsw_index(8, "inner_product");
    for i in 1..=20u64 {
        index.add(i, &[i as f32 / 20.0; 8]).unwrap();
    }
    index.remove(3).unwrap();

    let stats = index.stats();
    assert_eq!(stats.algorithm, "hnsw");
    assert_eq!(stats.doc_count, 20);
    assert_eq!(stats.live_count, 19);
    assert_eq!(stats.tombstone_count, 1);
    assert!(!stats.isa.is_empty());
}
