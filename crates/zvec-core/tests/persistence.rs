//! Dump / reload round trips over real container files.

use zvec_core::{ElementType, Index, OpenOptions, ParamMap, QueryParams, StorageKind};

fn random_vectors(count: usize, dimension: usize, seed: u64) -> Vec<Vec<f32>> {
    // Splitmix-style generator keeps the fixture independent of rand.
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    };
    (0..count)
        .map(|_| {
            (0..dimension)
                .map(|_| ((next() >> 40) as f32) / ((1u64 << 24) as f32) - 0.5)
                .collect()
        })
        .collect()
}

fn build_params() -> ParamMap {
    let mut params = ParamMap::new();
    params.insert("hnsw.builder.M".into(), "16".into());
    params.insert("hnsw.builder.ef_construction".into(), "100".into());
    params.insert("hnsw.builder.seed".into(), "42".into());
    params
}

#[test]
fn test_dump_reload_results_identical() {
    let index = Index::create(
        "hnsw",
        ElementType::Fp32,
        32,
        "squared_euclidean",
        &build_params(),
    )
    .unwrap();

    let vectors = random_vectors(1000, 32, 7);
    for (i, v) in vectors.iter().enumerate() {
        index.add(i as u64 + 1, v).unwrap();
    }
    assert_eq!(index.get_doc_count(), 1000);

    let queries = random_vectors(10, 32, 99);
    let query_params = || QueryParams {
        topk: 10,
        ef_search: 64,
        ..QueryParams::default()
    };
    let before: Vec<Vec<(u64, f32)>> = queries
        .iter()
        .map(|q| {
            index
                .search(q, query_params())
                .unwrap()
                .iter()
                .map(|h| (h.key, h.score))
                .collect()
        })
        .collect();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.zvi");
    index.dump(&path).unwrap();

    let reloaded = Index::open(&path, OpenOptions::read_only(), &ParamMap::new()).unwrap();
    assert!(reloaded.read_only());
    assert_eq!(reloaded.get_doc_count(), 1000);
    assert_eq!(reloaded.meta().dimension, 32);

    for (query, expected) in queries.iter().zip(before.iter()) {
        let got: Vec<(u64, f32)> = reloaded
            .search(query, query_params())
            .unwrap()
            .iter()
            .map(|h| (h.key, h.score))
            .collect();
        assert_eq!(&got, expected, "results must be identical after reload");
    }

    // Stored vectors survive byte-for-byte.
    for probe in [1u64, 500, 1000] {
        let found = reloaded.search_by_keys(&[probe]).unwrap();
        let bytes = found[0].as_ref().unwrap();
        let expected: Vec<u8> = vectors[probe as usize - 1]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(bytes, &expected);
    }
}

#[test]
fn test_reload_into_memory_matches_mmap() {
    let index = Index::create(
        "hnsw",
        ElementType::Fp32,
        16,
        "inner_product",
        &build_params(),
    )
    .unwrap();
    let vectors = random_vectors(300, 16, 3);
    for (i, v) in vectors.iter().enumerate() {
        index.add(i as u64 + 1, v).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.zvi");
    index.dump(&path).unwrap();

    let mapped = Index::open(&path, OpenOptions::read_only(), &ParamMap::new()).unwrap();
    let resident = Index::open(
        &path,
        OpenOptions {
            storage: StorageKind::Memory,
            verify_checksums: true,
            ..OpenOptions::default()
        },
        &ParamMap::new(),
    )
    .unwrap();

    let params = || QueryParams {
        topk: 5,
        ef_search: 64,
        ..QueryParams::default()
    };
    for query in random_vectors(5, 16, 11) {
        let a: Vec<(u64, f32)> = mapped
            .search(&query, params())
            .unwrap()
            .iter()
            .map(|h| (h.key, h.score))
            .collect();
        let b: Vec<(u64, f32)> = resident
            .search(&query, params())
            .unwrap()
            .iter()
            .map(|h| (h.key, h.score))
            .collect();
        assert_eq!(a, b);
    }
}

#[test]
fn test_add_on_read_only_load_unsupported() {
    let index = Index::create(
        "hnsw",
        ElementType::Fp32,
        8,
        "inner_product",
        &ParamMap::new(),
    )
    .unwrap();
    index.add(1, &[0.5; 8]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.zvi");
    index.dump(&path).unwrap();

    let reloaded = Index::open(&path, OpenOptions::read_only(), &ParamMap::new()).unwrap();
    assert_eq!(reloaded.add(2, &[0.1; 8]).unwrap_err().code(), -1005);
    assert_eq!(reloaded.train().unwrap_err().code(), -1005);
}

#[test]
fn test_tombstone_survives_on_writable_reload() {
    let index = Index::create(
        "hnsw",
        ElementType::Fp32,
        8,
        "squared_euclidean",
        &ParamMap::new(),
    )
    .unwrap();
    for i in 1..=10u64 {
        index.add(i, &[i as f32; 8]).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.zvi");
    index.dump(&path).unwrap();

    {
        let writable = Index::open(
            &path,
            OpenOptions {
                read_only: false,
                verify_checksums: false,
                ..OpenOptions::default()
            },
            &ParamMap::new(),
        )
        .unwrap();
        writable.remove(4).unwrap();
        assert_eq!(writable.get_doc_count(), 9);
    }

    // The key bytes were cleared in the container; checksums shift, so
    // reopen without verification.
    let reopened = Index::open(
        &path,
        OpenOptions {
            read_only: true,
            verify_checksums: false,
            ..OpenOptions::default()
        },
        &ParamMap::new(),
    )
    .unwrap();
    assert_eq!(reopened.get_doc_count(), 9);
    assert!(reopened.search_by_keys(&[4]).unwrap()[0].is_none());
}

#[test]
fn test_corrupted_container_open_fails_as_io() {
    let index = Index::create(
        "hnsw",
        ElementType::Fp32,
        8,
        "inner_product",
        &ParamMap::new(),
    )
    .unwrap();
    index.add(1, &[0.3; 8]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.zvi");
    index.dump(&path).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let len = bytes.len();
    bytes[len - 10] ^= 0xFF; // inside the footer
    std::fs::write(&path, &bytes).unwrap();

    let err = Index::open(&path, OpenOptions::read_only(), &ParamMap::new()).unwrap_err();
    assert_eq!(err.code(), -1007);
}

#[test]
fn test_features_view_over_loaded_index() {
    let index = Index::create(
        "hnsw",
        ElementType::Fp32,
        4,
        "squared_euclidean",
        &ParamMap::new(),
    )
    .unwrap();
    index.add(1, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    index.add(2, &[5.0, 6.0, 7.0, 8.0]).unwrap();

    // Build-mode indexes expose no view.
    assert_eq!(index.features().unwrap_err().code(), -1005);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.zvi");
    index.dump(&path).unwrap();

    let reloaded = Index::open(&path, OpenOptions::read_only(), &ParamMap::new()).unwrap();
    let features = reloaded.features().unwrap();
    assert_eq!(features.count(), 2);
    assert_eq!(features.dimension(), 4);
    let row: Vec<f32> = features
        .vector(1)
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(row, vec![5.0, 6.0, 7.0, 8.0]);
}

#[test]
fn test_loaded_container_redump_identical() {
    let index = Index::create(
        "flat",
        ElementType::Fp32,
        8,
        "inner_product",
        &ParamMap::new(),
    )
    .unwrap();
    for i in 1..=25u64 {
        index.add(i, &[i as f32 / 25.0; 8]).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.zvi");
    index.dump(&first).unwrap();

    let reloaded = Index::open(&first, OpenOptions::read_only(), &ParamMap::new()).unwrap();
    let second = dir.path().join("second.zvi");
    reloaded.dump(&second).unwrap();

    assert_eq!(
        std::fs::read(&first).unwrap(),
        std::fs::read(&second).unwrap()
    );
}
