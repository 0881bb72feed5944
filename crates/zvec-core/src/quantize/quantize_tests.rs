//! Tests for the quantization codecs.

use super::*;

#[test]
fn test_binary_round_trip_signs() {
    let q = BinaryQuantizer::default();
    let input: Vec<f32> = (0..128)
        .map(|i| if i % 2 == 0 { -0.3 - 0.1 * (i as f32) } else { 0.4 + 0.1 * (i as f32) })
        .collect();
    let mut words = vec![0u32; BinaryQuantizer::encoded_words(128)];
    q.encode(&input, &mut words);
    assert_eq!(words.len(), 4);

    let mut decoded = vec![0.0f32; 128];
    q.decode(&words, 128, &mut decoded);
    for (i, (&original, &restored)) in input.iter().zip(decoded.iter()).enumerate() {
        let expected = if original >= 0.0 { 1.0 } else { -1.0 };
        assert_eq!(restored, expected, "dimension {i}");
    }
}

#[test]
fn test_binary_threshold_shifts_split() {
    let q = BinaryQuantizer::with_threshold(0.5);
    let input = [0.4, 0.5, 0.6];
    let mut words = [0u32; 1];
    q.encode(&input, &mut words);
    assert_eq!(words[0] & 1, 0);
    assert_eq!((words[0] >> 1) & 1, 1);
    assert_eq!((words[0] >> 2) & 1, 1);
}

#[test]
fn test_binary_partial_word() {
    let q = BinaryQuantizer::default();
    let input = vec![1.0f32; 33];
    let mut words = vec![0u32; BinaryQuantizer::encoded_words(33)];
    q.encode(&input, &mut words);
    assert_eq!(words[0], u32::MAX);
    assert_eq!(words[1], 1);
}

#[test]
fn test_int8_reconstruction_error_bounded() {
    let input: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
    let q = Int8Quantizer::fit(&input);
    let mut codes = vec![0u8; 64];
    q.encode(&input, &mut codes);
    let mut decoded = vec![0.0f32; 64];
    q.decode(&codes, &mut decoded);

    let bound = q.scale();
    for (&original, &restored) in input.iter().zip(decoded.iter()) {
        assert!(
            (original - restored).abs() <= bound,
            "error {} exceeds scale {}",
            (original - restored).abs(),
            bound
        );
    }
}

#[test]
fn test_int8_constant_vector() {
    let input = vec![0.25f32; 16];
    let q = Int8Quantizer::fit(&input);
    let mut codes = vec![0u8; 16];
    q.encode(&input, &mut codes);
    let mut decoded = vec![0.0f32; 16];
    q.decode(&codes, &mut decoded);
    for &v in &decoded {
        assert!((v - 0.25).abs() < 1e-6);
    }
}

#[test]
fn test_int4_round_trip_error_bounded() {
    let input: Vec<f32> = (0..31).map(|i| (i as f32 * 0.61).cos()).collect();
    let q = Int4Quantizer::fit(&input);
    let mut codes = vec![0u8; Int4Quantizer::encoded_bytes(31)];
    q.encode(&input, &mut codes);
    let mut decoded = vec![0.0f32; 31];
    q.decode(&codes, 31, &mut decoded);

    let bound = q.scale();
    for (&original, &restored) in input.iter().zip(decoded.iter()) {
        assert!((original - restored).abs() <= bound);
    }
}

#[test]
fn test_int4_nibble_layout() {
    let q = Int4Quantizer::with_bounds_for_tests();
    let input = [0.0f32, 15.0];
    let mut codes = vec![0u8; 1];
    q.encode(&input, &mut codes);
    assert_eq!(Int4Quantizer::code_at(&codes, 0), 0);
    assert_eq!(Int4Quantizer::code_at(&codes, 1), 15);
}

impl Int4Quantizer {
    fn with_bounds_for_tests() -> Self {
        Self { min: 0.0, max: 15.0 }
    }
}
