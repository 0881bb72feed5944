//! SearchContext behavior tests.

use std::sync::Arc;

use crate::context::*;
use crate::error::Error;

fn context(topk: u32) -> SearchContext {
    SearchContext::new(QueryParams {
        topk,
        ..QueryParams::default()
    })
    .unwrap()
}

#[test]
fn test_push_keeps_best_topk() {
    let mut ctx = context(2);
    ctx.push(1, 0.9, 10);
    ctx.push(2, 0.1, 11);
    ctx.push(3, 0.5, 12);
    ctx.topk_to_result(0);

    let hits = ctx.result(0);
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].key, 2);
    assert_eq!(hits[1].key, 3);
}

#[test]
fn test_full_heap_discards_equal_or_worse() {
    let mut ctx = context(1);
    ctx.push(1, 0.5, 0);
    ctx.push(2, 0.5, 1); // equal score, larger key: discarded
    ctx.topk_to_result(0);
    assert_eq!(ctx.result(0)[0].key, 1);
}

#[test]
fn test_topk_zero_is_empty() {
    let mut ctx = context(0);
    ctx.push(1, 0.1, 0);
    ctx.topk_to_result(0);
    assert!(ctx.result(0).is_empty());
}

#[test]
fn test_filter_rejects_before_push() {
    let mut ctx = SearchContext::new(QueryParams {
        topk: 10,
        filter: Some(KeyFilter::Predicate(Arc::new(|key| key % 2 == 0))),
        ..QueryParams::default()
    })
    .unwrap();
    for key in 1..=6u64 {
        ctx.push(key, key as f32, 0);
    }
    ctx.topk_to_result(0);
    let keys: Vec<u64> = ctx.result(0).iter().map(|h| h.key).collect();
    assert_eq!(keys, vec![2, 4, 6]);
}

#[test]
fn test_roaring_allow_filter() {
    let mut allow = roaring::RoaringTreemap::new();
    allow.insert(5);
    let mut ctx = SearchContext::new(QueryParams {
        topk: 10,
        filter: Some(KeyFilter::Allow(Arc::new(allow))),
        ..QueryParams::default()
    })
    .unwrap();
    ctx.push(4, 0.1, 0);
    ctx.push(5, 0.2, 1);
    ctx.topk_to_result(0);
    assert_eq!(ctx.result(0).len(), 1);
    assert_eq!(ctx.result(0)[0].key, 5);
}

#[test]
fn test_group_by_caps_and_ranks_groups() {
    let mut ctx = SearchContext::new(QueryParams {
        topk: 10,
        group_by: Some(Arc::new(|key| key / 100)),
        group_topk: 2,
        group_num: 2,
        ..QueryParams::default()
    })
    .unwrap();

    // Group 0: scores 0.3, 0.4, 0.9. Group 1: 0.1, 0.8. Group 2: 0.5.
    ctx.push(1, 0.3, 0);
    ctx.push(2, 0.4, 1);
    ctx.push(3, 0.9, 2);
    ctx.push(101, 0.1, 3);
    ctx.push(102, 0.8, 4);
    ctx.push(201, 0.5, 5);
    ctx.topk_to_result(0);

    let hits = ctx.result(0);
    // Two best groups: group 1 (best 0.1) then group 0 (best 0.3),
    // each capped at two hits.
    let keys: Vec<u64> = hits.iter().map(|h| h.key).collect();
    assert_eq!(keys, vec![101, 102, 1, 2]);
}

#[test]
fn test_group_topk_zero_rejected() {
    let err = SearchContext::new(QueryParams {
        group_by: Some(Arc::new(|key| key)),
        group_topk: 0,
        group_num: 1,
        ..QueryParams::default()
    })
    .unwrap_err();
    assert_eq!(err.code(), -1001);
}

#[test]
fn test_cancellation_interrupts() {
    let token = CancelToken::new();
    let ctx = context(1).with_cancel(token.clone());
    assert!(ctx.check_interrupt().is_ok());
    token.cancel();
    assert!(matches!(ctx.check_interrupt(), Err(Error::Cancelled)));
}

#[test]
fn test_deadline_interrupts() {
    let ctx = SearchContext::new(QueryParams {
        deadline_micros: Some(1),
        ..QueryParams::default()
    })
    .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(2));
    assert!(matches!(ctx.check_interrupt(), Err(Error::Cancelled)));
}

#[test]
fn test_reset_clears_state() {
    let mut ctx = context(2);
    ctx.push(1, 0.1, 0);
    ctx.reset(5);
    ctx.topk_to_result(0);
    assert!(ctx.result(0).is_empty());
    assert_eq!(ctx.topk(), 5);
}

#[test]
fn test_ef_lower_bounded_by_topk() {
    let ctx = SearchContext::new(QueryParams {
        topk: 100,
        ef_search: 32,
        ..QueryParams::default()
    })
    .unwrap();
    assert_eq!(ctx.ef(), 100);
}

#[test]
fn test_batch_result_slots() {
    let mut ctx = context(1);
    ctx.push(1, 0.1, 0);
    ctx.topk_to_result(0);
    ctx.reset(1);
    ctx.push(2, 0.2, 1);
    ctx.topk_to_result(1);

    assert_eq!(ctx.result(0)[0].key, 1);
    assert_eq!(ctx.result(1)[0].key, 2);
    assert_eq!(ctx.results().len(), 2);
}
