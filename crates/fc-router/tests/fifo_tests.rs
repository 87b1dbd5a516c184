//! FIFO ordering scenarios: in-group ordering, cross-group parallelism,
//! dedup of redelivered pointers, and the batch+group failure policy.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{pointer, pointer_with_mode, pool, setup, wait_until, ScriptedMediator};
use fc_core::{DispatchMode, MediationOutcome};
use fc_router::RouterOptions;

#[tokio::test]
async fn acks_follow_admission_order_within_a_group() {
    let mediator = Arc::new(ScriptedMediator::new(Duration::from_millis(20)));
    let (router, adapter) = setup(
        vec![pool("P", 2)],
        mediator.clone(),
        RouterOptions::default(),
    )
    .await;

    router
        .submit_batch(vec![
            pointer("p1", "P", Some("g")),
            pointer("p2", "P", Some("g")),
            pointer("p3", "P", Some("g")),
        ])
        .await;

    assert!(
        wait_until(|| adapter.completed_count() == 3, Duration::from_secs(5)).await,
        "all three pointers must complete"
    );

    // One worker, strict order of delivery and of acks.
    assert_eq!(mediator.processed(), vec!["p1", "p2", "p3"]);
    assert_eq!(adapter.acked(), vec!["r-p1", "r-p2", "r-p3"]);
    assert!(adapter.nacked().is_empty());
}

#[tokio::test]
async fn distinct_groups_process_in_parallel() {
    let mediator = Arc::new(ScriptedMediator::new(Duration::from_millis(300)));
    let (router, adapter) = setup(
        vec![pool("P", 4)],
        mediator.clone(),
        RouterOptions::default(),
    )
    .await;

    let start = Instant::now();
    router
        .submit_batch(vec![
            pointer("p1", "P", Some("a")),
            pointer("p2", "P", Some("b")),
            pointer("p3", "P", Some("c")),
            pointer("p4", "P", Some("d")),
        ])
        .await;

    assert!(
        wait_until(|| adapter.completed_count() == 4, Duration::from_secs(5)).await,
        "all four pointers must complete"
    );

    // Four lanes at 300ms each: parallel wall time, not 1.2s.
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_millis(900),
        "expected parallel processing, took {elapsed:?}"
    );
    assert_eq!(adapter.acked().len(), 4);
}

#[tokio::test]
async fn redelivered_pointer_is_acked_without_second_delivery() {
    let mediator = Arc::new(ScriptedMediator::new(Duration::from_millis(300)));
    let (router, adapter) = setup(
        vec![pool("P", 2)],
        mediator.clone(),
        RouterOptions::default(),
    )
    .await;

    router.submit_batch(vec![pointer("p1", "P", Some("g"))]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Same id arrives again while the original is still processing; the
    // duplicate delivery is acked immediately with its own handle.
    let mut duplicate = pointer("p1", "P", Some("g"));
    duplicate.receipt_handle = "r-p1-redelivery".to_string();
    router.submit_batch(vec![duplicate]).await;

    assert!(
        wait_until(
            || adapter.acked().contains(&"r-p1-redelivery".to_string()),
            Duration::from_secs(2)
        )
        .await,
        "duplicate delivery must be acked promptly"
    );

    assert!(
        wait_until(|| adapter.acked().len() == 2, Duration::from_secs(5)).await,
        "original must also complete"
    );
    // Delivered exactly once.
    assert_eq!(mediator.processed(), vec!["p1"]);
}

#[tokio::test]
async fn block_on_error_skips_rest_of_batch_group() {
    let mediator = Arc::new(ScriptedMediator::new(Duration::from_millis(10)));
    mediator.script(
        "p1",
        MediationOutcome::Nack {
            delay_seconds: 7,
            reason: "boom".to_string(),
        },
    );

    let (router, adapter) = setup(
        vec![pool("P", 2)],
        mediator.clone(),
        RouterOptions::default(),
    )
    .await;

    router
        .submit_batch(vec![
            pointer("p1", "P", Some("g")),
            pointer("p2", "P", Some("g")),
            pointer("p3", "P", Some("g")),
        ])
        .await;

    assert!(
        wait_until(|| adapter.completed_count() == 3, Duration::from_secs(5)).await,
        "all three pointers must complete"
    );

    // Only the head was delivered; the successors were skipped to preserve
    // redelivery ordering.
    assert_eq!(mediator.processed(), vec!["p1"]);
    assert!(adapter.acked().is_empty());

    let nacked = adapter.nacked();
    assert_eq!(nacked.len(), 3);
    assert_eq!(nacked[0], ("r-p1".to_string(), 7));
}

#[tokio::test]
async fn next_on_error_continues_past_failures() {
    let mediator = Arc::new(ScriptedMediator::new(Duration::from_millis(10)));
    mediator.script(
        "p1",
        MediationOutcome::Nack {
            delay_seconds: 3,
            reason: "boom".to_string(),
        },
    );

    let (router, adapter) = setup(
        vec![pool("P", 2)],
        mediator.clone(),
        RouterOptions::default(),
    )
    .await;

    router
        .submit_batch(vec![
            pointer_with_mode("p1", "P", Some("g"), DispatchMode::NextOnError),
            pointer_with_mode("p2", "P", Some("g"), DispatchMode::NextOnError),
        ])
        .await;

    assert!(
        wait_until(|| adapter.completed_count() == 2, Duration::from_secs(5)).await,
        "both pointers must complete"
    );

    assert_eq!(mediator.processed(), vec!["p1", "p2"]);
    assert_eq!(adapter.acked(), vec!["r-p2"]);
    assert_eq!(adapter.nacked(), vec![("r-p1".to_string(), 3)]);
}

#[tokio::test]
async fn immediate_mode_relaxes_group_ordering() {
    let mediator = Arc::new(ScriptedMediator::new(Duration::from_millis(300)));
    let (router, adapter) = setup(
        vec![pool("P", 4)],
        mediator.clone(),
        RouterOptions::default(),
    )
    .await;

    // Four IMMEDIATE pointers in the SAME group: no group serialization,
    // so they deliver concurrently like four independent lanes.
    let start = Instant::now();
    router
        .submit_batch(vec![
            pointer_with_mode("p1", "P", Some("g"), DispatchMode::Immediate),
            pointer_with_mode("p2", "P", Some("g"), DispatchMode::Immediate),
            pointer_with_mode("p3", "P", Some("g"), DispatchMode::Immediate),
            pointer_with_mode("p4", "P", Some("g"), DispatchMode::Immediate),
        ])
        .await;

    assert!(
        wait_until(|| adapter.completed_count() == 4, Duration::from_secs(5)).await,
        "all four pointers must complete"
    );

    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_millis(900),
        "IMMEDIATE must not serialize the group, took {elapsed:?}"
    );
    assert_eq!(adapter.acked().len(), 4);

    // Ephemeral lanes release their concurrency slots right away instead of
    // waiting out the idle timeout.
    let mut slots_freed = false;
    for _ in 0..100 {
        let workers = router
            .pool_stats()
            .await
            .into_iter()
            .find(|s| s.pool_code == "P")
            .map(|s| s.active_group_workers)
            .unwrap_or(0);
        if workers == 0 {
            slots_freed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(slots_freed, "ephemeral workers must exit once their lane drains");
}

#[tokio::test]
async fn immediate_failure_does_not_skip_successors() {
    let mediator = Arc::new(ScriptedMediator::new(Duration::from_millis(10)));
    mediator.script(
        "p1",
        MediationOutcome::Nack {
            delay_seconds: 3,
            reason: "boom".to_string(),
        },
    );

    let (router, adapter) = setup(
        vec![pool("P", 4)],
        mediator.clone(),
        RouterOptions::default(),
    )
    .await;

    router
        .submit_batch(vec![
            pointer_with_mode("p1", "P", Some("g"), DispatchMode::Immediate),
            pointer_with_mode("p2", "P", Some("g"), DispatchMode::Immediate),
            pointer_with_mode("p3", "P", Some("g"), DispatchMode::Immediate),
        ])
        .await;

    assert!(
        wait_until(|| adapter.completed_count() == 3, Duration::from_secs(5)).await,
        "all three pointers must complete"
    );

    // The failure neither latches the batch+group nor blocks successors:
    // every pointer got its delivery attempt.
    let mut processed = mediator.processed();
    processed.sort();
    assert_eq!(processed, vec!["p1", "p2", "p3"]);

    let mut acked = adapter.acked();
    acked.sort();
    assert_eq!(acked, vec!["r-p2", "r-p3"]);
    assert_eq!(adapter.nacked(), vec![("r-p1".to_string(), 3)]);
}

#[tokio::test]
async fn poison_pointer_is_acked_not_retried() {
    let mediator = Arc::new(ScriptedMediator::new(Duration::from_millis(10)));
    mediator.script(
        "p1",
        MediationOutcome::ErrorConfig {
            reason: "404 from target".to_string(),
        },
    );

    let (router, adapter) = setup(
        vec![pool("P", 2)],
        mediator.clone(),
        RouterOptions::default(),
    )
    .await;

    router
        .submit_batch(vec![
            pointer("p1", "P", Some("g")),
            pointer("p2", "P", Some("g")),
        ])
        .await;

    assert!(
        wait_until(|| adapter.completed_count() == 2, Duration::from_secs(5)).await,
        "both pointers must complete"
    );

    // Config errors are terminal: acked as poison, and the group keeps
    // flowing.
    assert_eq!(adapter.acked(), vec!["r-p1", "r-p2"]);
    assert!(adapter.nacked().is_empty());
}
