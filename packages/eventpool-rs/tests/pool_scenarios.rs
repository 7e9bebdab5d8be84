//! End-to-end scenarios against the public API.

use std::time::Duration;

use eventpool::{
    Delivery, EventPool, EventState, PoolError, PoolOptions, PullOptions, Signal, TimeoutStage,
};
use serde_json::json;
use tokio::time::Instant;

async fn wait_for_waiters(pool: &EventPool, recipient: &str, n: usize) {
    while pool.waiting_pulls(recipient) < n {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn emit_then_pull_resolves_emission() {
    let pool = EventPool::new();

    let emission = pool.emit("a", "ping", vec![]).unwrap();
    let record = pool.pull("a").await.unwrap();

    assert_eq!(record.name(), "ping");
    assert!(record.arguments().is_empty());
    assert_eq!(emission.await.unwrap(), Delivery::Pulled);
}

#[tokio::test(start_paused = true)]
async fn pull_on_silent_recipient_times_out() {
    let pool = EventPool::new();
    let start = Instant::now();

    let err = pool
        .pull_with(
            "x",
            PullOptions::default().with_timeout(Some(Duration::from_millis(100))),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(matches!(
        err,
        PoolError::Timeout {
            stage: TimeoutStage::Pull,
            ..
        }
    ));
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn sequential_pulls_follow_emit_order() {
    let pool = EventPool::new();
    pool.emit("shared", "first", vec![]).unwrap();
    pool.emit("shared", "second", vec![]).unwrap();

    assert_eq!(pool.pull("shared").await.unwrap().name(), "first");
    assert_eq!(pool.pull("shared").await.unwrap().name(), "second");
}

#[tokio::test]
async fn second_emit_over_capacity_is_rejected() {
    let pool = EventPool::with_options(PoolOptions::default().with_max_pending_events(Some(1)));

    pool.emit("r", "a", vec![]).unwrap();
    let err = pool.emit("r", "b", vec![]).unwrap_err();

    assert!(err.is_capacity_exceeded());
    assert_eq!(err.to_string(), "pending queue for recipient 'r' is full (limit 1)");

    // Pulling frees the slot again
    pool.pull("r").await.unwrap();
    pool.emit("r", "b", vec![]).unwrap();
}

#[tokio::test]
async fn worker_loop_reports_results_to_emitters() {
    let pool = EventPool::new();

    let worker = tokio::spawn({
        let pool = pool.clone();
        async move {
            for _ in 0..3 {
                let record = pool.pull("doubler").await.unwrap();
                let n = record.arguments()[0].as_i64().unwrap();
                if n < 0 {
                    record.signal(Signal::Failed("negative input".into()));
                } else {
                    record.signal(Signal::Handled(Some(json!(n * 2))));
                }
            }
        }
    });

    let a = pool.emit_and_wait("doubler", "double", vec![json!(2)]).unwrap();
    let b = pool.emit_and_wait("doubler", "double", vec![json!(-1)]).unwrap();
    let c = pool.emit_and_wait("doubler", "double", vec![json!(21)]).unwrap();

    assert_eq!(a.await.unwrap(), Delivery::Handled(Some(json!(4))));
    assert!(matches!(b.await.unwrap_err(), PoolError::Failed { reason, .. } if reason == "negative input"));
    assert_eq!(c.await.unwrap(), Delivery::Handled(Some(json!(42))));

    worker.await.unwrap();
    assert_eq!(pool.active_len("doubler"), 0);
}

#[tokio::test]
async fn many_suspended_pulls_are_served_fifo() {
    let pool = EventPool::new();
    let mut pullers = Vec::new();
    for i in 0..5 {
        let p = pool.clone();
        pullers.push(tokio::spawn(async move { p.pull("fanin").await }));
        wait_for_waiters(&pool, "fanin", i + 1).await;
    }

    for i in 0..5 {
        pool.emit("fanin", format!("job-{i}"), vec![]).unwrap();
    }

    for (i, puller) in pullers.into_iter().enumerate() {
        assert_eq!(puller.await.unwrap().unwrap().name(), format!("job-{i}"));
    }
    assert_eq!(pool.waiting_pulls("fanin"), 0);
}

#[tokio::test(start_paused = true)]
async fn unpulled_event_times_out_for_emitter() {
    let pool = EventPool::with_options(
        PoolOptions::default().with_pending_timeout(Some(Duration::from_millis(250))),
    );

    let emission = pool.emit("nobody", "ping", vec![]).unwrap();
    let record = emission.record().clone();

    let err = emission.await.unwrap_err();

    assert_eq!(
        err,
        PoolError::Timeout {
            stage: TimeoutStage::Pending,
            limit: Duration::from_millis(250),
        }
    );
    assert_eq!(record.state(), EventState::TimedOut(TimeoutStage::Pending));
    assert!(pool.try_pull("nobody").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_handler_times_out_and_late_result_is_ignored() {
    let pool = EventPool::with_options(
        PoolOptions::default().with_handling_timeout(Some(Duration::from_millis(100))),
    );
    let emission = pool.emit_and_wait("slow", "job", vec![]).unwrap();
    let record = pool.pull("slow").await.unwrap();

    tokio::time::advance(Duration::from_millis(150)).await;
    assert!(!record.complete(Some(json!("too late"))));

    let err = emission.await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::Timeout {
            stage: TimeoutStage::Handling,
            ..
        }
    ));
    assert_eq!(pool.active_len("slow"), 0);
}

#[tokio::test]
async fn idle_recipients_can_be_pruned() {
    let pool = EventPool::new();
    for recipient in ["a", "b", "c"] {
        pool.emit(recipient, "ping", vec![]).unwrap();
    }
    pool.pull("a").await.unwrap();
    pool.pull("b").await.unwrap();

    assert_eq!(pool.prune_idle(), 2);
    assert_eq!(pool.recipients(), vec!["c".to_string()]);
}
