//! Queue, backpressure, and concurrency behavior

use std::time::Duration;

use runcell::{Engine, EngineError, NewSubmission, SubmissionStatus};

use super::{submission, test_config};

/// Engine with a tiny queue and a single worker so backpressure is easy to
/// provoke
async fn tiny_engine(
    max_concurrent: usize,
    max_queue_size: usize,
) -> (Engine, tempfile::TempDir) {
    let root = tempfile::tempdir().expect("workspace root");
    let mut config = test_config(root.path());
    config.max_concurrent = max_concurrent;
    config.max_queue_size = max_queue_size;
    let engine = Engine::new(config).await.expect("engine should start");
    (engine, root)
}

async fn wait_terminal(engine: &Engine, token: &str) -> runcell::Submission {
    for _ in 0..600 {
        let record = engine.get_record(token).await.unwrap();
        if record.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("submission {token} never reached a terminal state");
}

#[tokio::test]
async fn overflowing_the_queue_is_rejected_and_the_rest_complete() {
    let (engine, _root) = tiny_engine(1, 3).await;

    // One long job occupies the worker; wait for it to leave the queue
    let blocker = engine
        .submit(NewSubmission {
            wall_time_limit: Some(5.0),
            ..submission("sh", "sleep 1")
        })
        .await
        .unwrap();
    for _ in 0..200 {
        if engine.stats().await.pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut queued = vec![blocker.token.clone()];
    for i in 0..3 {
        let record = engine
            .submit(submission("sh", &format!("echo job{i}")))
            .await
            .unwrap();
        queued.push(record.token);
    }

    // The queue is now at capacity
    let overflow = engine.submit(submission("sh", "echo overflow")).await;
    assert!(matches!(overflow, Err(EngineError::QueueFull)));

    // Everything accepted before the overflow still completes
    for token in queued {
        let record = wait_terminal(&engine, &token).await;
        assert!(record.is_terminal());
        assert_ne!(record.status, SubmissionStatus::InternalError);
    }
    engine.shutdown();
}

#[tokio::test]
async fn concurrent_running_never_exceeds_max_concurrent() {
    let (engine, _root) = tiny_engine(2, 8).await;

    let mut tokens = Vec::new();
    for _ in 0..6 {
        let record = engine
            .submit(NewSubmission {
                wall_time_limit: Some(5.0),
                ..submission("sh", "sleep 0.2")
            })
            .await
            .unwrap();
        tokens.push(record.token);
    }

    let mut max_running = 0;
    for _ in 0..150 {
        max_running = max_running.max(engine.stats().await.running);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(max_running <= 2, "running peaked at {max_running}");

    for token in tokens {
        let record = wait_terminal(&engine, &token).await;
        assert_eq!(record.status, SubmissionStatus::Accepted);
    }
    engine.shutdown();
}

#[tokio::test]
async fn higher_priority_dispatches_first() {
    let (engine, _root) = tiny_engine(1, 8).await;

    // Block the single worker so ordering among the queued jobs is visible
    let blocker = engine
        .submit(NewSubmission {
            wall_time_limit: Some(5.0),
            ..submission("sh", "sleep 0.5")
        })
        .await
        .unwrap();
    for _ in 0..200 {
        if engine.stats().await.pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let low = engine
        .submit(NewSubmission {
            priority: 0,
            ..submission("sh", "echo low")
        })
        .await
        .unwrap();
    let high = engine
        .submit(NewSubmission {
            priority: 10,
            ..submission("sh", "echo high")
        })
        .await
        .unwrap();

    let high_record = wait_terminal(&engine, &high.token).await;
    let low_record = wait_terminal(&engine, &low.token).await;
    let _ = wait_terminal(&engine, &blocker.token).await;

    assert!(high_record.finished_at.unwrap() <= low_record.finished_at.unwrap());
    engine.shutdown();
}

#[tokio::test]
async fn terminal_record_is_stable_across_reads() {
    let (engine, _root) = tiny_engine(2, 8).await;

    let record = engine
        .submit_wait(submission("sh", "echo stable"))
        .await
        .unwrap();

    let first = engine.get(&record.token, false, None).await.unwrap();
    for _ in 0..5 {
        let again = engine.get(&record.token, false, None).await.unwrap();
        assert_eq!(first, again);
    }
    engine.shutdown();
}
