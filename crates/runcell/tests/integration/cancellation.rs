//! Cancellation of pending and running submissions

use std::time::Duration;

use runcell::{Engine, NewSubmission, SubmissionStatus};

use super::{submission, test_config};

async fn engine_with_workers(max_concurrent: usize) -> (Engine, tempfile::TempDir) {
    let root = tempfile::tempdir().expect("workspace root");
    let mut config = test_config(root.path());
    config.max_concurrent = max_concurrent;
    let engine = Engine::new(config).await.expect("engine should start");
    (engine, root)
}

#[tokio::test]
async fn cancelling_a_pending_submission_never_spawns() {
    let (engine, _root) = engine_with_workers(1).await;

    // Occupy the only worker
    let blocker = engine
        .submit(NewSubmission {
            wall_time_limit: Some(10.0),
            ..submission("sh", "sleep 2")
        })
        .await
        .unwrap();
    for _ in 0..200 {
        if engine.stats().await.running == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let pending = engine
        .submit(submission("sh", "echo never-runs"))
        .await
        .unwrap();

    let record = engine.cancel(&pending.token).await.unwrap();
    assert_eq!(record.status, SubmissionStatus::Cancelled);
    assert_eq!(record.message.as_deref(), Some("Execution cancelled"));
    // No output fields were ever produced
    assert!(record.stdout.is_none());
    assert!(record.finished_at.is_some());

    let _ = engine.cancel(&blocker.token).await;
    engine.shutdown();
}

#[tokio::test]
async fn cancelling_a_running_submission_kills_it_promptly() {
    let (engine, _root) = engine_with_workers(2).await;

    let record = engine
        .submit(NewSubmission {
            wall_time_limit: Some(30.0),
            ..submission("sh", "sleep 30")
        })
        .await
        .unwrap();

    for _ in 0..200 {
        if engine.stats().await.running >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Give the sandbox a moment to actually spawn the child
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    engine.cancel(&record.token).await.unwrap();

    let mut terminal = None;
    for _ in 0..300 {
        let current = engine.get_record(&record.token).await.unwrap();
        if current.is_terminal() {
            terminal = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let terminal = terminal.expect("cancelled submission should finish");

    assert_eq!(terminal.status, SubmissionStatus::Cancelled);
    assert_eq!(terminal.message.as_deref(), Some("Execution cancelled"));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "cancellation took {:?}",
        started.elapsed()
    );
    engine.shutdown();
}

#[tokio::test]
async fn cancelling_twice_is_a_no_op() {
    let (engine, _root) = engine_with_workers(2).await;

    let record = engine
        .submit_wait(submission("sh", "echo done"))
        .await
        .unwrap();
    assert_eq!(record.status, SubmissionStatus::Accepted);

    let first = engine.cancel(&record.token).await.unwrap();
    assert_eq!(first.status, SubmissionStatus::Accepted);
    let second = engine.cancel(&record.token).await.unwrap();
    assert_eq!(second.status, SubmissionStatus::Accepted);
    engine.shutdown();
}
