//! Record lifecycle, workspace hygiene, and run aggregation

use std::time::Duration;

use runcell::{NewSubmission, SubmissionStatus};

use super::{submission, test_engine};

#[tokio::test]
async fn terminal_records_are_self_describing() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(submission("sh", "echo x"))
        .await
        .unwrap();

    // Limits resolved from defaults at intake are persisted on the record
    assert_eq!(record.limits.cpu_time_limit, Some(5.0));
    assert_eq!(record.limits.memory_limit, Some(262144));
    assert!(record.finished_at.is_some());
    assert!(record.finished_at.unwrap() >= record.created_at);
    assert!(record.time.is_some());
    assert!(record.wall_time.is_some());
    assert!(record.memory.is_some());
    engine.shutdown();
}

#[tokio::test]
async fn workspaces_are_removed_after_quiescence() {
    let (engine, root) = test_engine().await;

    for source in ["echo a", "exit 1", "kill -SEGV $$"] {
        let record = engine.submit_wait(submission("sh", source)).await.unwrap();
        assert!(record.is_terminal());
    }
    // Cleanup runs before the terminal write, but give stragglers a moment
    tokio::time::sleep(Duration::from_millis(100)).await;

    let leftovers: Vec<_> = std::fs::read_dir(root.path())
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name())
        .collect();
    assert!(leftovers.is_empty(), "leftover workspaces: {leftovers:?}");
    engine.shutdown();
}

#[tokio::test]
async fn number_of_runs_keeps_last_run_output() {
    let (engine, _root) = test_engine().await;

    // The counter file persists across runs in the same workspace, so each
    // run prints a growing line count
    let record = engine
        .submit_wait(NewSubmission {
            number_of_runs: Some(3),
            ..submission("sh", "echo run >> counter; wc -l < counter")
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::Accepted);
    assert_eq!(record.stdout.as_deref(), Some(b"3\n".as_slice()));
    engine.shutdown();
}

#[tokio::test]
async fn resource_fault_stops_remaining_runs() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(NewSubmission {
            number_of_runs: Some(5),
            wall_time_limit: Some(0.5),
            ..submission("sh", "echo run >> counter; wc -l < counter; sleep 30")
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::TimeLimitExceeded);
    // The first faulting run ended the loop
    let stdout = String::from_utf8(record.stdout.unwrap()).unwrap();
    assert!(stdout.starts_with("1"), "stdout = {stdout:?}");
    engine.shutdown();
}

#[tokio::test]
async fn additional_files_are_available_to_the_program() {
    use base64::Engine as _;
    use std::io::Write as _;

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        writer
            .start_file("data.txt", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"from the archive").unwrap();
        writer.finish().unwrap();
    }
    let encoded = base64::engine::general_purpose::STANDARD.encode(cursor.into_inner());

    let (engine, _root) = test_engine().await;
    let record = engine
        .submit_wait(NewSubmission {
            additional_files: Some(encoded),
            ..submission("sh", "cat data.txt")
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::Accepted);
    assert_eq!(record.stdout.as_deref(), Some(b"from the archive".as_slice()));
    engine.shutdown();
}

#[tokio::test]
async fn command_line_arguments_are_appended() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(NewSubmission {
            command_line_arguments: Some("first second".to_owned()),
            ..submission("sh", "echo \"$1-$2\"")
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::Accepted);
    assert_eq!(record.stdout.as_deref(), Some(b"first-second\n".as_slice()));
    engine.shutdown();
}

#[tokio::test]
async fn status_events_stream_transitions_in_order() {
    let (engine, _root) = test_engine().await;
    let mut events = engine.subscribe();

    let record = engine
        .submit_wait(submission("sh", "echo x"))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.id == record.id {
            seen.push(event.status);
        }
    }
    assert_eq!(
        seen,
        vec![SubmissionStatus::Running, SubmissionStatus::Accepted]
    );
    engine.shutdown();
}

#[tokio::test]
async fn binary_output_requires_base64() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(submission("sh", "printf '\\377\\376'"))
        .await
        .unwrap();
    assert_eq!(record.status, SubmissionStatus::Accepted);

    // Text rendering refuses; base64 rendering succeeds
    assert!(engine.get(&record.token, false, None).await.is_err());
    let view = engine.get(&record.token, true, None).await.unwrap();
    assert!(view["stdout"].is_string());
    engine.shutdown();
}
