//! End-to-end submission scenarios

use runcell::{NewSubmission, SubmissionStatus};

use super::{submission, test_engine};

#[tokio::test]
async fn shell_hello_world_is_accepted() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(submission("sh", "echo 'Hello, World!'"))
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::Accepted);
    assert_eq!(record.stdout.as_deref(), Some(b"Hello, World!\n".as_slice()));
    assert_eq!(record.exit_code, Some(0));
    engine.shutdown();
}

#[tokio::test]
async fn stdin_reaches_the_program() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(NewSubmission {
            stdin: "Alice".to_owned(),
            ..submission("sh", "read name; echo \"$name!\"")
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::Accepted);
    assert_eq!(record.stdout.as_deref(), Some(b"Alice!\n".as_slice()));
    engine.shutdown();
}

#[tokio::test]
async fn busy_loop_hits_cpu_limit() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(NewSubmission {
            cpu_time_limit: Some(0.5),
            wall_time_limit: Some(5.0),
            ..submission("sh", "while :; do :; done")
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::TimeLimitExceeded);
    assert!(record.message.unwrap().contains("CPU"));
    let time = record.time.unwrap();
    assert!(time >= 0.4 && time <= 1.5, "cpu time = {time}");
    engine.shutdown();
}

#[tokio::test]
async fn sleeper_hits_wall_limit() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(NewSubmission {
            wall_time_limit: Some(0.5),
            ..submission("sh", "sleep 30")
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::TimeLimitExceeded);
    assert!(record.message.unwrap().contains("Wall"));
    assert!(record.wall_time.unwrap() < 2.0);
    engine.shutdown();
}

#[tokio::test]
async fn oversized_output_is_a_runtime_error() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(NewSubmission {
            max_file_size: Some(4),
            ..submission(
                "sh",
                "i=0; while [ $i -lt 4096 ]; do echo 0123456789abcdef; i=$((i+1)); done",
            )
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::RuntimeError);
    assert!(record.message.unwrap().contains("Output size limit"));
    assert_eq!(record.stdout.unwrap().len(), 4 * 1024);
    engine.shutdown();
}

#[tokio::test]
async fn nonzero_exit_is_a_runtime_error() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(submission("sh", "exit 3"))
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::RuntimeError);
    assert_eq!(record.exit_code, Some(3));
    engine.shutdown();
}

#[tokio::test]
async fn scripted_compile_and_run() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(submission(
            "scripted",
            "echo 'echo built output' > main.sh",
        ))
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::Accepted);
    assert_eq!(record.stdout.as_deref(), Some(b"built output\n".as_slice()));
    // The compile step ran and its (empty) output was recorded
    assert!(record.compile_output.is_some());
    engine.shutdown();
}

#[tokio::test]
async fn failing_build_is_a_compilation_error() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(submission(
            "scripted",
            "echo 'main.sh:1: missing semicolon' >&2; exit 2",
        ))
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::CompilationError);
    assert!(record.compile_output.unwrap().contains("missing semicolon"));
    // The run step never executed
    assert!(record.stdout.is_none());
    engine.shutdown();
}

#[tokio::test]
async fn redirected_stderr_merges_into_stdout() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(NewSubmission {
            redirect_stderr_to_stdout: Some(true),
            ..submission("sh", "echo out; echo err 1>&2")
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::Accepted);
    let merged = String::from_utf8(record.stdout.unwrap()).unwrap();
    assert!(merged.contains("out"));
    assert!(merged.contains("err"));
    assert_eq!(record.stderr.as_deref(), Some(b"".as_slice()));
    engine.shutdown();
}

#[tokio::test]
#[ignore = "requires language toolchains"]
async fn python_hello_world() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(submission("python", r#"print("Hello, World!")"#))
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::Accepted);
    assert_eq!(record.stdout.as_deref(), Some(b"Hello, World!\n".as_slice()));
    assert_eq!(record.exit_code, Some(0));
    engine.shutdown();
}

#[tokio::test]
#[ignore = "requires language toolchains"]
async fn python_echoes_stdin() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(NewSubmission {
            stdin: "Alice".to_owned(),
            ..submission("python", r#"print(input()+"!")"#)
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::Accepted);
    assert_eq!(record.stdout.as_deref(), Some(b"Alice!\n".as_slice()));
    engine.shutdown();
}

#[tokio::test]
#[ignore = "requires language toolchains"]
async fn c_infinite_loop_hits_cpu_limit() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(NewSubmission {
            cpu_time_limit: Some(1.0),
            wall_time_limit: Some(3.0),
            ..submission("c", "int main(void){ while(1); }")
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::TimeLimitExceeded);
    assert!(record.message.unwrap().contains("CPU"));
    let time = record.time.unwrap();
    assert!(time >= 1.0 && time <= 1.5, "cpu time = {time}");
    engine.shutdown();
}

#[tokio::test]
#[ignore = "requires language toolchains"]
async fn python_allocation_hits_memory_limit() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(NewSubmission {
            memory_limit: Some(65536),
            ..submission(
                "python",
                "a = bytearray()\nwhile True:\n    a.extend(b'x' * 1048576)\n",
            )
        })
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::MemoryLimitExceeded);
    let memory = record.memory.unwrap();
    assert!(memory >= 60000 && memory <= 69000, "memory = {memory} KiB");
    engine.shutdown();
}

#[tokio::test]
#[ignore = "requires language toolchains"]
async fn cpp_missing_semicolon_is_compilation_error() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(submission(
            "cpp",
            "#include <iostream>\nint main() { std::cout << 1 }\n",
        ))
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::CompilationError);
    assert!(!record.compile_output.unwrap().is_empty());
    assert!(record.stdout.is_none());
    assert!(record.stderr.is_none());
    engine.shutdown();
}

#[tokio::test]
#[ignore = "requires language toolchains"]
async fn java_class_name_is_derived_from_source() {
    let (engine, _root) = test_engine().await;

    let record = engine
        .submit_wait(submission(
            "java",
            "public class Solution { public static void main(String[] a){ System.out.println(42);} }",
        ))
        .await
        .unwrap();

    assert_eq!(record.status, SubmissionStatus::Accepted);
    assert_eq!(record.stdout.as_deref(), Some(b"42\n".as_slice()));
    engine.shutdown();
}
