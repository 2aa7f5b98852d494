//! Tests for the command runner — subprocess supervision.
//!
//! Test categories:
//! 1. Happy path: stdout/stderr capture, exit codes, trim-on-success
//! 2. Output cap: at-cap passes, one byte over fails with truncated partial
//! 3. Timers: idle armed only after first output, hard timeout, cancellation
//! 4. Process hygiene: spawn errors, grandchildren die with the group
//! 5. Concurrency gate: bounded parallelism, queue accounting

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use drover::error::DroverError;
use drover::runner::{CommandRunner, Invocation};

// ===========================================================================
// Helpers
// ===========================================================================

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("drover-test-runner-{name}"));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn runner(max_concurrent: usize, max_output_bytes: usize) -> CommandRunner {
    CommandRunner::new(max_concurrent, max_output_bytes, None, false)
}

/// Invocation running `script` under /bin/sh with generous default budgets.
fn sh(script: &str, dir: &std::path::Path) -> Invocation {
    Invocation {
        program: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), script.to_string()],
        working_directory: dir.to_path_buf(),
        hard_timeout: Duration::from_secs(10),
        idle_timeout: Duration::from_secs(10),
        cancel: None,
    }
}

// ===========================================================================
// Happy path
// ===========================================================================

#[tokio::test]
async fn captures_stdout_and_exit_zero() {
    let dir = test_dir("stdout");
    let outcome = runner(1, 1 << 20)
        .execute(sh("echo hello", &dir))
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert!(outcome.success());
    assert_eq!(outcome.stdout, "hello");
}

#[tokio::test]
async fn reports_nonzero_exit_code() {
    let dir = test_dir("exitcode");
    let outcome = runner(1, 1 << 20)
        .execute(sh("exit 3", &dir))
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(3));
    assert!(!outcome.success());
}

#[tokio::test]
async fn separates_stdout_and_stderr() {
    let dir = test_dir("streams");
    let outcome = runner(1, 1 << 20)
        .execute(sh("echo out; echo err 1>&2", &dir))
        .await
        .unwrap();
    assert_eq!(outcome.stdout, "out");
    assert_eq!(outcome.stderr, "err");
}

#[tokio::test]
async fn trims_output_only_on_success() {
    let dir = test_dir("trim");
    let ok = runner(1, 1 << 20)
        .execute(sh("printf 'x\\n'", &dir))
        .await
        .unwrap();
    assert_eq!(ok.stdout, "x");

    let failed = runner(1, 1 << 20)
        .execute(sh("printf 'x\\n'; exit 1", &dir))
        .await
        .unwrap();
    assert_eq!(failed.stdout, "x\n");
}

#[tokio::test]
async fn stdin_is_closed() {
    // `cat` with a closed stdin sees EOF immediately instead of hanging.
    let dir = test_dir("stdin");
    let outcome = runner(1, 1 << 20).execute(sh("cat", &dir)).await.unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout, "");
}

// ===========================================================================
// Output cap
// ===========================================================================

const CAP: usize = 1024;

#[tokio::test]
async fn output_at_exactly_the_cap_succeeds() {
    let dir = test_dir("cap-exact");
    let script = format!("head -c {CAP} /dev/zero | tr '\\0' 'a'");
    let outcome = runner(1, CAP).execute(sh(&script, &dir)).await.unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout.len(), CAP);
}

#[tokio::test]
async fn one_byte_over_the_cap_fails_with_truncated_partial() {
    let dir = test_dir("cap-over");
    let script = format!("head -c {} /dev/zero | tr '\\0' 'a'; sleep 5", CAP + 1);
    let err = runner(1, CAP)
        .execute(sh(&script, &dir))
        .await
        .unwrap_err();
    match err {
        DroverError::OutputTooLarge { limit, partial } => {
            assert_eq!(limit, CAP);
            assert_eq!(partial.stdout.len(), CAP);
        }
        other => panic!("expected OutputTooLarge, got {other:?}"),
    }
}

#[tokio::test]
async fn cap_counts_both_streams() {
    let dir = test_dir("cap-both");
    let script = format!(
        "head -c {h} /dev/zero | tr '\\0' 'a'; head -c {h} /dev/zero | tr '\\0' 'b' 1>&2; \
         echo overflow; sleep 5",
        h = CAP / 2
    );
    let err = runner(1, CAP)
        .execute(sh(&script, &dir))
        .await
        .unwrap_err();
    match err {
        DroverError::OutputTooLarge { partial, .. } => {
            assert_eq!(partial.stdout.len() + partial.stderr.len(), CAP);
        }
        other => panic!("expected OutputTooLarge, got {other:?}"),
    }
}

// ===========================================================================
// Timers
// ===========================================================================

#[tokio::test]
async fn idle_timeout_preserves_partial_output() {
    let dir = test_dir("idle");
    let mut inv = sh("echo starting...; sleep 30", &dir);
    inv.idle_timeout = Duration::from_millis(300);
    let err = runner(1, 1 << 20).execute(inv).await.unwrap_err();
    match err {
        DroverError::IdleTimeout { partial, .. } => {
            assert!(partial.stdout.contains("starting..."));
        }
        other => panic!("expected IdleTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn idle_timer_is_not_armed_before_first_output() {
    // The child is silent for longer than the idle budget, then speaks.
    // Silence before the first byte is buffering, not a hang.
    let dir = test_dir("idle-unarmed");
    let mut inv = sh("sleep 1; echo late", &dir);
    inv.idle_timeout = Duration::from_millis(300);
    let outcome = runner(1, 1 << 20).execute(inv).await.unwrap();
    assert_eq!(outcome.stdout, "late");
}

#[tokio::test]
async fn hard_timeout_fires_without_any_output() {
    let dir = test_dir("hard");
    let mut inv = sh("sleep 30", &dir);
    inv.hard_timeout = Duration::from_millis(300);
    inv.idle_timeout = Duration::from_millis(300);
    let err = runner(1, 1 << 20).execute(inv).await.unwrap_err();
    match err {
        DroverError::HardTimeout { partial, .. } => {
            assert!(partial.is_empty());
        }
        other => panic!("expected HardTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn hard_timeout_preserves_bytes_observed_before_it_fired() {
    let dir = test_dir("hard-partial");
    let mut inv = sh("echo first; sleep 30", &dir);
    inv.hard_timeout = Duration::from_millis(400);
    let err = runner(1, 1 << 20).execute(inv).await.unwrap_err();
    match err {
        DroverError::HardTimeout { partial, .. } => {
            assert!(partial.stdout.contains("first"));
        }
        other => panic!("expected HardTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_terminates_the_invocation() {
    let dir = test_dir("cancel");
    let token = CancellationToken::new();
    let mut inv = sh("sleep 30", &dir);
    inv.cancel = Some(token.clone());
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let err = runner(1, 1 << 20).execute(inv).await.unwrap_err();
    assert!(matches!(err, DroverError::Cancelled { .. }));
}

// ===========================================================================
// Process hygiene
// ===========================================================================

#[tokio::test]
async fn spawn_failure_is_reported() {
    let dir = test_dir("spawn");
    let mut inv = sh("true", &dir);
    inv.program = PathBuf::from("/nonexistent/binary");
    let err = runner(1, 1 << 20).execute(inv).await.unwrap_err();
    assert!(matches!(err, DroverError::Spawn { .. }));
}

#[tokio::test]
async fn grandchildren_die_with_the_process_group() {
    let dir = test_dir("pgroup");
    let pidfile = dir.join("grandchild.pid");
    let script = format!(
        "sleep 30 & echo $! > {}; echo started; sleep 30",
        pidfile.display()
    );
    let mut inv = sh(&script, &dir);
    inv.idle_timeout = Duration::from_millis(300);
    let err = runner(1, 1 << 20).execute(inv).await.unwrap_err();
    assert!(matches!(err, DroverError::IdleTimeout { .. }));

    let pid: i32 = std::fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    // The grandchild must be gone shortly after the termination protocol.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let alive = unsafe { libc::kill(pid, 0) } == 0;
    assert!(!alive, "grandchild {pid} survived the group kill");
}

// ===========================================================================
// Concurrency gate
// ===========================================================================

#[tokio::test]
async fn queue_status_accounts_for_all_permits() {
    let r = runner(3, 1 << 20);
    let status = r.queue_status();
    assert_eq!(status.max_concurrent, 3);
    assert_eq!(status.available, 3);
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available + status.in_use, status.max_concurrent);
}

#[tokio::test]
async fn gate_bounds_parallelism_and_everyone_finishes() {
    let dir = test_dir("gate");
    let r = std::sync::Arc::new(runner(2, 1 << 20));

    let mut handles = Vec::new();
    for i in 0..4 {
        let r = r.clone();
        let inv = sh(&format!("sleep 0.4; echo job{i}"), &dir);
        handles.push(tokio::spawn(async move { r.execute(inv).await }));
    }

    // While two jobs hold the gate, the others wait.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let status = r.queue_status();
    assert_eq!(status.in_use, 2);
    assert_eq!(status.available, 0);

    for (i, handle) in handles.into_iter().enumerate() {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.stdout, format!("job{i}"));
    }

    // Quiescent point: every permit back.
    let status = r.queue_status();
    assert_eq!(status.available, 2);
    assert_eq!(status.in_use, 0);
}

#[tokio::test]
async fn permits_are_released_on_timeout_paths() {
    let dir = test_dir("gate-timeout");
    let r = runner(1, 1 << 20);
    let mut inv = sh("sleep 30", &dir);
    inv.hard_timeout = Duration::from_millis(200);
    let _ = r.execute(inv).await.unwrap_err();
    assert_eq!(r.queue_status().available, 1);

    // The slot is usable again.
    let outcome = r.execute(sh("echo again", &dir)).await.unwrap();
    assert_eq!(outcome.stdout, "again");
}
