#![cfg(unix)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use scenic_bridge::{LaunchSpec, ProcessError, ProcessSupervisor, SupervisorConfig};

fn supervisor(startup_grace_ms: u64, stop_grace_ms: u64) -> ProcessSupervisor {
    ProcessSupervisor::new(SupervisorConfig {
        startup_grace: Duration::from_millis(startup_grace_ms),
        stop_grace: Duration::from_millis(stop_grace_ms),
        ..SupervisorConfig::default()
    })
}

fn shell(dir: &tempfile::TempDir, script: &str) -> LaunchSpec {
    LaunchSpec {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        working_dir: dir.path().to_path_buf(),
        env: HashMap::from([("SCENIC_TEST".to_string(), "1".to_string())]),
    }
}

async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_start_capture_and_graceful_stop() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(200, 1000);

    let report = supervisor
        .start(shell(&dir, "echo ready $SCENIC_TEST; echo oops >&2; exec sleep 30"))
        .await
        .unwrap();
    assert!(report.pid > 0);
    assert!(supervisor.status().running);

    assert!(
        wait_until(Duration::from_secs(2), || {
            let lines: Vec<String> = supervisor.logs(10).iter().map(|l| l.to_string()).collect();
            lines.iter().any(|l| l.ends_with("[stdout] ready 1"))
                && lines.iter().any(|l| l.ends_with("[stderr] oops"))
        })
        .await
    );

    let stop = supervisor.stop().await.unwrap();
    assert!(!stop.forced);
    assert_eq!(stop.pid, report.pid);
    assert_eq!(stop.path, dir.path());
    assert!(!supervisor.status().running);
}

#[tokio::test]
async fn test_exit_during_startup_grace_is_failure() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(1000, 1000);

    let err = supervisor
        .start(shell(&dir, "echo boom >&2; exit 3"))
        .await
        .unwrap_err();

    match err {
        ProcessError::ExitedDuringStartup {
            code, recent_logs, ..
        } => {
            assert_eq!(code, Some(3));
            assert!(recent_logs.iter().any(|l| l.ends_with("[stderr] boom")));
        }
        other => panic!("expected startup failure, got {other:?}"),
    }
    let status = supervisor.status();
    assert!(!status.running);
    assert!(status.pid.is_none());
}

#[tokio::test]
async fn test_stop_escalates_when_term_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(300, 300);

    supervisor
        .start(shell(&dir, "trap '' TERM; exec sleep 30"))
        .await
        .unwrap();

    let started = Instant::now();
    let stop = supervisor.stop().await.unwrap();

    assert!(stop.forced);
    assert_eq!(stop.path, dir.path());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn test_start_waits_for_stop_in_progress() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(100, 300);

    let first = supervisor
        .start(shell(&dir, "trap '' TERM; exec sleep 30"))
        .await
        .unwrap();
    let stopping = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;

    let second = supervisor.start(shell(&dir, "exec sleep 30")).await.unwrap();
    assert!(stopping.is_finished());
    let stop = stopping.await.unwrap().unwrap();
    assert!(stop.forced);
    assert_eq!(stop.pid, first.pid);

    // The first child is reaped before the second one exists.
    assert_ne!(unsafe { libc::kill(first.pid as libc::pid_t, 0) }, 0);
    let status = supervisor.status();
    assert_eq!(status.pid, Some(second.pid));
    assert_eq!(status.last_exit.map(|e| e.pid), Some(first.pid));
    let exited = format!("process {} exited", first.pid);
    assert!(supervisor
        .logs(50)
        .iter()
        .all(|l| !l.to_string().contains(&exited)));

    supervisor.shutdown().await;
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(100, 1000);

    let first = supervisor.start(shell(&dir, "exec sleep 30")).await.unwrap();
    let err = supervisor
        .start(shell(&dir, "exec sleep 30"))
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::AlreadyRunning { pid, .. } if pid == first.pid));
    supervisor.shutdown().await;
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn test_unexpected_exit_clears_state_and_records_code() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(100, 1000);

    supervisor
        .start(shell(&dir, "sleep 0.4; exit 7"))
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || !supervisor.is_running()).await);

    let status = supervisor.status();
    let exit = status.last_exit.unwrap();
    assert_eq!(exit.code, Some(7));
    assert!(!exit.requested);

    let last = supervisor.logs(1).pop().unwrap().to_string();
    assert!(last.contains("[supervisor]"), "{last}");
    assert!(last.contains("exit code 7"), "{last}");
}

#[tokio::test]
async fn test_log_buffer_keeps_most_recent_lines() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(100, 1000);

    supervisor
        .start(shell(
            &dir,
            "i=1; while [ $i -le 1200 ]; do echo line $i; i=$((i+1)); done; exec sleep 30",
        ))
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            supervisor
                .logs(1)
                .first()
                .is_some_and(|l| l.text == "line 1200")
        })
        .await
    );

    let tail: Vec<String> = supervisor.logs(5).into_iter().map(|l| l.text).collect();
    assert_eq!(
        tail,
        vec!["line 1196", "line 1197", "line 1198", "line 1199", "line 1200"]
    );
    assert_eq!(supervisor.log_buffer().len(), 1000);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_missing_program_is_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(100, 100);

    let err = supervisor
        .start(LaunchSpec {
            program: "definitely-not-a-real-binary-4711".to_string(),
            args: vec![],
            working_dir: dir.path().to_path_buf(),
            env: HashMap::new(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::Spawn { .. }));
    assert!(!supervisor.is_running());
}
