#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the worker channels.
//!
//! Workers are small `sh` scripts speaking the same line protocol as the real
//! agent: noise, `AGENT_READY`, then one JSON frame per request.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agentgate_core::config::{FallbackConfig, WorkerConfig};
use agentgate_core::frame::AgentRequest;
use agentgate_daemon::worker::{
    AgentInvoker, PersistentWorker, TransientInvoker, WorkerError, WorkerPhase,
};

/// Answers every request with `echo <id>`, keeping the request's id.
const ECHO_LOOP: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"request_id":\([0-9]*\).*/\1/p')
  printf '{"request_id":%s,"success":true,"response":"echo %s","session_id":"s1"}\n' "$id" "$id"
done
"#;

fn worker_config(script: &str) -> WorkerConfig {
    WorkerConfig {
        program: "sh".into(),
        args: vec!["-c".to_string(), script.to_string()],
        startup_timeout_secs: 5,
        request_timeout_secs: 5,
        terminate_timeout_secs: 1,
        ..WorkerConfig::default()
    }
}

fn echo_worker() -> PersistentWorker {
    PersistentWorker::new(worker_config(&format!(
        "echo 'loading agent'\necho AGENT_READY\n{ECHO_LOOP}"
    )))
}

fn request(message: &str) -> AgentRequest {
    AgentRequest::new(message, Some("s1".to_string()), false)
}

fn fallback_config(script: &str) -> FallbackConfig {
    FallbackConfig {
        program: "sh".into(),
        args: vec!["-c".to_string(), script.to_string(), "agent".to_string()],
        working_directory: None,
        timeout_secs: 5,
    }
}

fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

// =========================================================================
// Persistent worker
// =========================================================================

#[tokio::test]
async fn ready_worker_answers_outstanding_request() {
    let worker = PersistentWorker::new(worker_config(
        r#"echo AGENT_READY
read -r line
printf '{"request_id":1,"success":true,"response":"Hello"}\n'
"#,
    ));

    let frame = worker.send(&request("hi")).await.unwrap();
    assert_eq!(frame.request_id, Some(1));
    assert_eq!(frame.response.as_deref(), Some("Hello"));
}

#[tokio::test]
async fn starts_lazily_and_reports_phases() {
    let worker = echo_worker();
    assert_eq!(worker.phase().await, WorkerPhase::NotStarted);

    worker.initialize().await.unwrap();
    assert_eq!(worker.phase().await, WorkerPhase::Ready);

    worker.shutdown().await;
    assert_eq!(worker.phase().await, WorkerPhase::Closed);
}

#[tokio::test]
async fn concurrent_requests_get_their_own_answers() {
    let worker = Arc::new(echo_worker());

    let mut handles = Vec::new();
    for i in 0..5 {
        let worker = Arc::clone(&worker);
        handles.push(tokio::spawn(async move {
            worker.send(&request(&format!("question {i}"))).await
        }));
    }

    for handle in handles {
        let frame = handle.await.unwrap().unwrap();
        let id = frame.request_id.unwrap();
        assert_eq!(frame.response, Some(format!("echo {id}")));
    }
    assert_eq!(worker.pending_count().await, 0);
    worker.shutdown().await;
}

#[tokio::test]
async fn request_ids_increase_monotonically() {
    let worker = echo_worker();
    let first = worker.send(&request("a")).await.unwrap();
    let second = worker.send(&request("b")).await.unwrap();
    assert!(second.request_id.unwrap() > first.request_id.unwrap());
    worker.shutdown().await;
}

#[tokio::test]
async fn concurrent_first_calls_share_one_startup() {
    let dir = tempfile::TempDir::new().unwrap();
    let spawns = dir.path().join("spawns");
    let worker = Arc::new(PersistentWorker::new(worker_config(&format!(
        "echo spawned >> '{}'\nsleep 1\necho AGENT_READY\n{ECHO_LOOP}",
        spawns.display()
    ))));

    let (req_a, req_b, req_c) = (request("a"), request("b"), request("c"));
    let (a, b, c) = tokio::join!(
        worker.send(&req_a),
        worker.send(&req_b),
        worker.send(&req_c),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(line_count(&spawns), 1);
    worker.shutdown().await;
}

#[tokio::test]
async fn crash_fails_every_pending_request_then_restarts() {
    let dir = tempfile::TempDir::new().unwrap();
    let marker = dir.path().join("crashed-once");
    let spawns = dir.path().join("spawns");
    let script = format!(
        r#"echo spawned >> '{spawns}'
echo AGENT_READY
if [ ! -f '{marker}' ]; then
  touch '{marker}'
  read -r a; read -r b; read -r c
  exit 1
fi
{ECHO_LOOP}"#,
        spawns = spawns.display(),
        marker = marker.display(),
    );
    let worker = Arc::new(PersistentWorker::new(worker_config(&script)));

    let (req_a, req_b, req_c) = (request("a"), request("b"), request("c"));
    let (a, b, c) = tokio::join!(
        worker.send(&req_a),
        worker.send(&req_b),
        worker.send(&req_c),
    );
    for result in [a, b, c] {
        assert_eq!(result.unwrap_err(), WorkerError::ProcessClosed);
    }
    assert_eq!(worker.phase().await, WorkerPhase::Closed);

    let frame = worker.send(&request("again")).await.unwrap();
    assert!(frame.response.unwrap().starts_with("echo "));
    assert_eq!(worker.phase().await, WorkerPhase::Ready);
    assert_eq!(line_count(&spawns), 2);
    worker.shutdown().await;
}

#[tokio::test]
async fn timeout_removes_pending_and_ignores_late_answer() {
    let mut config = worker_config(&format!(
        r#"echo AGENT_READY
IFS= read -r line
sleep 2
printf '{{"request_id":1,"success":true,"response":"too late"}}\n'
{ECHO_LOOP}"#
    ));
    config.request_timeout_secs = 1;
    let worker = PersistentWorker::new(config);

    let err = worker.send(&request("slow")).await.unwrap_err();
    assert_eq!(
        err,
        WorkerError::Timeout {
            request_id: 1,
            secs: 1
        }
    );
    assert_eq!(worker.pending_count().await, 0);

    // Let the late answer arrive; it must not disturb the next request.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let frame = worker.send(&request("fast")).await.unwrap();
    assert_eq!(frame.request_id, Some(2));
    assert_eq!(frame.response.as_deref(), Some("echo 2"));
    worker.shutdown().await;
}

#[tokio::test]
async fn startup_timeout_fails_every_waiting_caller() {
    let mut config = worker_config("echo 'still loading'\nexec sleep 30");
    config.startup_timeout_secs = 1;
    let worker = Arc::new(PersistentWorker::new(config));

    let req = request("q");
    let (a, b) = tokio::join!(worker.initialize(), worker.send(&req));
    assert_eq!(a.unwrap_err(), WorkerError::StartupTimeout { secs: 1 });
    assert_eq!(b.unwrap_err(), WorkerError::StartupTimeout { secs: 1 });
    assert_eq!(worker.phase().await, WorkerPhase::Closed);
}

#[tokio::test]
async fn exit_before_ready_reports_startup_output() {
    let worker = PersistentWorker::new(worker_config(
        "echo 'loading agent'\necho 'fatal: missing credentials'\nexit 3",
    ));

    let err = worker.initialize().await.unwrap_err();
    match err {
        WorkerError::StartupFailed { reason } => {
            assert!(reason.contains("fatal: missing credentials"), "{reason}");
        }
        other => panic!("expected StartupFailed, got {other:?}"),
    }
    assert_eq!(worker.phase().await, WorkerPhase::Closed);
}

#[tokio::test]
async fn startup_failure_keeps_only_the_last_noise_lines() {
    let worker = PersistentWorker::new(worker_config(
        "i=1\nwhile [ $i -le 2000 ]; do echo \"noise $i\"; i=$((i+1)); done\nexit 1",
    ));

    let err = worker.initialize().await.unwrap_err();
    let WorkerError::StartupFailed { reason } = err else {
        panic!("expected StartupFailed, got {err:?}");
    };
    assert_eq!(
        reason,
        "noise 1996 | noise 1997 | noise 1998 | noise 1999 | noise 2000"
    );
}

#[tokio::test]
async fn malformed_lines_are_skipped() {
    let worker = PersistentWorker::new(worker_config(
        r#"echo AGENT_READY
IFS= read -r line
echo 'DEBUG: thinking'
echo '{"success":true,"response":"no id"}'
echo '{broken'
printf '{"request_id":1,"success":true,"response":"real answer"}\n'
cat > /dev/null
"#,
    ));

    let frame = worker.send(&request("q")).await.unwrap();
    assert_eq!(frame.response.as_deref(), Some("real answer"));
    worker.shutdown().await;
}

#[tokio::test]
async fn agent_failure_frame_becomes_agent_error() {
    let worker = PersistentWorker::new(worker_config(
        r#"echo AGENT_READY
IFS= read -r line
printf '{"request_id":1,"success":false,"error":"Bedrock throttled"}\n'
cat > /dev/null
"#,
    ));

    let err = worker.send(&request("q")).await.unwrap_err();
    assert_eq!(
        err,
        WorkerError::Agent {
            message: "Bedrock throttled".to_string()
        }
    );
    worker.shutdown().await;
}

#[tokio::test]
async fn missing_program_is_spawn_failure() {
    let worker = PersistentWorker::new(WorkerConfig {
        program: "/nonexistent/agentgate-test-worker".into(),
        args: Vec::new(),
        ..WorkerConfig::default()
    });

    let err = worker.initialize().await.unwrap_err();
    assert!(matches!(err, WorkerError::SpawnFailed { .. }), "{err:?}");
    assert_eq!(worker.phase().await, WorkerPhase::Closed);
}

#[tokio::test]
async fn shutdown_then_next_call_starts_fresh_process() {
    let dir = tempfile::TempDir::new().unwrap();
    let spawns = dir.path().join("spawns");
    let worker = PersistentWorker::new(worker_config(&format!(
        "echo spawned >> '{}'\necho AGENT_READY\n{ECHO_LOOP}",
        spawns.display()
    )));

    worker.send(&request("a")).await.unwrap();
    worker.shutdown().await;
    worker.send(&request("b")).await.unwrap();
    assert_eq!(line_count(&spawns), 2);
    worker.shutdown().await;
}

#[tokio::test]
async fn shutdown_during_startup_stops_the_new_process() {
    let dir = tempfile::TempDir::new().unwrap();
    let pid_file = dir.path().join("pid");
    let worker = Arc::new(PersistentWorker::new(worker_config(&format!(
        "echo $$ > '{}'\nsleep 1\necho AGENT_READY\n{ECHO_LOOP}",
        pid_file.display()
    ))));

    let caller = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.send(&request("early")).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(worker.phase().await, WorkerPhase::Starting);

    worker.shutdown().await;
    assert_eq!(worker.phase().await, WorkerPhase::Closed);
    assert!(matches!(
        caller.await.unwrap(),
        Err(WorkerError::ProcessClosed)
    ));

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    let alive = std::process::Command::new("kill")
        .args(["-0", pid.trim()])
        .status()
        .unwrap()
        .success();
    assert!(!alive, "worker process {} still running", pid.trim());

    // A later call still gets a working process.
    let frame = worker.send(&request("late")).await.unwrap();
    assert!(frame.success);
    worker.shutdown().await;
}

#[tokio::test]
async fn worker_used_through_invoker_seam() {
    let worker = echo_worker();
    let frame = AgentInvoker::invoke(&worker, &request("q")).await.unwrap();
    assert_eq!(frame.session_id.as_deref(), Some("s1"));
    AgentInvoker::shutdown(&worker).await;
    assert_eq!(worker.phase().await, WorkerPhase::Closed);
}

// =========================================================================
// Transient worker
// =========================================================================

#[tokio::test]
async fn transient_payload_found_among_log_lines() {
    let invoker = TransientInvoker::new(fallback_config(
        r#"echo 'LOG: starting'
printf '{"response":"ok","session_id":"s1"}\n'
echo 'LOG: done'
"#,
    ));

    let frame = invoker.run(&request("q")).await.unwrap();
    assert_eq!(frame.response.as_deref(), Some("ok"));
    assert_eq!(frame.session_id.as_deref(), Some("s1"));
}

#[tokio::test]
async fn transient_nonzero_exit_carries_stderr() {
    let invoker = TransientInvoker::new(fallback_config(
        r#"printf '{"response":"ignored"}\n'
echo boom >&2
exit 1
"#,
    ));

    let err = invoker.run(&request("q")).await.unwrap_err();
    assert_eq!(
        err,
        WorkerError::ProcessFailed {
            code: Some(1),
            output: "boom".to_string()
        }
    );
    assert!(err.to_string().contains("boom"));
}

#[tokio::test]
async fn transient_receives_request_flags() {
    // Echo the flags back as the answer.
    let invoker = TransientInvoker::new(fallback_config(
        r#"printf '{"response":"%s %s %s %s %s %s"}\n' "$1" "$2" "$3" "$4" "$5" "$6""#,
    ));

    let frame = invoker
        .run(&AgentRequest::new("nda", Some("s7".to_string()), true))
        .await
        .unwrap();
    assert_eq!(
        frame.response.as_deref(),
        Some("--message nda --session-id s7 --enable-trace true")
    );
}

#[tokio::test]
async fn transient_without_json_is_no_json_response() {
    let invoker = TransientInvoker::new(fallback_config("echo 'LOG: nothing to say'"));
    let err = invoker.run(&request("q")).await.unwrap_err();
    assert_eq!(err, WorkerError::NoJsonResponse);
}

#[tokio::test]
async fn transient_agent_failure_is_agent_error() {
    let invoker = TransientInvoker::new(fallback_config(
        r#"printf '{"success":false,"error":"no agent configured"}\n'"#,
    ));
    let err = invoker.run(&request("q")).await.unwrap_err();
    assert_eq!(
        err,
        WorkerError::Agent {
            message: "no agent configured".to_string()
        }
    );
}

#[tokio::test]
async fn transient_missing_program_is_spawn_failure() {
    let invoker = TransientInvoker::new(FallbackConfig {
        program: "/nonexistent/agentgate-test-fallback".into(),
        ..FallbackConfig::default()
    });
    let err = invoker.run(&request("q")).await.unwrap_err();
    assert!(matches!(err, WorkerError::SpawnFailed { .. }), "{err:?}");
}

#[tokio::test]
async fn transient_hang_is_killed_after_timeout() {
    let mut config = fallback_config("exec sleep 30");
    config.timeout_secs = 1;
    let invoker = TransientInvoker::new(config);

    let started = std::time::Instant::now();
    let err = invoker.run(&request("q")).await.unwrap_err();
    assert!(matches!(err, WorkerError::ProcessFailed { code: None, .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(10));
}
