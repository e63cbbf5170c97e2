#![cfg(unix)]
#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end tests: scheduler in front of real worker processes.

use std::time::{Duration, Instant};

use agentgate_core::Config;
use agentgate_core::config::{FallbackConfig, WorkerConfig};
use agentgate_daemon::scheduler::{Scheduler, SubmitError};
use agentgate_daemon::worker::WorkerError;

const PERSISTENT_AGENT: &str = r#"
echo 'Loading legal agent...'
echo AGENT_READY
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"request_id":\([0-9]*\).*/\1/p')
  printf '{"request_id":%s,"success":true,"response":"Hello! I am your legal assistant. Answer number %s.","timestamp":"2024-05-01T12:00:00"}\n' "$id" "$id"
done
"#;

const FALLBACK_AGENT: &str = r#"
echo 'LOG: one-shot agent'
printf '{"response":"Fallback answer for %s","session_id":"%s"}\n' "$2" "$4"
"#;

fn config(worker_script: &str, fallback_script: &str) -> Config {
    let mut config = Config::default();
    config.scheduler.global_min_interval_ms = 0;
    config.scheduler.session_min_interval_ms = 0;
    config.worker = WorkerConfig {
        program: "sh".into(),
        args: vec!["-c".to_string(), worker_script.to_string()],
        startup_timeout_secs: 5,
        request_timeout_secs: 5,
        terminate_timeout_secs: 1,
        ..WorkerConfig::default()
    };
    config.fallback = FallbackConfig {
        program: "sh".into(),
        args: vec![
            "-c".to_string(),
            fallback_script.to_string(),
            "agent".to_string(),
        ],
        working_directory: None,
        timeout_secs: 5,
    };
    config
}

#[tokio::test]
async fn answers_through_persistent_worker_and_caches() {
    let scheduler = Scheduler::from_config(&config(PERSISTENT_AGENT, FALLBACK_AGENT));

    let first = scheduler
        .submit("What is an NDA?", Some("s1".to_string()), false)
        .await
        .unwrap();
    assert_eq!(first.response, "Answer number 1.");
    assert_eq!(first.session_id, "s1");
    assert_eq!(first.timestamp, "2024-05-01T12:00:00");
    assert!(first.trace_data.is_none());

    let second = scheduler
        .submit("what is an NDA?  ", Some("s1".to_string()), false)
        .await
        .unwrap();
    assert_eq!(first, second);

    let stats = scheduler.stats();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.fallbacks, 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn falls_back_when_persistent_worker_cannot_start() {
    let mut config = config(PERSISTENT_AGENT, FALLBACK_AGENT);
    config.worker.program = "/nonexistent/agentgate-test-worker".into();
    let scheduler = Scheduler::from_config(&config);

    let answer = scheduler
        .submit("nda", Some("s2".to_string()), false)
        .await
        .unwrap();
    assert_eq!(answer.response, "Fallback answer for nda");
    assert_eq!(answer.session_id, "s2");
    assert!(!answer.timestamp.is_empty());
    assert_eq!(scheduler.stats().fallbacks, 1);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn fallback_failure_is_what_the_caller_sees() {
    let mut config = config(PERSISTENT_AGENT, "echo boom >&2\nexit 1");
    config.worker.program = "/nonexistent/agentgate-test-worker".into();
    let scheduler = Scheduler::from_config(&config);

    let err = scheduler.submit("nda", None, false).await.unwrap_err();
    assert_eq!(
        err,
        SubmitError::Worker(WorkerError::ProcessFailed {
            code: Some(1),
            output: "boom".to_string(),
        })
    );
    assert_eq!(scheduler.stats().failed, 1);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn global_interval_spaces_real_dispatches() {
    let mut config = config(PERSISTENT_AGENT, FALLBACK_AGENT);
    config.scheduler.global_min_interval_ms = 300;
    let scheduler = Scheduler::from_config(&config);
    scheduler.primary().initialize().await.unwrap();

    let started = Instant::now();
    let (a, b) = tokio::join!(
        scheduler.submit("first", Some("a".to_string()), false),
        scheduler.submit("second", Some("b".to_string()), false),
    );
    a.unwrap();
    b.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn submit_after_shutdown_is_rejected() {
    let scheduler = Scheduler::from_config(&config(PERSISTENT_AGENT, FALLBACK_AGENT));
    scheduler.shutdown().await;

    let err = scheduler.submit("late", None, false).await.unwrap_err();
    assert!(matches!(err, SubmitError::Admission(_)));
}
