//! `agentgate`
//!
//! Reads questions as JSON lines on stdin, answers each one through the
//! rate-limited scheduler and writes one JSON result line per question to
//! stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use agentgate_core::Config;
use agentgate_core::frame::AgentResponse;
use agentgate_daemon::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "agentgate")]
#[command(version, about = "agentgate - rate-limited gateway to an agent worker process")]
struct Args {
    /// Path to a JSON settings file
    #[arg(long, env = "AGENTGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Program that runs the persistent worker
    #[arg(long)]
    worker_program: Option<PathBuf>,

    /// Argument passed to the persistent worker (repeatable)
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    /// Program that runs the one-shot fallback worker
    #[arg(long)]
    fallback_program: Option<PathBuf>,

    /// Argument passed to the fallback worker before the request flags (repeatable)
    #[arg(long = "fallback-arg", allow_hyphen_values = true)]
    fallback_args: Vec<String>,

    /// Minimum milliseconds between any two worker dispatches
    #[arg(long)]
    global_interval_ms: Option<u64>,

    /// Minimum milliseconds between two dispatches for the same session
    #[arg(long)]
    session_interval_ms: Option<u64>,

    /// Start the persistent worker before the first question arrives
    #[arg(long)]
    warm_up: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "AGENTGATE_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(program) = &self.worker_program {
            config.worker.program.clone_from(program);
        }
        if !self.worker_args.is_empty() {
            config.worker.args.clone_from(&self.worker_args);
        }
        if let Some(program) = &self.fallback_program {
            config.fallback.program.clone_from(program);
        }
        if !self.fallback_args.is_empty() {
            config.fallback.args.clone_from(&self.fallback_args);
        }
        if let Some(ms) = self.global_interval_ms {
            config.scheduler.global_min_interval_ms = ms;
        }
        if let Some(ms) = self.session_interval_ms {
            config.scheduler.session_min_interval_ms = ms;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
    }
}

/// One question read from stdin.
#[derive(Debug, Deserialize)]
struct Submission {
    /// Echoed back unchanged so callers can match results to questions.
    #[serde(default)]
    id: Option<Value>,
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    enable_trace: bool,
}

/// One result line written to stdout.
#[derive(Debug, Serialize)]
struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    success: bool,
    #[serde(flatten)]
    answer: Option<AgentResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Reply {
    const fn ok(id: Option<Value>, answer: AgentResponse) -> Self {
        Self {
            id,
            success: true,
            answer: Some(answer),
            error: None,
        }
    }

    const fn failed(id: Option<Value>, error: String) -> Self {
        Self {
            id,
            success: false,
            answer: None,
            error: Some(error),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = agentgate_core::config::load_config(args.config.as_deref())?;
    args.apply(&mut config);
    agentgate_core::config::validate(&config)?;

    let log_filter = format!(
        "agentgate_daemon={level},agentgate={level},agentgate_core={level}",
        level = config.log_level
    );
    agentgate_core::tracing_init::init_tracing(&log_filter, args.log_json)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        worker = %config.worker.program.display(),
        fallback = %config.fallback.program.display(),
        "Starting agentgate"
    );

    let scheduler = Arc::new(Scheduler::from_config(&config));

    if args.warm_up {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            if let Err(e) = scheduler.primary().initialize().await {
                warn!(error = %e, "Persistent worker warm-up failed");
            }
        });
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Reply>();
    let writer = tokio::spawn(write_replies(out_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();
    tokio::pin!(sigterm_future);

    let mut input = BufReader::new(tokio::io::stdin());
    let mut buf = Vec::new();
    let mut inflight = JoinSet::new();

    loop {
        tokio::select! {
            read = input.read_until(b'\n', &mut buf) => match read {
                Ok(n) => {
                    if !buf.is_empty() {
                        let reply = match decode_line(&buf) {
                            Ok(line) => accept_line(line, &scheduler, &out_tx, &mut inflight),
                            Err(reply) => Some(reply),
                        };
                        if let Some(reply) = reply {
                            let _ = out_tx.send(reply);
                        }
                        buf.clear();
                    }
                    if n == 0 {
                        info!("Input closed");
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read input");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
                break;
            }
            _ = &mut sigterm_future => {
                info!("Received SIGTERM shutdown signal");
                break;
            }
        }
    }

    // Everything read so far is already queued and gets answered before the
    // worker is stopped.
    scheduler.shutdown().await;
    while inflight.join_next().await.is_some() {}
    drop(out_tx);
    if let Err(e) = writer.await {
        warn!(error = %e, "Output writer task failed");
    }

    let stats = scheduler.stats();
    info!(
        submitted = stats.submitted,
        cache_hits = stats.cache_hits,
        dispatched = stats.dispatched,
        fallbacks = stats.fallbacks,
        succeeded = stats.succeeded,
        failed = stats.failed,
        "agentgate stopped"
    );
    Ok(())
}

/// Strip the line terminator and check the encoding. A line that is not
/// UTF-8 is answered with a failed reply instead of ending the input loop.
fn decode_line(raw: &[u8]) -> Result<&str, Reply> {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    std::str::from_utf8(raw).map_err(|e| {
        warn!(error = %e, "Rejected input line that is not valid UTF-8");
        Reply::failed(None, format!("Invalid request: input is not valid UTF-8 ({e})"))
    })
}

/// Parse one input line and queue it. Returns a reply to write immediately
/// when the line cannot be queued.
fn accept_line(
    line: &str,
    scheduler: &Scheduler,
    out_tx: &mpsc::UnboundedSender<Reply>,
    inflight: &mut JoinSet<()>,
) -> Option<Reply> {
    if line.trim().is_empty() {
        return None;
    }
    let submission: Submission = match serde_json::from_str(line) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Rejected malformed input line");
            return Some(Reply::failed(None, format!("Invalid request: {e}")));
        }
    };

    let Submission {
        id,
        message,
        session_id,
        enable_trace,
    } = submission;
    let pending = scheduler.submit(message, session_id, enable_trace);
    let out_tx = out_tx.clone();
    inflight.spawn(async move {
        let reply = match pending.await {
            Ok(answer) => Reply::ok(id, answer),
            Err(e) => Reply::failed(id, e.to_string()),
        };
        let _ = out_tx.send(reply);
    });
    None
}

async fn write_replies(mut rx: mpsc::UnboundedReceiver<Reply>) {
    let mut stdout = tokio::io::stdout();
    while let Some(reply) = rx.recv().await {
        let mut line = match serde_json::to_string(&reply) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize reply");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            warn!(error = %e, "Failed to write reply, stopping output");
            return;
        }
        if let Err(e) = stdout.flush().await {
            debug!(error = %e, "Failed to flush stdout");
        }
    }
}
