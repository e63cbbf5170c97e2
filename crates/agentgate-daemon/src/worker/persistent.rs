//! Long-lived agent worker process.
//!
//! The worker is spawned lazily on first use. Everything it prints before the
//! ready sentinel is startup noise; afterwards each stdout line is a JSON
//! response frame carrying the `request_id` of the request it answers.
//!
//! Lifecycle: `NotStarted -> Starting -> Ready -> Closed`. A failed startup
//! also lands in `Closed`. Any call made while `Closed` spawns a fresh process
//! and repeats the handshake.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use agentgate_core::config::WorkerConfig;
use agentgate_core::frame::{
    AgentRequest, LineBuffer, WorkerResponse, is_ready_line, parse_response_line,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{AgentInvoker, WorkerError, passthrough_env, terminate_process};

/// Capacity of the stdin writer queue.
const STDIN_QUEUE: usize = 32;

/// How many trailing startup lines are kept for error reports.
const STARTUP_NOISE_TAIL: usize = 5;

/// After the process exits, how long its buffered stdout may still be read
/// before pending requests are failed.
const STDOUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

type ResponseSink = oneshot::Sender<Result<WorkerResponse, WorkerError>>;
type StartOutcome = Result<Arc<Connection>, WorkerError>;

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    NotStarted,
    Starting,
    Ready,
    Closed,
}

enum Phase {
    NotStarted,
    /// Every caller arriving during startup waits on the same outcome.
    Starting(watch::Receiver<Option<StartOutcome>>),
    Ready(Arc<Connection>),
    Closed,
}

struct ChannelState {
    phase: Phase,
    /// Bumped on every spawn so a dying process cannot close its successor.
    generation: u64,
}

/// One spawned worker process and its request bookkeeping.
struct Connection {
    generation: u64,
    pid: Option<u32>,
    stdin_tx: mpsc::Sender<String>,
    pending: Mutex<HashMap<u64, ResponseSink>>,
    closed: AtomicBool,
    shutdown_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    exited_rx: watch::Receiver<bool>,
}

impl Connection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ask the exit monitor to stop the process. Idempotent.
    fn request_shutdown(&self) {
        let tx = match self.shutdown_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// Route one stdout line to the caller waiting on its `request_id`.
    async fn dispatch_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let frame = match parse_response_line(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, line, "Dropping malformed worker output");
                return;
            }
        };

        let Some(request_id) = frame.request_id else {
            warn!(
                pid = ?self.pid,
                error = ?frame.error,
                "Dropping worker frame without request_id"
            );
            return;
        };

        let Some(sink) = self.pending.lock().await.remove(&request_id) else {
            debug!(request_id, "No pending request for worker response, ignoring");
            return;
        };

        let result = if frame.success {
            Ok(frame)
        } else {
            Err(WorkerError::Agent {
                message: frame.error_message(),
            })
        };
        if sink.send(result).is_err() {
            debug!(request_id, "Caller dropped before the worker answered");
        }
    }
}

/// Client for the long-lived agent worker.
pub struct PersistentWorker {
    config: WorkerConfig,
    state: Arc<Mutex<ChannelState>>,
    next_request_id: AtomicU64,
}

impl PersistentWorker {
    /// Create a client. No process is spawned until the first call.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ChannelState {
                phase: Phase::NotStarted,
                generation: 0,
            })),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Current lifecycle state.
    pub async fn phase(&self) -> WorkerPhase {
        match self.state.lock().await.phase {
            Phase::NotStarted => WorkerPhase::NotStarted,
            Phase::Starting(_) => WorkerPhase::Starting,
            Phase::Ready(_) => WorkerPhase::Ready,
            Phase::Closed => WorkerPhase::Closed,
        }
    }

    /// Number of requests sent and not yet answered, timed out, or failed.
    pub async fn pending_count(&self) -> usize {
        let conn = match &self.state.lock().await.phase {
            Phase::Ready(conn) => Arc::clone(conn),
            _ => return 0,
        };
        conn.pending.lock().await.len()
    }

    /// Spawn the worker and wait for its handshake, unless it is already up.
    pub async fn initialize(&self) -> Result<(), WorkerError> {
        self.ensure_ready().await.map(|_| ())
    }

    /// Send one request and wait for the matching response frame.
    pub async fn send(&self, request: &AgentRequest) -> Result<WorkerResponse, WorkerError> {
        let conn = self.ensure_ready().await?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&request.to_frame(request_id)).map_err(|e| {
            WorkerError::Protocol {
                reason: e.to_string(),
            }
        })?;

        let (tx, rx) = oneshot::channel();
        conn.pending.lock().await.insert(request_id, tx);

        // The exit path sets `closed` before draining, so a request registered
        // after the drain is caught here.
        if conn.is_closed() || conn.stdin_tx.send(line).await.is_err() {
            conn.pending.lock().await.remove(&request_id);
            return Err(WorkerError::ProcessClosed);
        }
        debug!(
            request_id,
            session_id = ?request.session_id,
            "Sent request to worker"
        );

        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::ProcessClosed),
            Err(_) => {
                conn.pending.lock().await.remove(&request_id);
                warn!(request_id, timeout_secs = timeout.as_secs(), "Worker request timed out");
                Err(WorkerError::Timeout {
                    request_id,
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    /// Stop the worker process if one is running.
    ///
    /// Pending requests fail with [`WorkerError::ProcessClosed`]. A later call
    /// starts a new process.
    pub async fn shutdown(&self) {
        let (conn, starting) = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut state.phase, Phase::Closed) {
                Phase::Ready(conn) => (Some(conn), None),
                Phase::Starting(rx) => {
                    // The startup task sees the stale generation and stops
                    // whatever it spawned.
                    state.generation += 1;
                    (None, Some(rx))
                }
                other => {
                    state.phase = other;
                    (None, None)
                }
            }
        };

        if let Some(mut starting) = starting {
            info!("Shutting down worker during startup");
            let _ = starting.wait_for(Option::is_some).await;
            return;
        }
        let Some(conn) = conn else {
            return;
        };

        info!(pid = ?conn.pid, "Shutting down worker");
        stop_connection(&conn).await;
    }

    async fn ensure_ready(&self) -> Result<Arc<Connection>, WorkerError> {
        let mut outcome_rx = {
            let mut state = self.state.lock().await;
            match &state.phase {
                Phase::Ready(conn) => return Ok(Arc::clone(conn)),
                Phase::Starting(rx) => rx.clone(),
                Phase::NotStarted | Phase::Closed => {
                    state.generation += 1;
                    let generation = state.generation;
                    let (tx, rx) = watch::channel(None);
                    state.phase = Phase::Starting(rx.clone());
                    // Detached so a caller giving up cannot abandon the handshake
                    // other callers are waiting on.
                    tokio::spawn(start_worker(
                        self.config.clone(),
                        Arc::clone(&self.state),
                        generation,
                        tx,
                    ));
                    rx
                }
            }
        };

        let outcome = {
            let current = outcome_rx.wait_for(Option::is_some).await.map_err(|_| {
                WorkerError::StartupFailed {
                    reason: "startup task ended without a result".to_string(),
                }
            })?;
            Option::clone(&current)
        };
        outcome.unwrap_or_else(|| {
            Err(WorkerError::StartupFailed {
                reason: "startup task ended without a result".to_string(),
            })
        })
    }
}

impl AgentInvoker for PersistentWorker {
    async fn invoke(&self, request: &AgentRequest) -> Result<WorkerResponse, WorkerError> {
        self.send(request).await
    }

    async fn shutdown(&self) {
        Self::shutdown(self).await;
    }
}

async fn start_worker(
    config: WorkerConfig,
    shared: Arc<Mutex<ChannelState>>,
    generation: u64,
    outcome_tx: watch::Sender<Option<StartOutcome>>,
) {
    let mut outcome = spawn_connection(&config, &shared, generation).await;

    let superseded = {
        let mut state = shared.lock().await;
        if state.generation == generation {
            state.phase = match &outcome {
                Ok(conn) if !conn.is_closed() => Phase::Ready(Arc::clone(conn)),
                _ => Phase::Closed,
            };
            false
        } else {
            true
        }
    };

    if superseded {
        if let Ok(conn) = &outcome {
            info!(pid = ?conn.pid, generation, "Worker stopped before it became ready");
            stop_connection(conn).await;
        }
        outcome = Err(WorkerError::ProcessClosed);
    } else {
        match &outcome {
            Ok(conn) => info!(pid = ?conn.pid, generation, "Worker ready"),
            Err(e) => error!(error = %e, generation, "Worker failed to start"),
        }
    }
    outcome_tx.send_replace(Some(outcome));
}

/// Ask the exit monitor to stop the process and wait until it has exited.
async fn stop_connection(conn: &Connection) {
    conn.request_shutdown();
    let mut exited = conn.exited_rx.clone();
    let _ = exited.wait_for(|done| *done).await;
}

async fn spawn_connection(
    config: &WorkerConfig,
    shared: &Arc<Mutex<ChannelState>>,
    generation: u64,
) -> StartOutcome {
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_directory {
        cmd.current_dir(dir);
    }
    passthrough_env(&mut cmd);

    info!(
        program = %config.program.display(),
        args = ?config.args,
        generation,
        "Spawning agent worker"
    );
    let mut child = cmd.spawn().map_err(|e| WorkerError::SpawnFailed {
        reason: e.to_string(),
    })?;
    let pid = child.id();

    let stdin = child.stdin.take().ok_or_else(|| WorkerError::SpawnFailed {
        reason: "Failed to capture stdin".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| WorkerError::SpawnFailed {
        reason: "Failed to capture stdout".to_string(),
    })?;
    let stderr = child.stderr.take();

    let (stdin_tx, stdin_rx) = mpsc::channel::<String>(STDIN_QUEUE);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = watch::channel(false);
    let conn = Arc::new(Connection {
        generation,
        pid,
        stdin_tx,
        pending: Mutex::new(HashMap::new()),
        closed: AtomicBool::new(false),
        shutdown_tx: std::sync::Mutex::new(Some(shutdown_tx)),
        exited_rx,
    });

    let (ready_tx, ready_rx) = oneshot::channel();
    let (stdout_done_tx, stdout_done_rx) = oneshot::channel();
    tokio::spawn(write_stdin(stdin, stdin_rx, pid));
    if let Some(stderr) = stderr {
        tokio::spawn(forward_stderr(stderr, pid));
    }
    tokio::spawn(read_stdout(
        stdout,
        config.ready_sentinel.clone(),
        ready_tx,
        stdout_done_tx,
        Arc::clone(&conn),
        Arc::clone(shared),
    ));
    tokio::spawn(monitor_exit(
        child,
        shutdown_rx,
        stdout_done_rx,
        exited_tx,
        config.terminate_timeout(),
        Arc::clone(&conn),
        Arc::clone(shared),
    ));

    let startup_timeout = config.startup_timeout();
    match tokio::time::timeout(startup_timeout, ready_rx).await {
        Ok(Ok(Ok(()))) => Ok(conn),
        Ok(Ok(Err(reason))) => {
            conn.request_shutdown();
            Err(WorkerError::StartupFailed { reason })
        }
        Ok(Err(_)) => {
            conn.request_shutdown();
            Err(WorkerError::StartupFailed {
                reason: "stdout reader stopped".to_string(),
            })
        }
        Err(_) => {
            warn!(pid, timeout_secs = startup_timeout.as_secs(), "Worker startup timed out");
            conn.request_shutdown();
            Err(WorkerError::StartupTimeout {
                secs: startup_timeout.as_secs(),
            })
        }
    }
}

async fn write_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>, pid: Option<u32>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(pid, "Failed to write to worker stdin: {}", e);
            break;
        }
        if let Err(e) = stdin.write_all(b"\n").await {
            error!(pid, "Failed to write newline: {}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(pid, "Failed to flush worker stdin: {}", e);
            break;
        }
    }
    debug!(pid, "stdin writer finished");
}

async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(pid, "worker stderr: {}", line);
    }
    debug!(pid, "stderr reader finished");
}

/// Read stdout in raw chunks, handshake first, then route response frames.
async fn read_stdout(
    mut stdout: ChildStdout,
    sentinel: String,
    ready_tx: oneshot::Sender<Result<(), String>>,
    done_tx: oneshot::Sender<()>,
    conn: Arc<Connection>,
    shared: Arc<Mutex<ChannelState>>,
) {
    let mut buffer = LineBuffer::new();
    let mut ready_tx = Some(ready_tx);
    let mut startup_noise: VecDeque<String> = VecDeque::with_capacity(STARTUP_NOISE_TAIL);
    let mut chunk = vec![0u8; 8192];

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(pid = ?conn.pid, error = %e, "Failed to read worker stdout");
                break;
            }
        };

        for line in buffer.push(&chunk[..n]) {
            if ready_tx.is_none() {
                conn.dispatch_line(&line).await;
            } else if is_ready_line(&line, &sentinel) {
                debug!(pid = ?conn.pid, "Worker handshake complete");
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            } else {
                debug!(pid = ?conn.pid, "worker startup: {}", line);
                if startup_noise.len() == STARTUP_NOISE_TAIL {
                    startup_noise.pop_front();
                }
                startup_noise.push_back(line);
            }
        }
    }

    if let Some(rest) = buffer.take_remainder()
        && ready_tx.is_none()
    {
        conn.dispatch_line(&rest).await;
    }

    if let Some(tx) = ready_tx.take() {
        let reason = if startup_noise.is_empty() {
            "worker closed stdout before printing its ready line".to_string()
        } else {
            Vec::from(startup_noise).join(" | ")
        };
        let _ = tx.send(Err(reason));
    }

    debug!(pid = ?conn.pid, "stdout reader finished");
    close_connection(&conn, &shared, "stdout closed").await;
    let _ = done_tx.send(());
}

async fn monitor_exit(
    mut child: Child,
    shutdown_rx: oneshot::Receiver<()>,
    stdout_done_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    grace: Duration,
    conn: Arc<Connection>,
    shared: Arc<Mutex<ChannelState>>,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => info!(pid = ?conn.pid, code = ?status.code(), "Worker process exited"),
                Err(e) => warn!(pid = ?conn.pid, error = %e, "Error waiting for worker process"),
            }
            // Answers written just before exit are still in the pipe.
            let _ = tokio::time::timeout(STDOUT_DRAIN_GRACE, stdout_done_rx).await;
        },
        _ = shutdown_rx => {
            debug!(pid = ?conn.pid, "Stopping worker process");
            terminate_process(&mut child, grace).await;
        }
    }

    close_connection(&conn, &shared, "process exited").await;
    exited_tx.send_replace(true);
}

/// Fail every pending request and mark the channel closed. Runs once per
/// connection no matter how many paths notice the exit.
async fn close_connection(conn: &Connection, shared: &Mutex<ChannelState>, reason: &str) {
    if conn.closed.swap(true, Ordering::SeqCst) {
        return;
    }

    // Closed before draining, so a caller that sees `ProcessClosed` and
    // retries gets a fresh process.
    {
        let mut state = shared.lock().await;
        if let Phase::Ready(current) = &state.phase
            && current.generation == conn.generation
        {
            state.phase = Phase::Closed;
        }
    }

    let drained: Vec<(u64, ResponseSink)> = conn.pending.lock().await.drain().collect();
    if !drained.is_empty() {
        warn!(
            pid = ?conn.pid,
            count = drained.len(),
            reason,
            "Worker closed with requests in flight"
        );
    }
    for (_, sink) in drained {
        let _ = sink.send(Err(WorkerError::ProcessClosed));
    }

    // stdout can close while the process lingers; make sure it goes away.
    conn.request_shutdown();
}
