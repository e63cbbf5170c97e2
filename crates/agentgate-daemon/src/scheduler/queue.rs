//! Admission queue in front of the agent worker.
//!
//! Callers [`Scheduler::submit`] a message and await the answer. A single
//! consumer task owns the cache and the rate-limit state and works through
//! entries in arrival order: cache hits resolve at once, misses wait out the
//! global and per-session intervals, then go to the primary invoker, falling
//! back to the secondary invoker once if that fails.
//!
//! Because only the consumer dispatches, at most one worker call is in flight
//! at any time. That serialization is what enforces the rate limits.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use agentgate_core::Config;
use agentgate_core::config::{CacheConfig, SchedulerConfig};
use agentgate_core::frame::{AgentRequest, AgentResponse, WorkerResponse};
use agentgate_core::sanitize_response;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::cache::{DEFAULT_SESSION, ResponseCache, cache_key, session_key};
use super::rate_limit::RateLimiter;
use crate::worker::{AgentInvoker, PersistentWorker, TransientInvoker, WorkerError};

type ResultSink = oneshot::Sender<Result<AgentResponse, SubmitError>>;

/// Errors returned to a submitter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The request never reached a worker.
    #[error("Admission failed: {0}")]
    Admission(String),

    /// Both the primary and the fallback invoker failed; carries the fallback's error.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Counters since the scheduler started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub cache_hits: u64,
    pub dispatched: u64,
    pub fallbacks: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    submitted: AtomicU64,
    cache_hits: AtomicU64,
    dispatched: AtomicU64,
    fallbacks: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct QueueEntry {
    request: AgentRequest,
    sink: ResultSink,
    enqueued_at: Instant,
}

/// Rate-limited, caching front door to the agent worker.
pub struct Scheduler<P = PersistentWorker> {
    intake: RwLock<Option<mpsc::UnboundedSender<QueueEntry>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    primary: Arc<P>,
    stats: Arc<StatsCounters>,
}

impl Scheduler {
    /// Build a scheduler backed by the persistent worker with the transient
    /// worker as fallback. Must be called inside a Tokio runtime.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.scheduler,
            &config.cache,
            PersistentWorker::new(config.worker.clone()),
            TransientInvoker::new(config.fallback.clone()),
        )
    }
}

impl<P: AgentInvoker> Scheduler<P> {
    /// Start the consumer task. Must be called inside a Tokio runtime.
    pub fn new<F: AgentInvoker>(
        scheduler: &SchedulerConfig,
        cache: &CacheConfig,
        primary: P,
        fallback: F,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let primary = Arc::new(primary);
        let stats = Arc::new(StatsCounters::default());

        let consumer = Consumer {
            intake: rx,
            intake_open: true,
            backlog: VecDeque::new(),
            cache: ResponseCache::new(cache.ttl(), cache.max_entries),
            limiter: RateLimiter::new(
                scheduler.global_min_interval(),
                scheduler.session_min_interval(),
            ),
            primary: Arc::clone(&primary),
            fallback: Arc::new(fallback),
            stats: Arc::clone(&stats),
        };

        info!(
            global_min_interval_ms = scheduler.global_min_interval_ms,
            session_min_interval_ms = scheduler.session_min_interval_ms,
            cache_ttl_secs = cache.ttl_secs,
            cache_max_entries = cache.max_entries,
            "Scheduler started"
        );

        Self {
            intake: RwLock::new(Some(tx)),
            consumer: Mutex::new(Some(tokio::spawn(consumer.run()))),
            primary,
            stats,
        }
    }

    /// Queue a message and wait for its answer.
    ///
    /// The message joins the queue when `submit` is called, before the
    /// returned future is first polled. Abandoning the future does not cancel
    /// the request; it still runs and its result is cached.
    pub fn submit(
        &self,
        message: impl Into<String>,
        session_id: Option<String>,
        enable_trace: bool,
    ) -> impl Future<Output = Result<AgentResponse, SubmitError>> + Send + 'static {
        let queued = self.enqueue(AgentRequest::new(message, session_id, enable_trace));
        async move {
            queued?
                .await
                .map_err(|_| SubmitError::Admission("request dropped before completion".into()))?
        }
    }

    fn enqueue(
        &self,
        request: AgentRequest,
    ) -> Result<oneshot::Receiver<Result<AgentResponse, SubmitError>>, SubmitError> {
        let (sink, rx) = oneshot::channel();
        let entry = QueueEntry {
            request,
            sink,
            enqueued_at: Instant::now(),
        };

        let intake = self.intake.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = intake.as_ref() else {
            return Err(SubmitError::Admission("scheduler is shut down".into()));
        };
        tx.send(entry)
            .map_err(|_| SubmitError::Admission("scheduler consumer stopped".into()))?;
        StatsCounters::bump(&self.stats.submitted);
        Ok(rx)
    }

    /// Counters since start.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.snapshot()
    }

    /// The primary invoker, e.g. to warm up the persistent worker.
    pub fn primary(&self) -> &P {
        &self.primary
    }

    /// Stop accepting work, finish everything already queued, then release
    /// the primary invoker's process.
    pub async fn shutdown(&self) {
        self.intake
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self.consumer.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "Scheduler consumer task failed");
        }
        self.primary.shutdown().await;
        info!("Scheduler stopped");
    }
}

/// State owned by the consumer task. Nothing else touches the cache or the
/// rate limiter, so neither needs a lock.
struct Consumer<P, F> {
    intake: mpsc::UnboundedReceiver<QueueEntry>,
    intake_open: bool,
    /// Misses that arrived while the consumer was busy, in arrival order.
    backlog: VecDeque<QueueEntry>,
    cache: ResponseCache,
    limiter: RateLimiter,
    primary: Arc<P>,
    fallback: Arc<F>,
    stats: Arc<StatsCounters>,
}

impl<P: AgentInvoker, F: AgentInvoker> Consumer<P, F> {
    async fn run(mut self) {
        loop {
            let entry = match self.backlog.pop_front() {
                Some(entry) => entry,
                None => match self.intake.recv().await {
                    Some(entry) => entry,
                    None => break,
                },
            };
            self.process(entry).await;
        }
        debug!("Scheduler consumer drained");
    }

    async fn process(&mut self, entry: QueueEntry) {
        let key = cache_key(&entry.request.message, entry.request.session_id.as_deref());
        if let Some(hit) = self.cache.get(&key, Instant::now()) {
            self.resolve_hit(entry, hit);
            return;
        }

        let session = session_key(entry.request.session_id.as_deref()).to_string();
        let wait = self.limiter.delay_for(&session, Instant::now());
        if !wait.is_zero() {
            debug!(
                session = %session,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "Rate limiting before dispatch"
            );
            self.drive(tokio::time::sleep(wait)).await;
        }

        // Recorded before the call so a slow call cannot open the gate early.
        self.limiter.record(&session, Instant::now());

        let call = dispatch(
            Arc::clone(&self.primary),
            Arc::clone(&self.fallback),
            entry.request.clone(),
            Arc::clone(&self.stats),
        );
        let result = self.drive(call).await;

        let outcome = match result {
            Ok(frame) => {
                let response = build_response(frame, &entry.request);
                self.cache.insert(key, response.clone(), Instant::now());
                StatsCounters::bump(&self.stats.succeeded);
                Ok(response)
            }
            Err(err) => {
                StatsCounters::bump(&self.stats.failed);
                error!(error = %err, session = %session, "Request failed");
                Err(SubmitError::Worker(err))
            }
        };

        debug!(
            session = %session,
            queued_ms = u64::try_from(entry.enqueued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            ok = outcome.is_ok(),
            "Request finished"
        );
        if entry.sink.send(outcome).is_err() {
            debug!("Submitter gone before the answer was ready");
        }
    }

    /// Run `fut` to completion while still taking in new entries: cache hits
    /// among them are answered immediately, the rest wait in the backlog.
    async fn drive<T>(&mut self, fut: impl Future<Output = T>) -> T {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                out = &mut fut => return out,
                next = self.intake.recv(), if self.intake_open => match next {
                    Some(entry) => self.admit(entry),
                    None => self.intake_open = false,
                },
            }
        }
    }

    fn admit(&mut self, entry: QueueEntry) {
        let key = cache_key(&entry.request.message, entry.request.session_id.as_deref());
        match self.cache.get(&key, Instant::now()) {
            Some(hit) => self.resolve_hit(entry, hit),
            None => self.backlog.push_back(entry),
        }
    }

    fn resolve_hit(&self, entry: QueueEntry, hit: AgentResponse) {
        StatsCounters::bump(&self.stats.cache_hits);
        debug!(session = ?entry.request.session_id, "Cache hit");
        let _ = entry.sink.send(Ok(hit));
    }
}

async fn dispatch<P: AgentInvoker, F: AgentInvoker>(
    primary: Arc<P>,
    fallback: Arc<F>,
    request: AgentRequest,
    stats: Arc<StatsCounters>,
) -> Result<WorkerResponse, WorkerError> {
    StatsCounters::bump(&stats.dispatched);
    match primary.invoke(&request).await {
        Ok(frame) => Ok(frame),
        Err(primary_err) => {
            warn!(error = %primary_err, "Primary worker failed, trying fallback worker");
            StatsCounters::bump(&stats.fallbacks);
            fallback.invoke(&request).await
        }
    }
}

fn build_response(frame: WorkerResponse, request: &AgentRequest) -> AgentResponse {
    let session_id = frame
        .session_id
        .filter(|s| !s.is_empty())
        .or_else(|| request.session_id.clone().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| DEFAULT_SESSION.to_string());

    AgentResponse {
        response: sanitize_response(frame.response.as_deref().unwrap_or_default()),
        session_id,
        timestamp: frame
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        trace_data: if request.enable_trace {
            frame.trace_data
        } else {
            None
        },
    }
}
