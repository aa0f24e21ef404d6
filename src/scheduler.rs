//! Rate-limited request scheduler
//!
//! All generation requests funnel through a single worker task that owns the
//! admission decision: daily cap, per-minute window, and minimum spacing
//! between requests. Exactly one request is in flight at a time and requests
//! complete strictly in submission order; rate waits are served while holding
//! the head of the queue, so later arrivals cannot overtake.

use crate::GenerateOptions;
use crate::clock::Clock;
use crate::errors::GenerationError;
use crate::events::{Event, EventBus};
use crate::retry::RetryController;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Flat wait applied when the per-minute window is full. Slightly longer
/// than the window itself so the re-check after the wait always passes.
const MINUTE_RETRY_WAIT: Duration = Duration::from_secs(65);
/// Length of the per-minute window.
const MINUTE_WINDOW: Duration = Duration::from_secs(60);
/// Daily limits below this are clamped up; a lower cap starves the queue.
const MIN_DAILY_LIMIT: u64 = 100;

/// Admission limits for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder)]
pub struct SchedulerConfig {
    /// Requests admitted per calendar day.
    #[serde(default = "default_daily_request_limit")]
    #[builder(default = default_daily_request_limit())]
    pub daily_request_limit: u64,
    /// Requests admitted per rolling minute window.
    #[serde(default = "default_minute_request_limit")]
    #[builder(default = default_minute_request_limit())]
    pub minute_request_limit: u32,
    /// Minimum spacing between consecutive request starts.
    #[serde(default = "default_min_request_interval_ms")]
    #[builder(default = default_min_request_interval_ms())]
    pub min_request_interval_ms: u64,
    /// Pause after each completed request before the next is considered.
    #[serde(default = "default_cooldown_ms")]
    #[builder(default = default_cooldown_ms())]
    pub cooldown_ms: u64,
}

fn default_daily_request_limit() -> u64 {
    300
}
fn default_minute_request_limit() -> u32 {
    2
}
fn default_min_request_interval_ms() -> u64 {
    30_000
}
fn default_cooldown_ms() -> u64 {
    1_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Point-in-time view of the queue and its counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Requests that have not started yet, including the head while it
    /// waits out a rate limit.
    pub queue_length: usize,
    pub request_count: u64,
    pub daily_limit: u64,
    pub minute_request_count: u32,
    pub minute_request_limit: u32,
    pub min_request_interval_ms: u64,
    /// Milliseconds since the last request started, if any ran today.
    pub time_since_last_request_ms: Option<u64>,
}

struct QueuedRequest {
    prompt: String,
    options: GenerateOptions,
    reply: oneshot::Sender<Result<String, GenerationError>>,
}

struct SchedulerState {
    daily_request_count: u64,
    daily_limit: u64,
    minute_request_count: u32,
    minute_window_start: Instant,
    last_request: Option<Instant>,
    last_daily_reset: NaiveDate,
}

/// FIFO scheduler in front of the retry controller.
pub struct Scheduler {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    state: Arc<Mutex<SchedulerState>>,
    queue_len: Arc<AtomicUsize>,
    config: SchedulerConfig,
    events: EventBus,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Spawn the worker task. It runs until the scheduler (and with it the
    /// submission side of the queue) is dropped.
    pub fn new(
        config: SchedulerConfig,
        controller: Arc<RetryController>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(SchedulerState {
            daily_request_count: 0,
            daily_limit: config.daily_request_limit,
            minute_request_count: 0,
            minute_window_start: Instant::now(),
            last_request: None,
            last_daily_reset: clock.today(),
        }));
        let queue_len = Arc::new(AtomicUsize::new(0));

        tokio::spawn(worker(
            rx,
            state.clone(),
            queue_len.clone(),
            config.clone(),
            controller,
            clock,
        ));

        Self {
            tx,
            state,
            queue_len,
            config,
            events,
        }
    }

    /// Enqueue a request and wait for its result. Resolution order across
    /// concurrent callers matches submission order.
    pub async fn submit(
        &self,
        prompt: String,
        options: GenerateOptions,
    ) -> Result<String, GenerationError> {
        let (reply, rx) = oneshot::channel();
        self.queue_len.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(QueuedRequest {
                prompt,
                options,
                reply,
            })
            .is_err()
        {
            self.queue_len.fetch_sub(1, Ordering::SeqCst);
            return Err(GenerationError::ServerError(
                "scheduler worker has stopped".to_string(),
            ));
        }
        rx.await.map_err(|_| {
            GenerationError::ServerError("scheduler dropped the request".to_string())
        })?
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        QueueStatus {
            queue_length: self.queue_len.load(Ordering::SeqCst),
            request_count: state.daily_request_count,
            daily_limit: state.daily_limit,
            minute_request_count: state.minute_request_count,
            minute_request_limit: self.config.minute_request_limit,
            min_request_interval_ms: self.config.min_request_interval_ms,
            time_since_last_request_ms: state
                .last_request
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Change the daily cap at runtime, clamped to [`MIN_DAILY_LIMIT`].
    pub async fn set_daily_limit(&self, limit: u64) {
        let limit = limit.max(MIN_DAILY_LIMIT);
        self.state.lock().await.daily_limit = limit;
        info!(limit, "daily request limit updated");
        self.events.publish(Event::RequestLimitUpdated { limit });
    }

    /// Zero today's admission counter, reopening the queue immediately.
    pub async fn reset_daily_count(&self) {
        self.state.lock().await.daily_request_count = 0;
        info!("daily request count reset");
        self.events.publish(Event::RequestCountReset);
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    state: Arc<Mutex<SchedulerState>>,
    queue_len: Arc<AtomicUsize>,
    config: SchedulerConfig,
    controller: Arc<RetryController>,
    clock: Arc<dyn Clock>,
) {
    while let Some(request) = rx.recv().await {
        // The head stays counted in queue_len while it waits out rate
        // limits; it has not started yet.
        let admitted = admit(&state, &config, clock.as_ref()).await;
        queue_len.fetch_sub(1, Ordering::SeqCst);

        if !admitted {
            let _ = request.reply.send(Err(GenerationError::exhausted(
                0,
                "daily request limit exceeded".to_string(),
            )));
            continue;
        }

        let result = controller.execute(&request.prompt, &request.options).await;

        {
            let mut state = state.lock().await;
            state.last_request = Some(Instant::now());
            state.minute_request_count += 1;
            state.daily_request_count += 1;
        }

        // Caller may have given up; losing the reply is fine.
        let _ = request.reply.send(result);

        if config.cooldown_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.cooldown_ms)).await;
        }
    }
    debug!("scheduler worker stopped");
}

/// Wait until the head request may start, or reject it when today's budget
/// is spent. Waits happen while holding the head, preserving FIFO order.
async fn admit(
    state: &Arc<Mutex<SchedulerState>>,
    config: &SchedulerConfig,
    clock: &dyn Clock,
) -> bool {
    loop {
        let wait = {
            let mut state = state.lock().await;

            let today = clock.today();
            if state.last_daily_reset != today {
                info!(
                    previous_count = state.daily_request_count,
                    "new calendar day; daily request count reset"
                );
                state.daily_request_count = 0;
                state.last_daily_reset = today;
            }

            if state.daily_request_count >= state.daily_limit {
                warn!(limit = state.daily_limit, "daily request limit exceeded");
                return false;
            }

            if state.minute_window_start.elapsed() > MINUTE_WINDOW {
                state.minute_window_start = Instant::now();
                state.minute_request_count = 0;
            }

            if state.minute_request_count >= config.minute_request_limit {
                debug!(
                    minute_request_count = state.minute_request_count,
                    "minute window full; waiting"
                );
                Some(MINUTE_RETRY_WAIT)
            } else {
                let spacing = Duration::from_millis(config.min_request_interval_ms);
                match state.last_request {
                    Some(last) if last.elapsed() < spacing => Some(spacing - last.elapsed()),
                    _ => None,
                }
            }
        };

        match wait {
            Some(delay) => tokio::time::sleep(delay).await,
            None => return true,
        }
    }
}
