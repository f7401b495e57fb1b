//! Signal shipper
//!
//! Drains the durable signal queue in batches, POSTs them to the backend,
//! and deletes only what the server acknowledged. Retryable failures back
//! off and eventually trip a circuit breaker whose cool-down grows with
//! consecutive open cycles. Poison payloads (non-auth 4xx) are dropped so
//! one bad signal cannot wedge the queue. Heartbeats run independently.

use crate::config::ShipperConfig;
use crate::signal::Signal;
use crate::state::{StateStore, StorageError};
use reqwest::StatusCode;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive failed flush cycles before the breaker opens.
const BREAKER_FAILURE_THRESHOLD: u32 = 3;
/// Base cool-down; multiplied by consecutive open cycles, capped at 10x.
const BREAKER_BASE_COOLDOWN: Duration = Duration::from_secs(30);
const BREAKER_MAX_COOLDOWN_FACTOR: u32 = 10;
/// Grace period for the final drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ShipperError {
    #[error("invalid shipper endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    open_cycles: u32,
    opened_at: Option<Instant>,
}

/// Three-state breaker over flush cycles. The cool-down scales with how
/// many times the breaker has re-opened without an intervening success.
pub struct CircuitBreaker {
    failure_threshold: u32,
    base_cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, base_cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            base_cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                open_cycles: 0,
                opened_at: None,
            }),
        }
    }

    fn cooldown(&self, open_cycles: u32) -> Duration {
        self.base_cooldown * open_cycles.clamp(1, BREAKER_MAX_COOLDOWN_FACTOR)
    }

    /// Whether a flush may proceed. An open breaker allows a single probe
    /// once its cool-down has elapsed.
    pub fn allow_flush(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooldown = self.cooldown(inner.open_cycles);
                match inner.opened_at {
                    Some(at) if at.elapsed() >= cooldown => {
                        inner.state = BreakerState::HalfOpen;
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = 0;
        inner.open_cycles = 0;
        inner.state = BreakerState::Closed;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.open_cycles += 1;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.open_cycles += 1;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }
}

// =============================================================================
// Shipper
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
enum FlushOutcome {
    /// Nothing queued.
    Empty,
    /// Batch acknowledged and deleted.
    Delivered(usize),
    /// Batch rejected as malformed and dropped.
    Poisoned,
    /// Retries exhausted; batch stays queued.
    Failed,
}

enum PostOutcome {
    Ack,
    Poison(StatusCode),
    Retry(String),
}

pub struct Shipper {
    store: Arc<StateStore>,
    client: reqwest::Client,
    endpoint: String,
    heartbeat_url: String,
    cfg: ShipperConfig,
    agent_id: String,
    breaker: CircuitBreaker,
    flush_notify: Notify,
    started: Instant,
}

impl Shipper {
    pub fn new(
        cfg: ShipperConfig,
        agent_id: impl Into<String>,
        store: Arc<StateStore>,
    ) -> Result<Self, ShipperError> {
        let url = reqwest::Url::parse(&cfg.endpoint)
            .map_err(|e| ShipperError::InvalidEndpoint(e.to_string()))?;
        let heartbeat_url = url
            .join("/agents/heartbeat")
            .map_err(|e| ShipperError::InvalidEndpoint(e.to_string()))?
            .to_string();

        if cfg.tls_skip_verify {
            warn!("TLS certificate verification is DISABLED for the shipper endpoint");
        }

        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .danger_accept_invalid_certs(cfg.tls_skip_verify)
            .build()
            .map_err(|e| ShipperError::Client(e.to_string()))?;

        Ok(Self {
            store,
            client,
            endpoint: cfg.endpoint.clone(),
            heartbeat_url,
            cfg,
            agent_id: agent_id.into(),
            breaker: CircuitBreaker::new(BREAKER_FAILURE_THRESHOLD, BREAKER_BASE_COOLDOWN),
            flush_notify: Notify::new(),
            started: Instant::now(),
        })
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Persist a signal to the durable queue and optionally nudge the flush
    /// loop. The queue insert is idempotent on signal id.
    pub fn enqueue(&self, signal: &Signal) -> Result<(), StorageError> {
        let json = serde_json::to_string(signal)?;
        self.store.enqueue_signal(&signal.id, &json)?;
        debug!(signal_id = %signal.id, rule_id = %signal.rule_id, "signal enqueued");
        if self.cfg.flush_on_enqueue() {
            self.flush_notify.notify_one();
        }
        Ok(())
    }

    /// Flush loop: periodic ticks, enqueue nudges, shutdown drain.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.cfg.flush_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.flush_notify.notified() => {}
            }
            self.flush_cycle(&cancel).await;
        }

        // Shutdown: one bounded best-effort drain of the current batch.
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.flush_once()).await;
        debug!("shipper stopped");
    }

    /// One full flush cycle (breaker check, batch send with retries).
    /// The run loop calls this; it is public for operational tooling.
    pub async fn flush_now(&self, cancel: &CancellationToken) {
        self.flush_cycle(cancel).await;
    }

    async fn flush_cycle(&self, cancel: &CancellationToken) {
        if !self.breaker.allow_flush() {
            debug!("circuit breaker open, skipping flush");
            return;
        }

        match self.flush_with_retries(cancel).await {
            Ok(FlushOutcome::Empty) => {}
            Ok(FlushOutcome::Delivered(n)) => {
                debug!(count = n, "batch delivered");
                self.breaker.record_success();
            }
            Ok(FlushOutcome::Poisoned) => {
                // The backend answered; the channel itself is healthy.
                self.breaker.record_success();
            }
            Ok(FlushOutcome::Failed) => {
                self.breaker.record_failure();
                if self.breaker.state() == BreakerState::Open {
                    warn!("circuit breaker opened after repeated flush failures");
                }
            }
            Err(e) => {
                warn!(error = %e, "flush aborted on storage error");
            }
        }
    }

    async fn flush_with_retries(
        &self,
        cancel: &CancellationToken,
    ) -> Result<FlushOutcome, StorageError> {
        let max_attempts = self.cfg.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.flush_once().await? {
                FlushOutcome::Failed if attempt < max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying flush");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(FlushOutcome::Failed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                outcome => return Ok(outcome),
            }
        }
        Ok(FlushOutcome::Failed)
    }

    /// Single send attempt for the oldest queued batch.
    async fn flush_once(&self) -> Result<FlushOutcome, StorageError> {
        let batch = self.store.list_queued_signals(self.cfg.batch_size)?;
        if batch.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let mut ids = Vec::with_capacity(batch.len());
        let mut signals = Vec::with_capacity(batch.len());
        for (id, raw) in batch {
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(json) => {
                    ids.push(id);
                    signals.push(json);
                }
                Err(e) => {
                    warn!(signal_id = %id, error = %e, "dropping unreadable queued signal");
                    self.store.delete_signal(&id)?;
                }
            }
        }
        if signals.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        match self.post_signals(&signals).await {
            PostOutcome::Ack => {
                for id in &ids {
                    self.store.delete_signal(id)?;
                }
                Ok(FlushOutcome::Delivered(ids.len()))
            }
            PostOutcome::Poison(status) => {
                warn!(%status, count = ids.len(), "backend rejected batch, dropping");
                for id in &ids {
                    self.store.delete_signal(id)?;
                }
                Ok(FlushOutcome::Poisoned)
            }
            PostOutcome::Retry(reason) => {
                debug!(reason = %reason, "flush attempt failed");
                Ok(FlushOutcome::Failed)
            }
        }
    }

    async fn post_signals(&self, signals: &[serde_json::Value]) -> PostOutcome {
        let body = serde_json::json!({ "signals": signals });
        let result = self
            .client
            .post(&self.endpoint)
            .header("X-API-Key", &self.cfg.api_key)
            .json(&body)
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => return PostOutcome::Retry(e.to_string()),
        };

        let status = resp.status();
        if status.is_success() {
            return PostOutcome::Ack;
        }
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                PostOutcome::Retry(format!("status {}", status))
            }
            s if s.is_server_error() => PostOutcome::Retry(format!("status {}", s)),
            s if s.is_client_error() => PostOutcome::Poison(s),
            s => PostOutcome::Retry(format!("status {}", s)),
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let retry = &self.cfg.retry;
        let delay = match retry.backoff.as_str() {
            "linear" => retry.initial.saturating_mul(attempt),
            _ => retry
                .initial
                .saturating_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX)),
        };
        delay.min(retry.max)
    }

    /// Heartbeat loop; failures are logged, never retried.
    pub async fn run_heartbeat(&self, cancel: CancellationToken) {
        if !self.cfg.heartbeat.enabled {
            return;
        }
        let mut tick = tokio::time::interval(self.cfg.heartbeat.interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(url = %self.heartbeat_url, "heartbeat enabled");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let body = serde_json::json!({
                "agent_id": self.agent_id,
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "version": env!("CARGO_PKG_VERSION"),
                "os_version": format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
                "uptime_seconds": self.started.elapsed().as_secs_f64(),
            });

            let result = self
                .client
                .post(&self.heartbeat_url)
                .header("X-API-Key", &self.cfg.api_key)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!("heartbeat delivered");
                }
                Ok(resp) => warn!(status = %resp.status(), "heartbeat rejected"),
                Err(e) => warn!(error = %e, "heartbeat failed"),
            }
        }
    }
}
