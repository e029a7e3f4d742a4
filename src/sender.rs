//! Delivery of encoded payloads with retry and backoff.
//!
//! Each payload moves through an explicit state machine:
//!
//! ```text
//!   Pending ──> Sending ──> Delivered                       (2xx)
//!                  │ ──────> Failed                          (4xx other than 429)
//!                  │ ──────> RetryWait ──> Sending ...       (5xx, 429, network)
//!                  └──────> Exhausted                        (retry budget spent)
//! ```
//!
//! Backoff is exponential with jitter, starting at `initial_backoff` and
//! doubling up to `max_backoff`. A `Retry-After` hint on a 429 raises the wait
//! to at least the server's suggestion. Retrying stops after `max_retries`
//! retries or once the next attempt would start later than
//! `max_retry_duration` after the first one, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::encoder::PendingPayload;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default ceiling for a single backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default total time budget for retrying one payload.
pub const DEFAULT_MAX_RETRY_DURATION: Duration = Duration::from_secs(300);

/// Default bound on a single network attempt.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Server response to one push attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResponse {
    pub status: StatusCode,

    /// Parsed `Retry-After` header, if the server sent one
    pub retry_after: Option<Duration>,

    /// Response body, kept for error reporting
    pub body: String,
}

impl PushResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            retry_after: None,
            body: String::new(),
        }
    }
}

/// Failures below the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("network error: {0}")]
    Network(String),

    /// The request could not be built; retrying cannot help
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Invalid(_))
    }
}

/// Performs a single push attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn push(&self, payload: &PendingPayload) -> Result<PushResponse, TransportError>;
}

/// Classification of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered,

    RetryableFailure {
        reason: String,
        retry_after: Option<Duration>,
    },

    FatalFailure { reason: String },
}

/// Classify the result of one push attempt.
pub fn classify(result: Result<PushResponse, TransportError>) -> Outcome {
    match result {
        Ok(response) if response.status.is_success() => Outcome::Delivered,
        Ok(response) => {
            let reason = describe_status(&response);
            if response.status == StatusCode::TOO_MANY_REQUESTS {
                Outcome::RetryableFailure {
                    reason,
                    retry_after: response.retry_after,
                }
            } else if response.status.is_server_error() {
                Outcome::RetryableFailure {
                    reason,
                    retry_after: None,
                }
            } else {
                Outcome::FatalFailure { reason }
            }
        }
        Err(e) if e.is_retryable() => Outcome::RetryableFailure {
            reason: e.to_string(),
            retry_after: None,
        },
        Err(e) => Outcome::FatalFailure {
            reason: e.to_string(),
        },
    }
}

fn describe_status(response: &PushResponse) -> String {
    let body = response.body.trim();
    if body.is_empty() {
        format!("server responded {}", response.status)
    } else {
        format!("server responded {}: {}", response.status, body)
    }
}

/// Retry limits and backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
    pub max_retry_duration: Duration,
    pub send_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_retries: DEFAULT_MAX_RETRIES,
            max_retry_duration: DEFAULT_MAX_RETRY_DURATION,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `retry` (1-based).
    ///
    /// `initial_backoff * 2^(retry - 1)` plus up to 25% jitter, capped at
    /// `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << retry.saturating_sub(1).min(20));
        let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
        let jitter = rand::random::<u64>() % (base_ms / 4 + 1);
        base.saturating_add(Duration::from_millis(jitter))
            .min(self.max_backoff)
    }

    /// Delay before retry number `retry`, or `None` when the budget is spent.
    ///
    /// `elapsed` is the time since the first attempt started.
    pub fn next_delay(
        &self,
        retry: u32,
        elapsed: Duration,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        if retry > self.max_retries {
            return None;
        }
        let mut delay = self.backoff(retry);
        if let Some(hint) = retry_after {
            delay = delay.max(hint);
        }
        if elapsed.saturating_add(delay) > self.max_retry_duration {
            return None;
        }
        Some(delay)
    }
}

/// Position of a payload in the delivery state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sending,
    RetryWait(Duration),
    Delivered,
    Failed { reason: String },
    Exhausted { reason: String },
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered | DeliveryState::Failed { .. } | DeliveryState::Exhausted { .. }
        )
    }
}

/// Final result of delivering one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub payload_id: uuid::Uuid,

    /// Terminal state
    pub state: DeliveryState,

    /// Attempts made, including the first
    pub attempts: u32,

    pub encoded_bytes: usize,
    pub entries: usize,
}

impl DeliveryReport {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn is_delivered(&self) -> bool {
        self.state == DeliveryState::Delivered
    }
}

/// Delivers payloads through a [`Transport`], retrying per [`RetryConfig`].
#[derive(Clone)]
pub struct Sender {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: RetryConfig,
}

impl Sender {
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, config: RetryConfig) -> Self {
        Self {
            transport,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Make a single attempt, bounded by `send_timeout`.
    pub async fn send(&self, payload: &mut PendingPayload) -> Outcome {
        payload.record_attempt(self.clock.now());
        let result = match tokio::time::timeout(
            self.config.send_timeout,
            self.transport.push(payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        classify(result)
    }

    /// Drive a payload to a terminal state.
    pub async fn deliver(&self, mut payload: PendingPayload) -> DeliveryReport {
        let mut state = DeliveryState::Pending;

        while !state.is_terminal() {
            state = match state {
                DeliveryState::Pending => DeliveryState::Sending,
                DeliveryState::RetryWait(delay) => {
                    self.clock.sleep(delay).await;
                    DeliveryState::Sending
                }
                DeliveryState::Sending => self.transition(&mut payload).await,
                terminal => terminal,
            };
        }

        DeliveryReport {
            payload_id: payload.id(),
            state,
            attempts: payload.attempt_count(),
            encoded_bytes: payload.encoded_len(),
            entries: payload.entry_count(),
        }
    }

    async fn transition(&self, payload: &mut PendingPayload) -> DeliveryState {
        match self.send(payload).await {
            Outcome::Delivered => {
                debug!(
                    payload_id = %payload.id(),
                    attempts = payload.attempt_count(),
                    entries = payload.entry_count(),
                    bytes = payload.encoded_len(),
                    "Delivered payload"
                );
                DeliveryState::Delivered
            }
            Outcome::FatalFailure { reason } => {
                error!(
                    payload_id = %payload.id(),
                    attempts = payload.attempt_count(),
                    error = %reason,
                    "Payload rejected permanently"
                );
                DeliveryState::Failed { reason }
            }
            Outcome::RetryableFailure {
                reason,
                retry_after,
            } => {
                let elapsed = payload
                    .first_attempt_at()
                    .map(|first| self.clock.now().saturating_duration_since(first))
                    .unwrap_or_default();
                match self
                    .config
                    .next_delay(payload.attempt_count(), elapsed, retry_after)
                {
                    Some(delay) => {
                        warn!(
                            payload_id = %payload.id(),
                            attempt = payload.attempt_count(),
                            max_retries = self.config.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %reason,
                            "Push failed, will retry"
                        );
                        DeliveryState::RetryWait(delay)
                    }
                    None => {
                        error!(
                            payload_id = %payload.id(),
                            attempts = payload.attempt_count(),
                            error = %reason,
                            "Retry budget exhausted, dropping payload"
                        );
                        DeliveryState::Exhausted { reason }
                    }
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;
    use crate::batcher::{BatchConfig, Batcher};
    use crate::clock::ManualClock;
    use crate::encoder::Encoder;
    use crate::entry::Entry;
    use tokio::time::Instant;

    fn payload() -> PendingPayload {
        let now = Instant::now();
        let mut batcher = Batcher::new(BatchConfig::default(), now);
        batcher
            .submit(Entry::new("hello", [("app", "foo")]), now)
            .unwrap();
        Encoder::new(false).encode(batcher.drain(now)).unwrap()
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            max_retries: 5,
            max_retry_duration: Duration::from_secs(60),
            send_timeout: Duration::from_secs(5),
        }
    }

    fn sender(transport: Arc<ScriptedTransport>, clock: ManualClock) -> Sender {
        Sender::new(transport, Arc::new(clock), retry_config())
    }

    fn response(code: u16) -> PushResponse {
        PushResponse::new(StatusCode::from_u16(code).unwrap())
    }

    #[test]
    fn test_classify_statuses() {
        assert_eq!(classify(Ok(response(204))), Outcome::Delivered);
        assert!(matches!(
            classify(Ok(response(503))),
            Outcome::RetryableFailure { .. }
        ));
        assert!(matches!(
            classify(Ok(response(500))),
            Outcome::RetryableFailure { .. }
        ));
        assert!(matches!(
            classify(Ok(response(400))),
            Outcome::FatalFailure { .. }
        ));
        assert!(matches!(
            classify(Ok(response(401))),
            Outcome::FatalFailure { .. }
        ));
    }

    #[test]
    fn test_classify_rate_limit_keeps_hint() {
        let mut limited = response(429);
        limited.retry_after = Some(Duration::from_secs(7));
        assert_eq!(
            classify(Ok(limited)),
            Outcome::RetryableFailure {
                reason: "server responded 429 Too Many Requests".to_string(),
                retry_after: Some(Duration::from_secs(7)),
            }
        );
    }

    #[test]
    fn test_classify_transport_errors() {
        assert!(matches!(
            classify(Err(TransportError::Timeout)),
            Outcome::RetryableFailure { .. }
        ));
        assert!(matches!(
            classify(Err(TransportError::Connect("refused".into()))),
            Outcome::RetryableFailure { .. }
        ));
        assert!(matches!(
            classify(Err(TransportError::Invalid("bad url".into()))),
            Outcome::FatalFailure { .. }
        ));
    }

    #[test]
    fn test_fatal_reason_includes_body() {
        let mut rejected = response(400);
        rejected.body = "entry out of order\n".to_string();
        assert_eq!(
            classify(Ok(rejected)),
            Outcome::FatalFailure {
                reason: "server responded 400 Bad Request: entry out of order".to_string()
            }
        );
    }

    #[test]
    fn test_backoff_doubles_with_bounded_jitter() {
        let config = retry_config();
        for (retry, base_ms) in [(1, 100u128), (2, 200), (3, 400), (4, 800)] {
            let delay = config.backoff(retry).as_millis();
            assert!(delay >= base_ms, "retry {} delay {}", retry, delay);
            assert!(delay <= base_ms + base_ms / 4, "retry {} delay {}", retry, delay);
        }
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let config = retry_config();
        assert_eq!(config.backoff(10), Duration::from_secs(2));
        assert_eq!(config.backoff(40), Duration::from_secs(2));
    }

    #[test]
    fn test_next_delay_respects_limits() {
        let config = retry_config();
        assert!(config.next_delay(5, Duration::ZERO, None).is_some());
        assert!(config.next_delay(6, Duration::ZERO, None).is_none());
        assert!(config
            .next_delay(1, Duration::from_secs(60), None)
            .is_none());
        assert_eq!(
            config.next_delay(1, Duration::ZERO, Some(Duration::from_secs(30))),
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn test_delivers_after_two_unavailable_responses() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedTransport::status(503),
            ScriptedTransport::status(503),
            ScriptedTransport::status(200),
        ]));
        let clock = ManualClock::new();
        let sender = sender(transport.clone(), clock.clone());

        let report = sender.deliver(payload()).await;

        assert_eq!(report.state, DeliveryState::Delivered);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.retries(), 2);
        assert_eq!(transport.attempts(), 3);
        // Every attempt carried the same body.
        let bodies = transport.bodies();
        assert!(bodies.iter().all(|body| body == &bodies[0]));
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_request_fails_without_retry() {
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedTransport::status(400)]));
        let clock = ManualClock::new();
        let sender = sender(transport.clone(), clock.clone());

        let payload = payload();
        let size = payload.encoded_len();
        let report = sender.deliver(payload).await;

        assert!(matches!(report.state, DeliveryState::Failed { .. }));
        assert_eq!(report.attempts, 1);
        assert_eq!(report.retries(), 0);
        assert_eq!(report.encoded_bytes, size);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_exhausts_after_max_retries() {
        let transport = Arc::new(ScriptedTransport::new(
            (0..10).map(|_| ScriptedTransport::status(500)).collect(),
        ));
        let clock = ManualClock::new();
        let sender = sender(transport.clone(), clock.clone());

        let report = sender.deliver(payload()).await;

        assert!(matches!(report.state, DeliveryState::Exhausted { .. }));
        assert_eq!(report.attempts, 6);
        assert_eq!(clock.sleeps().len(), 5);
    }

    #[tokio::test]
    async fn test_exhausts_when_retry_duration_spent() {
        let transport = Arc::new(ScriptedTransport::new(
            (0..10).map(|_| ScriptedTransport::status(503)).collect(),
        ));
        let clock = ManualClock::new();
        let config = RetryConfig {
            max_retries: 100,
            max_retry_duration: Duration::from_millis(500),
            ..retry_config()
        };
        let sender = Sender::new(transport.clone(), Arc::new(clock.clone()), config);

        let report = sender.deliver(payload()).await;

        assert!(matches!(report.state, DeliveryState::Exhausted { .. }));
        let waited: Duration = clock.sleeps().iter().sum();
        assert!(waited <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_rate_limit_honors_retry_after() {
        let mut limited = response(429);
        limited.retry_after = Some(Duration::from_secs(15));
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(limited)]));
        let clock = ManualClock::new();
        let sender = sender(transport.clone(), clock.clone());

        let report = sender.deliver(payload()).await;

        assert!(report.is_delivered());
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(15)]);
    }

    #[tokio::test]
    async fn test_connection_errors_are_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Connect("connection refused".into())),
            Err(TransportError::Timeout),
        ]));
        let clock = ManualClock::new();
        let sender = sender(transport.clone(), clock);

        let report = sender.deliver(payload()).await;
        assert!(report.is_delivered());
        assert_eq!(report.attempts, 3);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!DeliveryState::Pending.is_terminal());
        assert!(!DeliveryState::Sending.is_terminal());
        assert!(!DeliveryState::RetryWait(Duration::from_secs(1)).is_terminal());
        assert!(DeliveryState::Delivered.is_terminal());
        assert!(DeliveryState::Exhausted {
            reason: String::new()
        }
        .is_terminal());
    }
}
