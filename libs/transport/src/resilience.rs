//! Retry and circuit-breaker wrapping for send/publish transports.
//!
//! Wrapping is transparent: [`ResilientSend`] and [`ResilientPublish`]
//! implement the same transport traits as the transport they wrap, so
//! callers never know whether they hold the raw transport or the pipeline.
//!
//! The breaker is failure-ratio driven over a sliding sampling window:
//!
//! ```text
//! CLOSED ──ratio ≥ threshold──> OPEN ──break elapsed──> HALF_OPEN
//!   │                            │                        │
//!   └─────────────── success ────┴──────── failure ───────┘
//! ```

use crate::{Envelope, PublishTransport, SendTransport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bounded-attempt retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. 1 means no retry.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay to 50–100% of the computed value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retry: a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before the given retry (attempt is 1-based, counting failures).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(2u32.saturating_pow(exponent));
        let capped = raw.min(self.max_delay);
        if self.jitter && !capped.is_zero() {
            let factor = 0.5 + rand::random::<f64>() * 0.5;
            capped.mul_f64(factor)
        } else {
            capped
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing, calls rejected immediately.
    Open,
    /// Probing recovery with a single call.
    HalfOpen,
}

/// Settings for the failure-ratio circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Fraction of failed calls within the window that trips the breaker.
    pub failure_ratio: f64,
    /// Minimum calls in the window before the ratio is considered.
    pub minimum_throughput: usize,
    /// Sliding window over which calls are sampled.
    pub sampling_window: Duration,
    /// How long the circuit stays open before probing.
    pub break_duration: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            minimum_throughput: 10,
            sampling_window: Duration::from_secs(30),
            break_duration: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    opened_at: Option<Instant>,
    samples: VecDeque<(Instant, bool)>,
    /// A half-open probe call is in flight; others are rejected until it
    /// records an outcome.
    probing: bool,
}

/// Failure-ratio circuit breaker shared by the wrappers below.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                opened_at: None,
                samples: VecDeque::new(),
                probing: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Gate a call. Returns an error while the circuit is open; transitions
    /// to half-open once the break duration has elapsed. In half-open exactly
    /// one call probes at a time; concurrent callers are rejected until the
    /// probe records its outcome.
    pub fn check(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if inner.probing {
                    Err(TransportError::CircuitOpen {
                        remaining: Duration::ZERO,
                    })
                } else {
                    inner.probing = true;
                    Ok(())
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.settings.break_duration {
                    info!("circuit breaker half-open, probing");
                    inner.state = CircuitState::HalfOpen;
                    inner.probing = true;
                    Ok(())
                } else {
                    Err(TransportError::CircuitOpen {
                        remaining: self.settings.break_duration - elapsed,
                    })
                }
            }
        }
    }

    /// Record the outcome of a gated call.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probing = false;
                if success {
                    info!("circuit breaker closed after successful probe");
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.samples.clear();
                } else {
                    warn!("circuit breaker probe failed, reopening");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
                return;
            }
            CircuitState::Open => return,
            CircuitState::Closed => {}
        }

        inner.samples.push_back((now, success));
        let window = self.settings.sampling_window;
        while let Some((at, _)) = inner.samples.front() {
            if now.duration_since(*at) > window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }

        let total = inner.samples.len();
        if total < self.settings.minimum_throughput {
            return;
        }
        let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
        let ratio = failures as f64 / total as f64;
        if ratio >= self.settings.failure_ratio {
            warn!(
                failures,
                total,
                ratio = format!("{ratio:.2}"),
                "circuit breaker opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.samples.clear();
        }
    }
}

/// Run an operation under a retry policy and circuit breaker.
async fn run_resilient<F, Fut>(
    retry: &RetryPolicy,
    breaker: &CircuitBreaker,
    mut op: F,
) -> Result<(), TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), TransportError>>,
{
    let mut last_err = None;
    for attempt in 1..=retry.max_attempts {
        breaker.check()?;
        match op().await {
            Ok(()) => {
                breaker.record(true);
                return Ok(());
            }
            Err(err) => {
                breaker.record(false);
                if !err.is_recoverable() {
                    return Err(err);
                }
                debug!(attempt, error = %err, "transport attempt failed");
                last_err = Some(err);
                if attempt < retry.max_attempts {
                    tokio::time::sleep(retry.delay_for(attempt)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| TransportError::send_failed("no attempts made")))
}

/// Retry + circuit-breaker wrapper around a send transport.
pub struct ResilientSend {
    inner: Arc<dyn SendTransport>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientSend {
    pub fn new(inner: Arc<dyn SendTransport>, retry: RetryPolicy, settings: BreakerSettings) -> Self {
        Self {
            inner,
            retry,
            breaker: Arc::new(CircuitBreaker::new(settings)),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl SendTransport for ResilientSend {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        run_resilient(&self.retry, &self.breaker, || {
            self.inner.send(envelope.clone())
        })
        .await
    }
}

/// Retry + circuit-breaker wrapper around a publish transport.
pub struct ResilientPublish {
    inner: Arc<dyn PublishTransport>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientPublish {
    pub fn new(
        inner: Arc<dyn PublishTransport>,
        retry: RetryPolicy,
        settings: BreakerSettings,
    ) -> Self {
        Self {
            inner,
            retry,
            breaker: Arc::new(CircuitBreaker::new(settings)),
        }
    }
}

#[async_trait]
impl PublishTransport for ResilientPublish {
    async fn publish(&self, envelope: Envelope) -> Result<(), TransportError> {
        run_resilient(&self.retry, &self.breaker, || {
            self.inner.publish(envelope.clone())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySend {
        failures_before_success: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl SendTransport for FlakySend {
        async fn send(&self, _envelope: Envelope) -> Result<(), TransportError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(TransportError::send_failed("transient"))
            } else {
                Ok(())
            }
        }
    }

    fn envelope() -> Envelope {
        Envelope::builder("test.message").build()
    }

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let inner = Arc::new(FlakySend {
            failures_before_success: 2,
            attempts: AtomicU32::new(0),
        });
        let wrapped = ResilientSend::new(inner.clone(), no_jitter(3), BreakerSettings::default());

        wrapped.send(envelope()).await.unwrap();
        assert_eq!(inner.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let inner = Arc::new(FlakySend {
            failures_before_success: u32::MAX,
            attempts: AtomicU32::new(0),
        });
        let wrapped = ResilientSend::new(inner.clone(), no_jitter(3), BreakerSettings::default());

        let err = wrapped.send(envelope()).await.unwrap_err();
        assert!(matches!(err, TransportError::SendFailed(_)));
        assert_eq!(inner.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_opens_on_failure_ratio() {
        let breaker = CircuitBreaker::new(BreakerSettings {
            failure_ratio: 0.5,
            minimum_throughput: 4,
            sampling_window: Duration::from_secs(60),
            break_duration: Duration::from_secs(60),
        });

        for _ in 0..2 {
            breaker.check().unwrap();
            breaker.record(true);
        }
        for _ in 0..2 {
            breaker.check().unwrap();
            breaker.record(false);
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        let err = breaker.check().unwrap_err();
        assert!(matches!(err, TransportError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_breaker_below_minimum_throughput_stays_closed() {
        let breaker = CircuitBreaker::new(BreakerSettings {
            failure_ratio: 0.1,
            minimum_throughput: 10,
            sampling_window: Duration::from_secs(60),
            break_duration: Duration::from_secs(60),
        });

        for _ in 0..5 {
            breaker.record(false);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(BreakerSettings {
            failure_ratio: 0.5,
            minimum_throughput: 1,
            sampling_window: Duration::from_secs(60),
            break_duration: Duration::from_millis(10),
        });

        breaker.record(false);
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.check().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_half_open_admits_one_probe_at_a_time() {
        let breaker = CircuitBreaker::new(BreakerSettings {
            failure_ratio: 0.5,
            minimum_throughput: 1,
            sampling_window: Duration::from_secs(60),
            break_duration: Duration::from_millis(10),
        });

        breaker.record(false);
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // First caller becomes the probe; concurrent callers are rejected
        // until it reports back.
        breaker.check().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(
            breaker.check(),
            Err(TransportError::CircuitOpen { .. })
        ));

        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.check().unwrap();
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: false,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(8), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };

        for _ in 0..50 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(100));
        }
    }
}
