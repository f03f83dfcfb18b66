use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use sy_common::{Exchange, ExchangeError, Result};
use tracing::{debug, info, warn};

use crate::processor::{invoke, Processor, ProcessorRef};
use crate::service::Service;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that open the circuit.
    pub threshold: usize,
    pub window: Duration,
    /// How long the circuit stays open before a trial exchange is let through.
    pub half_open_after: Duration,
    /// Error kinds counted as failures. Empty means every failure counts.
    pub exceptions: Vec<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 2,
            window: Duration::from_secs(60),
            half_open_after: Duration::from_secs(1),
            exceptions: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_half_open_after(mut self, delay: Duration) -> Self {
        self.half_open_after = delay;
        self
    }

    pub fn with_exceptions<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exceptions = kinds.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { since: Instant },
    /// One trial exchange is in flight.
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    phase: Phase,
    failures: VecDeque<Instant>,
}

/// Fails fast while the guarded processor keeps failing.
pub struct CircuitBreakerLoadBalancer {
    route_id: String,
    processor: ProcessorRef,
    config: CircuitBreakerConfig,
    breaker: Mutex<Breaker>,
}

impl CircuitBreakerLoadBalancer {
    pub fn new(route_id: impl Into<String>, processor: ProcessorRef, config: CircuitBreakerConfig) -> Self {
        Self {
            route_id: route_id.into(),
            processor,
            config,
            breaker: Mutex::new(Breaker {
                phase: Phase::Closed,
                failures: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.breaker.lock().phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen => CircuitState::HalfOpen,
        }
    }

    /// Whether an exchange may pass now. Moves an expired open circuit to half-open.
    fn admit(&self) -> bool {
        let mut guard = self.breaker.lock();
        let breaker = &mut *guard;
        match breaker.phase {
            Phase::Closed => true,
            Phase::Open { since } if since.elapsed() >= self.config.half_open_after => {
                info!(route_id = %self.route_id, "Circuit breaker half-open, letting a trial exchange through");
                breaker.phase = Phase::HalfOpen;
                true
            }
            Phase::Open { .. } | Phase::HalfOpen => false,
        }
    }

    fn counts(&self, error: &ExchangeError) -> bool {
        self.config.exceptions.is_empty() || self.config.exceptions.iter().any(|kind| error.matches_kind(kind))
    }

    fn record(&self, failed: bool) {
        let mut guard = self.breaker.lock();
        let breaker = &mut *guard;
        let now = Instant::now();

        if !failed {
            match breaker.phase {
                // admitted before the circuit opened; only a trial may close it
                Phase::Open { .. } => {
                    debug!(route_id = %self.route_id, "Ignoring late success while circuit breaker is open");
                }
                Phase::HalfOpen => {
                    info!(route_id = %self.route_id, "Circuit breaker closed");
                    breaker.phase = Phase::Closed;
                    breaker.failures.clear();
                }
                Phase::Closed => breaker.failures.clear(),
            }
            return;
        }

        breaker.failures.push_back(now);
        while let Some(oldest) = breaker.failures.front() {
            if now.duration_since(*oldest) > self.config.window {
                breaker.failures.pop_front();
            } else {
                break;
            }
        }

        let trip = matches!(breaker.phase, Phase::HalfOpen) || breaker.failures.len() >= self.config.threshold;
        if trip && !matches!(breaker.phase, Phase::Open { .. }) {
            warn!(
                route_id = %self.route_id,
                failures = breaker.failures.len(),
                threshold = self.config.threshold,
                "Circuit breaker opened"
            );
            metrics::counter!("switchyard_circuit_breaker_opened_total", "route" => self.route_id.clone()).increment(1);
            breaker.phase = Phase::Open { since: now };
        }
    }
}

#[async_trait]
impl Processor for CircuitBreakerLoadBalancer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        if !self.admit() {
            return Err(ExchangeError::rejected(format!(
                "Circuit breaker is open on route {}",
                self.route_id
            )));
        }

        invoke(self.processor.as_ref(), exchange).await;
        let failed = exchange.exception().map(|e| self.counts(e)).unwrap_or(false);
        self.record(failed);
        Ok(())
    }
}

#[async_trait]
impl Service for CircuitBreakerLoadBalancer {
    async fn start(&self) {
        let mut breaker = self.breaker.lock();
        breaker.phase = Phase::Closed;
        breaker.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor_fn;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn target(down: Arc<AtomicBool>, calls: Arc<AtomicUsize>) -> ProcessorRef {
        processor_fn(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            if down.load(Ordering::SeqCst) {
                Err(ExchangeError::processing("ConnectException", "refused"))
            } else {
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_opens_half_opens_and_closes() {
        let down = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let lb = CircuitBreakerLoadBalancer::new(
            "r1",
            target(down.clone(), calls.clone()),
            CircuitBreakerConfig::default()
                .with_threshold(2)
                .with_half_open_after(Duration::from_millis(100)),
        );

        for _ in 0..2 {
            let mut ex = Exchange::with_body("x");
            lb.process(&mut ex).await.unwrap();
            assert!(ex.is_failed());
        }
        assert_eq!(lb.state(), CircuitState::Open);

        let err = lb.process(&mut Exchange::with_body("x")).await.unwrap_err();
        assert_eq!(err.kind_name(), "RejectedExecution");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        down.store(false, Ordering::SeqCst);
        let mut ex = Exchange::with_body("x");
        lb.process(&mut ex).await.unwrap();
        assert!(!ex.is_failed());
        assert_eq!(lb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let down = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let lb = CircuitBreakerLoadBalancer::new(
            "r1",
            target(down, calls.clone()),
            CircuitBreakerConfig::default()
                .with_threshold(1)
                .with_half_open_after(Duration::from_millis(50)),
        );

        lb.process(&mut Exchange::with_body("x")).await.unwrap();
        assert_eq!(lb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        lb.process(&mut Exchange::with_body("x")).await.unwrap();
        assert_eq!(lb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        lb.start().await;
        assert_eq!(lb.state(), CircuitState::Closed);
    }

    /// Fails on body "fail", sleeps before succeeding on body "slow".
    struct Scripted;

    #[async_trait]
    impl Processor for Scripted {
        async fn process(&self, exchange: &mut Exchange) -> Result<()> {
            match exchange.body_str() {
                Some("fail") => Err(ExchangeError::processing("ConnectException", "refused")),
                Some("slow") => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_late_success_does_not_close_open_circuit() {
        let lb = Arc::new(CircuitBreakerLoadBalancer::new(
            "r1",
            Arc::new(Scripted),
            CircuitBreakerConfig::default()
                .with_threshold(2)
                .with_half_open_after(Duration::from_secs(10)),
        ));

        let slow = {
            let lb = lb.clone();
            tokio::spawn(async move {
                let mut ex = Exchange::with_body("slow");
                lb.process(&mut ex).await.unwrap();
                ex
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..2 {
            lb.process(&mut Exchange::with_body("fail")).await.unwrap();
        }
        assert_eq!(lb.state(), CircuitState::Open);

        let ex = slow.await.unwrap();
        assert!(!ex.is_failed());
        assert_eq!(lb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_uncounted_kinds_do_not_trip() {
        let down = Arc::new(AtomicBool::new(true));
        let lb = CircuitBreakerLoadBalancer::new(
            "r1",
            target(down, Arc::new(AtomicUsize::new(0))),
            CircuitBreakerConfig::default().with_threshold(1).with_exceptions(["IOException"]),
        );

        lb.process(&mut Exchange::with_body("x")).await.unwrap();
        assert_eq!(lb.state(), CircuitState::Closed);
    }
}
