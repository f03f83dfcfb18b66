use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sy_common::constants::REDELIVERY_EXHAUSTED;
use sy_common::{Exchange, ExchangeError, Result};
use tracing::{debug, warn};

use crate::processor::{invoke, Processor, ProcessorRef};
use crate::service::Service;
use crate::signal::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Error kinds that trigger failover. Empty means every failure does.
    pub exceptions: Vec<String>,
    /// `-1` retries without bound (only meaningful with `round_robin`).
    pub maximum_failover_attempts: i32,
    /// Start each exchange at the next processor and wrap around on failover.
    pub round_robin: bool,
    /// Start each exchange at the processor that last succeeded.
    pub sticky: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            exceptions: Vec::new(),
            maximum_failover_attempts: -1,
            round_robin: false,
            sticky: false,
        }
    }
}

impl FailoverConfig {
    pub fn with_exceptions<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exceptions = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_maximum_failover_attempts(mut self, attempts: i32) -> Self {
        self.maximum_failover_attempts = attempts;
        self
    }

    pub fn with_round_robin(mut self, round_robin: bool) -> Self {
        self.round_robin = round_robin;
        self
    }

    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }
}

/// Tries processors in turn until one succeeds.
///
/// Every attempt starts from the message as it entered the balancer. Children
/// are not wrapped by the route's error handler. When the balancer gives up
/// the exchange is marked exhausted so an enclosing error handler goes
/// straight to its dead-letter handling instead of redelivering.
pub struct FailoverLoadBalancer {
    processors: Vec<ProcessorRef>,
    config: FailoverConfig,
    counter: AtomicUsize,
    last_good: AtomicUsize,
    signal: ShutdownSignal,
}

impl FailoverLoadBalancer {
    pub fn new(processors: Vec<ProcessorRef>, config: FailoverConfig, signal: ShutdownSignal) -> Self {
        Self {
            processors,
            config,
            counter: AtomicUsize::new(0),
            last_good: AtomicUsize::new(0),
            signal,
        }
    }

    fn should_failover(&self, error: &ExchangeError) -> bool {
        self.config.exceptions.is_empty() || self.config.exceptions.iter().any(|kind| error.matches_kind(kind))
    }

    fn start_index(&self, count: usize) -> usize {
        if self.config.sticky {
            self.last_good.load(Ordering::SeqCst) % count
        } else if self.config.round_robin {
            self.counter.fetch_add(1, Ordering::SeqCst) % count
        } else {
            0
        }
    }

    fn attempts_exhausted(&self, failovers: usize, count: usize) -> bool {
        let max = self.config.maximum_failover_attempts;
        if max >= 0 && failovers > max as usize {
            return true;
        }
        // without wrap-around every processor gets one try
        !self.config.round_robin && failovers >= count
    }
}

#[async_trait]
impl Processor for FailoverLoadBalancer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let count = self.processors.len();
        let original = exchange.in_message().clone();
        let mut index = self.start_index(count);
        let mut failovers = 0usize;

        loop {
            if failovers > 0 {
                if self.signal.is_stopping() {
                    warn!(exchange_id = %exchange.id(), failovers, "Engine is stopping, giving up failover");
                    exchange.set_exception(ExchangeError::rejected(
                        "Failover interrupted: engine is shutting down",
                    ));
                    exchange.set_property(REDELIVERY_EXHAUSTED, true);
                    return Ok(());
                }
                exchange.set_in(original.clone());
                exchange.clear_out();
                exchange.clear_failure_state();
                tokio::task::yield_now().await;
            }

            invoke(self.processors[index].as_ref(), exchange).await;

            let Some(error) = exchange.exception() else {
                if self.config.sticky {
                    self.last_good.store(index, Ordering::SeqCst);
                }
                return Ok(());
            };

            if !self.should_failover(error) {
                debug!(exchange_id = %exchange.id(), error = %error, "Failure is not eligible for failover");
                return Ok(());
            }

            failovers += 1;
            metrics::counter!("switchyard_failover_attempts_total").increment(1);
            if self.attempts_exhausted(failovers, count) {
                warn!(exchange_id = %exchange.id(), failovers, error = %error, "Failover attempts exhausted");
                exchange.set_property(REDELIVERY_EXHAUSTED, true);
                return Ok(());
            }

            index = (index + 1) % count;
            debug!(exchange_id = %exchange.id(), next = index, failovers, "Failing over to next processor");
        }
    }
}

#[async_trait]
impl Service for FailoverLoadBalancer {
    async fn start(&self) {
        self.counter.store(0, Ordering::SeqCst);
        self.last_good.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor_fn;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn failing(kind: &'static str, hits: Arc<Mutex<Vec<usize>>>, id: usize) -> ProcessorRef {
        processor_fn(move |ex| {
            hits.lock().push(id);
            ex.set_body("mutated");
            Err(ExchangeError::processing(kind, "down"))
        })
    }

    fn succeeding(hits: Arc<Mutex<Vec<usize>>>, id: usize) -> ProcessorRef {
        processor_fn(move |ex| {
            hits.lock().push(id);
            assert_eq!(ex.body_str(), Some("order"));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_fails_over_with_original_message() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let lb = FailoverLoadBalancer::new(
            vec![failing("IOException", hits.clone(), 0), succeeding(hits.clone(), 1)],
            FailoverConfig::default(),
            ShutdownSignal::new(),
        );

        let mut ex = Exchange::with_body("order");
        lb.process(&mut ex).await.unwrap();
        assert!(!ex.is_failed());
        assert_eq!(*hits.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_allowlist_propagates_other_failures() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let lb = FailoverLoadBalancer::new(
            vec![failing("IllegalArgument", hits.clone(), 0), succeeding(hits.clone(), 1)],
            FailoverConfig::default().with_exceptions(["IOException"]),
            ShutdownSignal::new(),
        );

        let mut ex = Exchange::with_body("order");
        lb.process(&mut ex).await.unwrap();
        assert_eq!(ex.exception().map(|e| e.kind_name()), Some("IllegalArgument"));
        assert!(!ex.property_bool(REDELIVERY_EXHAUSTED));
        assert_eq!(*hits.lock(), vec![0]);
    }

    #[tokio::test]
    async fn test_exhausted_marks_exchange() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let lb = FailoverLoadBalancer::new(
            vec![failing("IOException", hits.clone(), 0), failing("IOException", hits.clone(), 1)],
            FailoverConfig::default().with_round_robin(true).with_maximum_failover_attempts(3),
            ShutdownSignal::new(),
        );

        let mut ex = Exchange::with_body("order");
        lb.process(&mut ex).await.unwrap();
        assert!(ex.is_failed());
        assert!(ex.property_bool(REDELIVERY_EXHAUSTED));
        assert_eq!(*hits.lock(), vec![0, 1, 0, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unbounded_loop_stops_on_shutdown() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let signal = ShutdownSignal::new();
        let lb = Arc::new(FailoverLoadBalancer::new(
            vec![failing("IOException", hits.clone(), 0)],
            FailoverConfig::default().with_round_robin(true),
            signal.clone(),
        ));

        let task = {
            let lb = lb.clone();
            tokio::spawn(async move {
                let mut ex = Exchange::with_body("order");
                lb.process(&mut ex).await.unwrap();
                ex
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.begin();
        let ex = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(ex.exception().map(|e| e.kind_name()), Some("RejectedExecution"));
        assert!(hits.lock().len() > 1);
    }

    #[tokio::test]
    async fn test_sticky_starts_from_last_good() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let flaky_down = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let first = {
            let hits = hits.clone();
            let down = flaky_down.clone();
            processor_fn(move |_| {
                hits.lock().push(0);
                if down.load(Ordering::SeqCst) {
                    Err(ExchangeError::processing("IOException", "down"))
                } else {
                    Ok(())
                }
            })
        };
        let lb = FailoverLoadBalancer::new(
            vec![first, succeeding(hits.clone(), 1)],
            FailoverConfig::default().with_sticky(true),
            ShutdownSignal::new(),
        );

        lb.process(&mut Exchange::with_body("order")).await.unwrap();
        flaky_down.store(false, Ordering::SeqCst);
        lb.process(&mut Exchange::with_body("order")).await.unwrap();

        assert_eq!(*hits.lock(), vec![0, 1, 1]);
    }
}
