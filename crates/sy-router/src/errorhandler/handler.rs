use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sy_common::constants::{
    ERRORHANDLER_HANDLED, EXCEPTION_CAUGHT, FAILURE_ENDPOINT, FAILURE_HANDLED, FAILURE_ROUTE_ID, REDELIVERED,
    REDELIVERY_COUNTER, REDELIVERY_DELAY, REDELIVERY_EXHAUSTED, REDELIVERY_MAX_COUNTER,
};
use sy_common::{Exchange, ExchangeError, Result};
use tracing::{debug, error, warn};

use crate::endpoint::EndpointRegistry;
use crate::errorhandler::exception_policy::ExceptionPolicy;
use crate::errorhandler::redelivery::RedeliveryPolicy;
use crate::processor::{invoke, Processor, ProcessorRef};
use crate::signal::ShutdownSignal;

/// Reified error handler settings for one route, shared by every wrapped output.
pub struct ErrorHandlerConfig {
    pub route_id: String,
    pub dead_letter_uri: Option<String>,
    pub policy: RedeliveryPolicy,
    pub exception_policies: Vec<ExceptionPolicy>,
    pub use_original_message: bool,
    pub dead_letter_handle_new_exception: bool,
    pub on_redelivery: Option<ProcessorRef>,
    pub allow_redelivery_while_stopping: bool,
    pub handle_fault: bool,
    pub endpoints: Arc<EndpointRegistry>,
    pub signal: ShutdownSignal,
}

/// Wraps one output. Failed deliveries are retried according to the
/// redelivery policy of the matching exception clause (or the handler's own);
/// once exhausted the exchange goes to the clause's recovery processor or the
/// dead letter endpoint.
///
/// Nested handlers cooperate through exchange flags: a failure already
/// finished by an inner handler carries `FAILURE_HANDLED` and passes through
/// untouched; one carrying only `REDELIVERY_EXHAUSTED` skips straight to the
/// exhausted path.
pub struct RedeliveryErrorHandler {
    output: ProcessorRef,
    config: Arc<ErrorHandlerConfig>,
}

impl RedeliveryErrorHandler {
    pub fn new(output: ProcessorRef, config: Arc<ErrorHandlerConfig>) -> Self {
        Self { output, config }
    }

    fn convert_fault(exchange: &mut Exchange) {
        if exchange.is_failed() {
            return;
        }
        if let Some(fault) = exchange.message_mut().fault.take() {
            exchange.set_exception(ExchangeError::Fault(fault.reason));
        }
    }

    /// Sleep before a redelivery. Returns `false` when a stop began while
    /// sleeping and redelivery during stop is not allowed.
    async fn sleep(&self, delay: Duration) -> bool {
        if self.config.allow_redelivery_while_stopping {
            tokio::time::sleep(delay).await;
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.config.signal.stopping() => false,
        }
    }

    fn reject_redelivery(&self, exchange: &mut Exchange, attempt: u32) {
        warn!(
            route_id = %self.config.route_id,
            exchange_id = %exchange.id(),
            attempt,
            "Redelivery rejected: engine is stopping"
        );
        exchange.set_exception(ExchangeError::RedeliveryRejected(format!(
            "Redelivery not allowed while stopping (exchange {}, attempt {})",
            exchange.id(),
            attempt
        )));
    }

    fn prepare_for_redelivery(exchange: &mut Exchange, counter: u32, policy: &RedeliveryPolicy, delay: Duration) {
        exchange.clear_exception();
        exchange.clear_out();
        let message = exchange.in_message_mut();
        message.set_header(REDELIVERED, true);
        message.set_header(REDELIVERY_COUNTER, counter);
        message.set_header(REDELIVERY_DELAY, delay.as_millis() as u64);
        if policy.maximum_redeliveries >= 0 {
            message.set_header(REDELIVERY_MAX_COUNTER, policy.maximum_redeliveries);
        }
    }

    async fn deliver_to_failure_processor(
        &self,
        exchange: &mut Exchange,
        clause: Option<&ExceptionPolicy>,
        counter: u32,
    ) {
        let Some(error) = exchange.exception().cloned() else {
            return;
        };
        let config = &self.config;

        exchange.set_property(REDELIVERY_EXHAUSTED, true);
        exchange.set_property(EXCEPTION_CAUGHT, error.to_string());
        exchange.set_property(FAILURE_ROUTE_ID, config.route_id.clone());
        exchange.set_caught_exception(error.clone());
        if counter > 0 {
            let message = exchange.message_mut();
            message.set_header(REDELIVERED, true);
            message.set_header(REDELIVERY_COUNTER, counter);
        }

        let clause_processor = clause.and_then(|c| c.processor.clone());
        let is_dead_letter = clause_processor.is_none() && config.dead_letter_uri.is_some();
        let handled = clause.and_then(|c| c.handled).unwrap_or(config.dead_letter_uri.is_some());
        let continued = clause.map(|c| c.continued).unwrap_or(false);
        let use_original = clause
            .and_then(|c| c.use_original_message)
            .unwrap_or(config.use_original_message);

        let target = match clause_processor {
            Some(processor) => Some(processor),
            None => match &config.dead_letter_uri {
                Some(uri) => match config.endpoints.resolve(uri) {
                    Ok(processor) => {
                        exchange.set_property(FAILURE_ENDPOINT, uri.clone());
                        Some(processor)
                    }
                    Err(e) => {
                        error!(route_id = %config.route_id, uri = %uri, error = %e, "Dead letter endpoint could not be resolved");
                        exchange.set_exception(e);
                        exchange.set_property(FAILURE_HANDLED, true);
                        return;
                    }
                },
                None => None,
            },
        };

        if let Some(target) = target {
            if use_original {
                if let Some(unit_of_work) = exchange.unit_of_work().cloned() {
                    exchange.set_in(unit_of_work.original_message().clone());
                    exchange.clear_out();
                }
            }

            exchange.clear_exception();
            invoke(target.as_ref(), exchange).await;

            if let Some(new_error) = exchange.take_exception() {
                if is_dead_letter && config.dead_letter_handle_new_exception {
                    warn!(
                        route_id = %config.route_id,
                        exchange_id = %exchange.id(),
                        error = %new_error,
                        "Dead letter endpoint failed; failure handled"
                    );
                } else {
                    error!(
                        route_id = %config.route_id,
                        exchange_id = %exchange.id(),
                        error = %new_error,
                        "Failure processor failed"
                    );
                    exchange.set_exception(new_error);
                    exchange.set_property(FAILURE_HANDLED, true);
                    return;
                }
            }

            if !(handled || continued) {
                exchange.set_exception(error.clone());
            }
        } else if handled || continued {
            exchange.clear_exception();
        }

        if exchange.is_failed() {
            exchange.set_property(FAILURE_HANDLED, true);
            error!(
                route_id = %config.route_id,
                exchange_id = %exchange.id(),
                attempts = counter + 1,
                error = %error,
                "Failed delivery for exchange. Exhausted after delivery attempts"
            );
            return;
        }

        exchange.clear_failure_state();
        if continued {
            debug!(route_id = %config.route_id, exchange_id = %exchange.id(), "Failure continued");
        } else if handled {
            exchange.set_property(ERRORHANDLER_HANDLED, true);
            debug!(route_id = %config.route_id, exchange_id = %exchange.id(), "Failure handled");
        }
        metrics::counter!("switchyard_exchanges_exhausted_total", "route" => config.route_id.clone()).increment(1);
    }
}

#[async_trait]
impl Processor for RedeliveryErrorHandler {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let config = &self.config;
        let mut counter: u32 = 0;
        let mut previous_delay = Duration::ZERO;

        loop {
            invoke(self.output.as_ref(), exchange).await;
            if config.handle_fault {
                Self::convert_fault(exchange);
            }

            let Some(error) = exchange.exception().cloned() else {
                return Ok(());
            };
            if exchange.property_bool(FAILURE_HANDLED) {
                return Ok(());
            }
            if !error.is_retryable() {
                debug!(
                    route_id = %config.route_id,
                    exchange_id = %exchange.id(),
                    kind = error.kind_name(),
                    "Failure is not eligible for redelivery"
                );
                exchange.set_property(REDELIVERY_EXHAUSTED, true);
                exchange.set_property(FAILURE_HANDLED, true);
                return Ok(());
            }

            let clause = ExceptionPolicy::select(&config.exception_policies, &error, exchange);
            let policy = clause.and_then(|c| c.redelivery.as_ref()).unwrap_or(&config.policy);
            let next = counter + 1;

            let retry = !exchange.property_bool(REDELIVERY_EXHAUSTED)
                && match clause.and_then(|c| c.retry_while.as_ref()) {
                    Some(predicate) => predicate.matches(exchange).unwrap_or(false),
                    None => policy.should_redeliver(next),
                };
            if !retry {
                self.deliver_to_failure_processor(exchange, clause, counter).await;
                return Ok(());
            }

            if !config.allow_redelivery_while_stopping && config.signal.is_stopping() {
                self.reject_redelivery(exchange, next);
                self.deliver_to_failure_processor(exchange, clause, counter).await;
                return Ok(());
            }

            let delay = policy.calculate_delay(previous_delay, next);
            previous_delay = delay;
            if !delay.is_zero() {
                debug!(
                    route_id = %config.route_id,
                    exchange_id = %exchange.id(),
                    attempt = next,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Scheduling redelivery"
                );
                if !self.sleep(delay).await {
                    self.reject_redelivery(exchange, next);
                    self.deliver_to_failure_processor(exchange, clause, counter).await;
                    return Ok(());
                }
            }

            counter = next;
            Self::prepare_for_redelivery(exchange, counter, policy, delay);
            metrics::counter!("switchyard_redeliveries_total", "route" => config.route_id.clone()).increment(1);

            let hook = clause
                .and_then(|c| c.on_redelivery.as_ref())
                .or(config.on_redelivery.as_ref());
            if let Some(hook) = hook {
                invoke(hook.as_ref(), exchange).await;
                if exchange.is_failed() {
                    self.deliver_to_failure_processor(exchange, clause, counter).await;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor_fn;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sy_common::Value;

    fn config(policy: RedeliveryPolicy, endpoints: Arc<EndpointRegistry>, dead_letter: Option<&str>) -> ErrorHandlerConfig {
        ErrorHandlerConfig {
            route_id: "test".into(),
            dead_letter_uri: dead_letter.map(str::to_string),
            policy,
            exception_policies: Vec::new(),
            use_original_message: false,
            dead_letter_handle_new_exception: true,
            on_redelivery: None,
            allow_redelivery_while_stopping: true,
            handle_fault: false,
            endpoints,
            signal: ShutdownSignal::new(),
        }
    }

    fn failing(attempts: Arc<AtomicUsize>, succeed_after: usize) -> ProcessorRef {
        processor_fn(move |_| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n > succeed_after {
                Ok(())
            } else {
                Err(ExchangeError::processing("IOException", format!("attempt {}", n)))
            }
        })
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = RedeliveryPolicy::default()
            .maximum_redeliveries(3)
            .redelivery_delay(Duration::from_millis(1));
        let handler = RedeliveryErrorHandler::new(
            failing(attempts.clone(), 2),
            Arc::new(config(policy, Arc::new(EndpointRegistry::new()), None)),
        );

        let mut ex = Exchange::with_body("x");
        handler.process(&mut ex).await.unwrap();

        assert!(!ex.is_failed());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(ex.header(REDELIVERY_COUNTER), Some(&Value::from(2)));
    }

    #[tokio::test]
    async fn test_exhausted_to_dead_letter() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let endpoints = Arc::new(EndpointRegistry::new());
        {
            let received = received.clone();
            endpoints.register(
                "mock:dead",
                processor_fn(move |ex| {
                    received.lock().push(ex.clone());
                    Ok(())
                }),
            );
        }

        let policy = RedeliveryPolicy::default()
            .maximum_redeliveries(2)
            .redelivery_delay(Duration::from_millis(1));
        let handler = RedeliveryErrorHandler::new(
            failing(attempts.clone(), usize::MAX),
            Arc::new(config(policy, endpoints, Some("mock:dead"))),
        );

        let mut ex = Exchange::with_body("x");
        handler.process(&mut ex).await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!ex.is_failed());
        assert!(ex.property_bool(ERRORHANDLER_HANDLED));

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].header(REDELIVERY_COUNTER), Some(&Value::from(2)));
        assert_eq!(received[0].header(REDELIVERED), Some(&Value::Bool(true)));
        assert_eq!(received[0].caught_exception().map(|e| e.kind_name()), Some("IOException"));
    }

    #[tokio::test]
    async fn test_rollback_is_not_redelivered() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = {
            let attempts = attempts.clone();
            processor_fn(move |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Rollback("abort".into()))
            })
        };
        let policy = RedeliveryPolicy::default().maximum_redeliveries(5);
        let handler = RedeliveryErrorHandler::new(counted, Arc::new(config(policy, Arc::new(EndpointRegistry::new()), None)));

        let mut ex = Exchange::with_body("x");
        handler.process(&mut ex).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(ex.exception(), Some(ExchangeError::Rollback(_))));
    }

    #[tokio::test]
    async fn test_inner_handled_failure_passes_through_outer() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let endpoints = Arc::new(EndpointRegistry::new());
        let inner_policy = RedeliveryPolicy::default()
            .maximum_redeliveries(1)
            .redelivery_delay(Duration::from_millis(1));
        let inner: ProcessorRef = Arc::new(RedeliveryErrorHandler::new(
            failing(attempts.clone(), usize::MAX),
            Arc::new(config(inner_policy, endpoints.clone(), None)),
        ));
        let outer_policy = RedeliveryPolicy::default()
            .maximum_redeliveries(3)
            .redelivery_delay(Duration::from_millis(1));
        let outer = RedeliveryErrorHandler::new(inner, Arc::new(config(outer_policy, endpoints, None)));

        let mut ex = Exchange::with_body("x");
        outer.process(&mut ex).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(ex.is_failed());
    }
}
