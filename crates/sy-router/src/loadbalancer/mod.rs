//! Load balancers: pick one of a fixed list of processors per exchange.
//!
//! - Round robin, random and sticky are plain selectors driven by
//!   [`SelectingLoadBalancer`]
//! - Failover retries the next processor itself and never uses the route's
//!   error handler for its children
//! - Circuit breaker guards exactly one processor
//!
//! All policy state is reset when the owning route starts.

mod circuit_breaker;
mod failover;
mod random;
mod round_robin;
mod sticky;

use std::sync::Arc;

use async_trait::async_trait;
use sy_common::{Exchange, ExpressionRef, Result};

use crate::error::ConfigError;
use crate::processor::{invoke, Processor, ProcessorRef};
use crate::service::{Service, ServiceRef};
use crate::signal::ShutdownSignal;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerLoadBalancer, CircuitState};
pub use failover::{FailoverConfig, FailoverLoadBalancer};
pub use random::RandomSelector;
pub use round_robin::RoundRobinSelector;
pub use sticky::StickySelector;

/// The processor chosen for one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    /// Correlation key the choice was made for, if the policy uses one.
    pub key: Option<String>,
}

impl Selection {
    pub fn index(index: usize) -> Self {
        Self { index, key: None }
    }
}

/// Selection state of a single-choice policy.
pub trait LoadBalanceSelector: Send + Sync {
    fn select(&self, exchange: &Exchange, count: usize) -> Result<Selection>;

    /// Told how the selected processor did.
    fn on_outcome(&self, _selection: &Selection, _failed: bool) {}

    fn reset(&self) {}
}

/// Sends each exchange to the processor its selector picks.
pub struct SelectingLoadBalancer {
    processors: Vec<ProcessorRef>,
    selector: Arc<dyn LoadBalanceSelector>,
}

impl SelectingLoadBalancer {
    pub fn new(processors: Vec<ProcessorRef>, selector: Arc<dyn LoadBalanceSelector>) -> Self {
        Self { processors, selector }
    }
}

#[async_trait]
impl Processor for SelectingLoadBalancer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let selection = self.selector.select(exchange, self.processors.len())?;
        let processor = &self.processors[selection.index % self.processors.len()];
        invoke(processor.as_ref(), exchange).await;
        self.selector.on_outcome(&selection, exchange.is_failed());
        Ok(())
    }
}

#[async_trait]
impl Service for SelectingLoadBalancer {
    async fn start(&self) {
        self.selector.reset();
    }
}

/// Load-balancing policy of a node.
#[derive(Clone)]
pub enum LoadBalancerPolicy {
    RoundRobin,
    Random,
    Sticky(ExpressionRef),
    Failover(FailoverConfig),
    CircuitBreaker(CircuitBreakerConfig),
}

impl LoadBalancerPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin => "roundRobin",
            Self::Random => "random",
            Self::Sticky(_) => "sticky",
            Self::Failover(_) => "failover",
            Self::CircuitBreaker(_) => "circuitBreaker",
        }
    }
}

/// Build the processor for a policy. The returned service resets its state.
pub fn build_load_balancer(
    route_id: &str,
    policy: &LoadBalancerPolicy,
    processors: Vec<ProcessorRef>,
    signal: ShutdownSignal,
) -> std::result::Result<(ProcessorRef, ServiceRef), ConfigError> {
    if processors.is_empty() {
        return Err(ConfigError::NoOutputs(format!("{} load balancer", policy.name())));
    }

    Ok(match policy {
        LoadBalancerPolicy::RoundRobin => selecting(processors, Arc::new(RoundRobinSelector::default())),
        LoadBalancerPolicy::Random => selecting(processors, Arc::new(RandomSelector)),
        LoadBalancerPolicy::Sticky(expression) => {
            selecting(processors, Arc::new(StickySelector::new(expression.clone())))
        }
        LoadBalancerPolicy::Failover(config) => {
            let lb = Arc::new(FailoverLoadBalancer::new(processors, config.clone(), signal));
            (lb.clone() as ProcessorRef, lb as ServiceRef)
        }
        LoadBalancerPolicy::CircuitBreaker(config) => {
            if processors.len() != 1 {
                return Err(ConfigError::CircuitBreakerTargets(processors.len()));
            }
            let lb = Arc::new(CircuitBreakerLoadBalancer::new(route_id, processors[0].clone(), config.clone()));
            (lb.clone() as ProcessorRef, lb as ServiceRef)
        }
    })
}

fn selecting(processors: Vec<ProcessorRef>, selector: Arc<dyn LoadBalanceSelector>) -> (ProcessorRef, ServiceRef) {
    let lb = Arc::new(SelectingLoadBalancer::new(processors, selector));
    (lb.clone() as ProcessorRef, lb as ServiceRef)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor_fn;
    use parking_lot::Mutex;

    fn tagged(tag: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> ProcessorRef {
        processor_fn(move |_| {
            log.lock().push(tag);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_round_robin_cycles_and_resets_on_start() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let processors = vec![tagged("a", log.clone()), tagged("b", log.clone()), tagged("c", log.clone())];
        let (lb, service) =
            build_load_balancer("r1", &LoadBalancerPolicy::RoundRobin, processors, ShutdownSignal::new()).unwrap();

        for _ in 0..4 {
            lb.process(&mut Exchange::with_body("x")).await.unwrap();
        }
        service.start().await;
        lb.process(&mut Exchange::with_body("x")).await.unwrap();

        assert_eq!(*log.lock(), vec!["a", "b", "c", "a", "a"]);
    }

    #[test]
    fn test_circuit_breaker_requires_single_target() {
        let processors = vec![processor_fn(|_| Ok(())), processor_fn(|_| Ok(()))];
        let err = build_load_balancer(
            "r1",
            &LoadBalancerPolicy::CircuitBreaker(CircuitBreakerConfig::default()),
            processors,
            ShutdownSignal::new(),
        )
        .err();
        assert_eq!(err, Some(ConfigError::CircuitBreakerTargets(2)));
    }

    #[test]
    fn test_no_processors() {
        let err = build_load_balancer("r1", &LoadBalancerPolicy::Random, Vec::new(), ShutdownSignal::new()).err();
        assert!(matches!(err, Some(ConfigError::NoOutputs(_))));
    }
}
