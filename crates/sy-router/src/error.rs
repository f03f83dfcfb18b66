use sy_common::ExchangeError;
use thiserror::Error;

/// Problems detected while building routes. All of these surface from
/// `EngineContext::add_route`, never while exchanges are flowing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Cannot configure {conflicting} load balancer: {existing} load balancer is already configured on this node")]
    LoadBalancerConflict { existing: String, conflicting: String },

    #[error("No load balancer policy configured")]
    MissingLoadBalancerPolicy,

    #[error("{0} requires at least one output")]
    NoOutputs(String),

    #[error("Circuit breaker load balancer supports exactly one target, got {0}")]
    CircuitBreakerTargets(usize),

    #[error("doCatch must have at least one exception kind configured")]
    CatchWithoutExceptions,

    #[error("doTry must have at least one doCatch or doFinally")]
    TryWithoutCatchOrFinally,

    #[error("onException must have at least one exception kind configured")]
    OnExceptionWithoutExceptions,

    #[error("No {kind} found in registry with name: {name}")]
    RegistryMiss { kind: String, name: String },

    #[error("Invalid delay pattern '{pattern}': {reason}")]
    InvalidDelayPattern { pattern: String, reason: String },

    #[error("Aggregator on route {0} has no completion condition (size, predicate or timeout)")]
    MissingCompletionCondition(String),

    #[error("Invalid throttle configuration: {0}")]
    InvalidThrottle(String),

    #[error("Duplicate route id: {0}")]
    DuplicateRoute(String),

    #[error("Startup order {order} is used by both route {first} and route {second}")]
    DuplicateStartupOrder { order: u32, first: String, second: String },
}

impl ConfigError {
    pub fn registry_miss(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::RegistryMiss {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Failed to start consumer for route {route_id}: {message}")]
    Consumer { route_id: String, message: String },

    #[error("Engine context has been shut down")]
    ContextStopped,

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] sy_config::ConfigLoadError),
}
