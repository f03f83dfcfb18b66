//! Lifecycle hooks for stateful route components and consumers.

use std::sync::Arc;

use async_trait::async_trait;
use sy_common::{Exchange, ExchangeError};
use tracing::{error, warn};

use crate::error::RouterError;
use crate::processor::ProcessorRef;
use crate::signal::ShutdownSignal;

/// What a route does with in-flight work when it is asked to stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownRunningTask {
    /// Finish the exchange currently being processed, drop the backlog.
    #[default]
    CompleteCurrentTaskOnly,
    /// Keep draining until the consumer's backlog is empty.
    CompleteAllTasks,
}

/// Whether a route stops in its turn or stays up until every other route has drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownRoute {
    #[default]
    Default,
    Defer,
}

/// A stateful component owned by a route (aggregators, resequencers, load
/// balancers). Started and stopped with its route; may hold pending work
/// that the shutdown coordinator waits for.
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) {}

    async fn stop(&self) {}

    /// Exchanges held by this component that have not been emitted yet.
    fn pending_exchanges(&self) -> usize {
        0
    }

    /// Called while the route shuts down. `forced` is set once the graceful
    /// period is over.
    async fn prepare_shutdown(&self, _task: ShutdownRunningTask, _forced: bool) {}
}

pub type ServiceRef = Arc<dyn Service>;

// ============================================================================
// Consumers
// ============================================================================

/// Receives failures a consumer could not hand to the route.
pub trait ExceptionHandler: Send + Sync {
    fn handle_exception(&self, message: &str, exchange: Option<&Exchange>, error: &ExchangeError);
}

pub struct LoggingExceptionHandler {
    route_id: String,
}

impl LoggingExceptionHandler {
    pub fn new(route_id: impl Into<String>) -> Self {
        Self { route_id: route_id.into() }
    }
}

impl ExceptionHandler for LoggingExceptionHandler {
    fn handle_exception(&self, message: &str, exchange: Option<&Exchange>, error: &ExchangeError) {
        match exchange {
            Some(exchange) => error!(
                route_id = %self.route_id,
                exchange_id = %exchange.id(),
                error = %error,
                "{}",
                message
            ),
            None => warn!(route_id = %self.route_id, error = %error, "{}", message),
        }
    }
}

/// Everything a consumer needs to feed its route.
#[derive(Clone)]
pub struct ConsumerContext {
    pub route_id: String,
    pub endpoint_uri: String,
    pub processor: ProcessorRef,
    pub exception_handler: Arc<dyn ExceptionHandler>,
    pub signal: ShutdownSignal,
}

/// The external trigger that creates exchanges for a route.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn start(&self, context: ConsumerContext) -> Result<(), RouterError>;

    /// Stop producing exchanges. May wait for the exchange currently being
    /// handed to the route.
    async fn stop(&self);

    /// Exchanges received but not yet handed to the route.
    fn pending_exchanges(&self) -> usize {
        0
    }

    /// Called before the coordinator waits on in-flight work, and again with
    /// `forced` once the timeout has elapsed.
    fn prepare_shutdown(&self, _task: ShutdownRunningTask, _forced: bool) {}
}

pub type ConsumerRef = Arc<dyn Consumer>;
