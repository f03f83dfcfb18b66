//! A running route: its entry processor, stateful services and consumer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sy_common::constants::{ERRORHANDLER_HANDLED, FROM_ENDPOINT, FROM_ROUTE_ID};
use sy_common::{Exchange, ExchangeError, Result, UnitOfWork};
use tracing::{debug, error, info};

use crate::completion::OnCompletion;
use crate::error::RouterError;
use crate::processor::{invoke, Processor, ProcessorRef};
use crate::service::{
    ConsumerContext, ConsumerRef, LoggingExceptionHandler, ServiceRef, ShutdownRoute, ShutdownRunningTask,
};
use crate::signal::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Stopped,
    Started,
    /// Draining; new exchanges are still accepted.
    ShuttingDown,
    /// Intake closed; only admitted exchanges may finish.
    Stopping,
}

impl RouteStatus {
    fn accepts(self) -> bool {
        matches!(self, Self::Started | Self::ShuttingDown)
    }
}

pub(crate) struct RouteState {
    status: RwLock<RouteStatus>,
    inflight: AtomicUsize,
}

impl RouteState {
    fn new() -> Self {
        Self {
            status: RwLock::new(RouteStatus::Stopped),
            inflight: AtomicUsize::new(0),
        }
    }

    /// Admit one exchange. The count is taken before the status check so a
    /// concurrent stop never sees zero in-flight while an admission races it.
    fn enter(&self, route_id: &str) -> Result<InflightGuard<'_>> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard(self);
        let status = *self.status.read();
        if !status.accepts() {
            return Err(ExchangeError::rejected(format!(
                "Route {} is not accepting exchanges ({:?})",
                route_id, status
            )));
        }
        Ok(guard)
    }
}

struct InflightGuard<'a>(&'a RouteState);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Entry processor of a route. Owns the unit of work of exchanges that enter
/// here first; exchanges arriving from another route keep theirs.
pub(crate) struct RouteProcessor {
    route_id: String,
    from_uri: String,
    state: Arc<RouteState>,
    processor: ProcessorRef,
    on_completions: Vec<Arc<OnCompletion>>,
}

#[async_trait]
impl Processor for RouteProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let _guard = self.state.enter(&self.route_id)?;

        let owner = if exchange.unit_of_work().is_none() {
            let unit_of_work = Arc::new(UnitOfWork::new(exchange));
            exchange.set_unit_of_work(unit_of_work.clone());
            Some(unit_of_work)
        } else {
            None
        };
        if let Some(unit_of_work) = exchange.unit_of_work() {
            for on_completion in &self.on_completions {
                unit_of_work.add_synchronization(on_completion.clone());
            }
        }
        if exchange.property(FROM_ROUTE_ID).is_none() {
            exchange.set_property(FROM_ROUTE_ID, self.route_id.clone());
            exchange.set_property(FROM_ENDPOINT, self.from_uri.clone());
        }

        metrics::counter!("switchyard_exchanges_total", "route" => self.route_id.clone()).increment(1);
        invoke(self.processor.as_ref(), exchange).await;
        if exchange.is_failed() {
            metrics::counter!("switchyard_exchanges_failed_total", "route" => self.route_id.clone()).increment(1);
            debug!(
                route_id = %self.route_id,
                exchange_id = %exchange.id(),
                error = ?exchange.exception(),
                "Exchange completed with failure"
            );
        }

        match owner {
            Some(unit_of_work) => {
                unit_of_work.done(exchange).await;
                exchange.detach_unit_of_work();
            }
            // A failure handled inside this route does not stop the caller.
            None => {
                exchange.remove_property(ERRORHANDLER_HANDLED);
            }
        }
        Ok(())
    }
}

pub(crate) struct RouteSettings {
    pub id: String,
    pub from_uri: String,
    pub startup_order: u32,
    pub auto_startup: bool,
    pub shutdown_route: ShutdownRoute,
    pub shutdown_running_task: ShutdownRunningTask,
    pub consumer: Option<ConsumerRef>,
}

pub struct Route {
    settings: RouteSettings,
    entry: ProcessorRef,
    services: Vec<ServiceRef>,
    state: Arc<RouteState>,
    signal: ShutdownSignal,
}

impl Route {
    pub(crate) fn new(
        settings: RouteSettings,
        processor: ProcessorRef,
        services: Vec<ServiceRef>,
        on_completions: Vec<Arc<OnCompletion>>,
        signal: ShutdownSignal,
    ) -> Self {
        let state = Arc::new(RouteState::new());
        let entry: ProcessorRef = Arc::new(RouteProcessor {
            route_id: settings.id.clone(),
            from_uri: settings.from_uri.clone(),
            state: state.clone(),
            processor,
            on_completions,
        });
        Self {
            settings,
            entry,
            services,
            state,
            signal,
        }
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn from_uri(&self) -> &str {
        &self.settings.from_uri
    }

    pub fn startup_order(&self) -> u32 {
        self.settings.startup_order
    }

    pub fn auto_startup(&self) -> bool {
        self.settings.auto_startup
    }

    pub fn shutdown_route(&self) -> ShutdownRoute {
        self.settings.shutdown_route
    }

    pub fn shutdown_running_task(&self) -> ShutdownRunningTask {
        self.settings.shutdown_running_task
    }

    pub fn status(&self) -> RouteStatus {
        *self.state.status.read()
    }

    /// Exchanges currently being processed by this route.
    pub fn inflight(&self) -> usize {
        self.state.inflight.load(Ordering::SeqCst)
    }

    /// Exchanges the consumer has received but not handed over yet.
    pub fn backlog(&self) -> usize {
        self.settings.consumer.as_ref().map(|c| c.pending_exchanges()).unwrap_or(0)
    }

    /// Backlog plus exchanges held by stateful services.
    pub fn pending_exchanges(&self) -> usize {
        self.backlog() + self.services.iter().map(|s| s.pending_exchanges()).sum::<usize>()
    }

    /// The processor exchanges enter through.
    pub fn entry(&self) -> ProcessorRef {
        self.entry.clone()
    }

    fn set_status(&self, status: RouteStatus) {
        let previous = std::mem::replace(&mut *self.state.status.write(), status);
        if previous != status {
            debug!(route_id = %self.id(), from = ?previous, to = ?status, "Route status changed");
        }
    }

    pub(crate) async fn start(&self) -> std::result::Result<(), RouterError> {
        if self.status() == RouteStatus::Started {
            return Ok(());
        }

        for service in &self.services {
            service.start().await;
        }
        self.set_status(RouteStatus::Started);

        if let Some(consumer) = &self.settings.consumer {
            let context = ConsumerContext {
                route_id: self.id().to_string(),
                endpoint_uri: self.from_uri().to_string(),
                processor: self.entry(),
                exception_handler: Arc::new(LoggingExceptionHandler::new(self.id())),
                signal: self.signal.clone(),
            };
            if let Err(e) = consumer.start(context).await {
                error!(route_id = %self.id(), error = %e, "Consumer failed to start");
                self.set_status(RouteStatus::Stopped);
                self.stop_services().await;
                return Err(RouterError::Consumer {
                    route_id: self.id().to_string(),
                    message: e.to_string(),
                });
            }
        }

        info!(route_id = %self.id(), from = %self.from_uri(), "Route started");
        Ok(())
    }

    /// First shutdown step: draining begins but exchanges are still admitted.
    pub(crate) fn begin_shutdown(&self) {
        if self.status() == RouteStatus::Started {
            self.set_status(RouteStatus::ShuttingDown);
        }
    }

    pub(crate) fn close_intake(&self) {
        if self.status() != RouteStatus::Stopped {
            self.set_status(RouteStatus::Stopping);
        }
    }

    pub(crate) async fn stop_consumer(&self) {
        if let Some(consumer) = &self.settings.consumer {
            consumer.stop().await;
        }
    }

    pub(crate) async fn prepare_shutdown(&self, task: ShutdownRunningTask, forced: bool) {
        if let Some(consumer) = &self.settings.consumer {
            consumer.prepare_shutdown(task, forced);
        }
        for service in &self.services {
            service.prepare_shutdown(task, forced).await;
        }
    }

    pub(crate) async fn stop_services(&self) {
        for service in self.services.iter().rev() {
            service.stop().await;
        }
    }

    pub(crate) fn mark_stopped(&self) {
        self.set_status(RouteStatus::Stopped);
        info!(route_id = %self.id(), "Route stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::OnCompletionMode;
    use crate::processor::processor_fn;
    use std::sync::atomic::AtomicBool;

    fn settings(id: &str) -> RouteSettings {
        RouteSettings {
            id: id.into(),
            from_uri: format!("direct:{}", id),
            startup_order: 1000,
            auto_startup: true,
            shutdown_route: ShutdownRoute::Default,
            shutdown_running_task: ShutdownRunningTask::CompleteCurrentTaskOnly,
            consumer: None,
        }
    }

    #[tokio::test]
    async fn test_rejects_until_started_and_after_intake_closes() {
        let route = Route::new(settings("r"), processor_fn(|_| Ok(())), Vec::new(), Vec::new(), ShutdownSignal::new());
        let entry = route.entry();

        let mut ex = Exchange::with_body("x");
        let err = entry.process(&mut ex).await.unwrap_err();
        assert_eq!(err.kind_name(), "RejectedExecution");
        assert_eq!(route.inflight(), 0);

        route.start().await.unwrap();
        let mut ex = Exchange::with_body("x");
        entry.process(&mut ex).await.unwrap();
        assert_eq!(ex.property_str(FROM_ROUTE_ID), Some("r"));
        assert_eq!(ex.property_str(FROM_ENDPOINT), Some("direct:r"));
        assert!(ex.unit_of_work().is_none());

        route.begin_shutdown();
        let mut ex = Exchange::with_body("x");
        entry.process(&mut ex).await.unwrap();

        route.close_intake();
        let mut ex = Exchange::with_body("x");
        assert!(entry.process(&mut ex).await.is_err());
    }

    #[tokio::test]
    async fn test_unit_of_work_runs_on_completions() {
        let completed = Arc::new(AtomicBool::new(false));
        let on_completion = {
            let completed = completed.clone();
            Arc::new(OnCompletion::new(
                "r",
                OnCompletionMode::CompleteOnly,
                processor_fn(move |_| {
                    completed.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            ))
        };
        let route = Route::new(
            settings("r"),
            processor_fn(|_| Ok(())),
            Vec::new(),
            vec![on_completion],
            ShutdownSignal::new(),
        );
        route.start().await.unwrap();

        let mut ex = Exchange::with_body("x");
        route.entry().process(&mut ex).await.unwrap();
        assert!(completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_nested_entry_keeps_caller_unit_of_work() {
        let route = Route::new(
            settings("inner"),
            processor_fn(|ex| {
                ex.set_property(ERRORHANDLER_HANDLED, true);
                Ok(())
            }),
            Vec::new(),
            Vec::new(),
            ShutdownSignal::new(),
        );
        route.start().await.unwrap();

        let mut ex = Exchange::with_body("x");
        let unit_of_work = Arc::new(UnitOfWork::new(&ex));
        ex.set_unit_of_work(unit_of_work.clone());
        route.entry().process(&mut ex).await.unwrap();

        assert!(!unit_of_work.is_done());
        assert!(!ex.property_bool(ERRORHANDLER_HANDLED));
    }
}
