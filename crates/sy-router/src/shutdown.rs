//! Graceful shutdown coordinator.
//!
//! Routes stop one at a time in reverse startup order, deferred routes last.
//! Each route drains according to its [`ShutdownRunningTask`]; the whole
//! graceful phase runs under one timeout. When it expires the stop is forced:
//! the shutdown signal is raised as forced, components are told to abandon
//! their work and (when configured) executor pools cancel running tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sy_config::ShutdownConfig;
use tracing::{info, warn};

use crate::executor::ExecutorRegistry;
use crate::route::{Route, RouteStatus};
use crate::service::{ShutdownRoute, ShutdownRunningTask};
use crate::signal::ShutdownSignal;

const POLL: Duration = Duration::from_millis(10);

/// What happened during a shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Route ids in the order they were stopped.
    pub routes: Vec<String>,
    pub timed_out: bool,
    /// In-flight and pending exchanges left behind by a forced stop.
    pub abandoned: usize,
}

#[derive(Debug, Clone)]
pub struct ShutdownStrategy {
    timeout: Duration,
    shutdown_now_on_timeout: bool,
    reverse_order: bool,
    log_interval: Duration,
}

impl Default for ShutdownStrategy {
    fn default() -> Self {
        Self::from_config(&ShutdownConfig::default())
    }
}

impl ShutdownStrategy {
    pub fn from_config(config: &ShutdownConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            shutdown_now_on_timeout: config.shutdown_now_on_timeout,
            reverse_order: config.shutdown_routes_in_reverse_order,
            log_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stop order for routes given in startup order.
    fn order(&self, mut routes: Vec<Arc<Route>>) -> Vec<Arc<Route>> {
        if self.reverse_order {
            routes.reverse();
        }
        let (deferred, regular): (Vec<_>, Vec<_>) = routes
            .into_iter()
            .partition(|route| route.shutdown_route() == ShutdownRoute::Defer);
        regular.into_iter().chain(deferred).collect()
    }

    /// Stop `routes` (in startup order). `signal` and `executors` are only
    /// forced on timeout when given; stopping a single route passes neither.
    pub async fn shutdown(
        &self,
        routes: Vec<Arc<Route>>,
        signal: Option<&ShutdownSignal>,
        executors: Option<&ExecutorRegistry>,
    ) -> ShutdownReport {
        let routes: Vec<Arc<Route>> = self
            .order(routes)
            .into_iter()
            .filter(|route| route.status() != RouteStatus::Stopped)
            .collect();
        let started = Instant::now();
        info!(
            routes = routes.len(),
            timeout_secs = self.timeout.as_secs(),
            "Starting graceful shutdown of routes"
        );

        let mut report = ShutdownReport::default();
        let graceful = self.stop_all(&routes, &mut report.routes);
        let outcome = tokio::time::timeout(self.timeout, graceful).await;

        if outcome.is_err() {
            report.timed_out = true;
            warn!(
                timeout_secs = self.timeout.as_secs(),
                stopped = report.routes.len(),
                "Timeout occurred during graceful shutdown. Forcing the remaining routes to stop"
            );
            if let Some(signal) = signal {
                signal.force();
            }

            for route in &routes {
                if route.status() == RouteStatus::Stopped {
                    continue;
                }
                let abandoned = route.inflight() + route.pending_exchanges();
                if abandoned > 0 {
                    warn!(route_id = %route.id(), abandoned, "Abandoning exchanges on forced shutdown");
                }
                report.abandoned += abandoned;

                route.close_intake();
                route.prepare_shutdown(route.shutdown_running_task(), true).await;
                route.stop_consumer().await;
                route.stop_services().await;
                route.mark_stopped();
                report.routes.push(route.id().to_string());
            }

            if self.shutdown_now_on_timeout {
                if let Some(executors) = executors {
                    let cancelled = executors.shutdown_all_now();
                    if cancelled > 0 {
                        warn!(cancelled, "Cancelled running executor tasks");
                    }
                }
            }
        }

        info!(
            routes = report.routes.len(),
            timed_out = report.timed_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Graceful shutdown of routes completed"
        );
        report
    }

    async fn stop_all(&self, routes: &[Arc<Route>], stopped: &mut Vec<String>) {
        for route in routes {
            self.stop_route(route).await;
            stopped.push(route.id().to_string());
        }
    }

    async fn stop_route(&self, route: &Route) {
        let task = route.shutdown_running_task();
        route.begin_shutdown();

        match task {
            ShutdownRunningTask::CompleteAllTasks => {
                self.wait_for(route, "backlog", || route.backlog() == 0 && route.inflight() == 0)
                    .await;
                route.prepare_shutdown(task, false).await;
                route.stop_consumer().await;
                route.close_intake();
            }
            ShutdownRunningTask::CompleteCurrentTaskOnly => {
                route.prepare_shutdown(task, false).await;
                route.stop_consumer().await;
                route.close_intake();
            }
        }

        self.wait_for(route, "in-flight exchanges", || route.inflight() == 0).await;
        route.stop_services().await;
        route.mark_stopped();
    }

    async fn wait_for(&self, route: &Route, what: &str, done: impl Fn() -> bool) {
        let mut last_log = Instant::now();
        while !done() {
            if last_log.elapsed() >= self.log_interval {
                info!(
                    route_id = %route.id(),
                    inflight = route.inflight(),
                    pending = route.pending_exchanges(),
                    "Waiting for {} to complete",
                    what
                );
                last_log = Instant::now();
            }
            tokio::time::sleep(POLL).await;
        }
    }
}
