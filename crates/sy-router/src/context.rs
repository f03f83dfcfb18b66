//! The engine: owns routes and the shared collaborators they are built against.
//!
//! - `add_route` reifies a definition (all configuration errors surface here)
//!   and registers the route's `from` uri as an in-process endpoint
//! - `start` starts routes by startup order; `shutdown` stops them through the
//!   [`ShutdownStrategy`] and is terminal
//! - `start_route` / `stop_route` control single routes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use sy_config::EngineConfig;
use tracing::{info, warn};

use crate::definition::RouteDefinition;
use crate::endpoint::{EndpointRegistry, ProducerTemplate};
use crate::error::{ConfigError, RouterError};
use crate::errorhandler::ErrorHandlerDefinition;
use crate::executor::ExecutorRegistry;
use crate::reifier::{reify, ReifyContext};
use crate::registry::Registry;
use crate::route::{Route, RouteSettings, RouteStatus};
use crate::shutdown::{ShutdownReport, ShutdownStrategy};
use crate::signal::ShutdownSignal;
use crate::Result;

/// Startup order given to routes that do not set one: this base plus the
/// order in which they were added.
const DEFAULT_STARTUP_ORDER: u32 = 1000;

pub struct EngineContext {
    name: String,
    endpoints: Arc<EndpointRegistry>,
    registry: Registry,
    executors: ExecutorRegistry,
    signal: ShutdownSignal,
    error_handler: ErrorHandlerDefinition,
    shutdown_strategy: ShutdownStrategy,
    routes: RwLock<IndexMap<String, Arc<Route>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let name = config.name.clone().unwrap_or_else(|| "switchyard".to_string());
        let error_handler = ErrorHandlerDefinition::from_config(&config.redelivery)?;

        info!(
            name = %name,
            maximum_redeliveries = config.redelivery.maximum_redeliveries,
            shutdown_timeout_secs = config.shutdown.timeout_secs,
            "Engine context created"
        );

        Ok(Self {
            name,
            endpoints: Arc::new(EndpointRegistry::new()),
            registry: Registry::new(),
            executors: ExecutorRegistry::from_config(&config),
            signal: ShutdownSignal::new(),
            error_handler,
            shutdown_strategy: ShutdownStrategy::from_config(&config.shutdown),
            routes: RwLock::new(IndexMap::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Error handler for routes that do not configure their own.
    pub fn with_error_handler(mut self, error_handler: ErrorHandlerDefinition) -> Self {
        self.error_handler = error_handler;
        self
    }

    pub fn with_shutdown_strategy(mut self, strategy: ShutdownStrategy) -> Self {
        self.shutdown_strategy = strategy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoints(&self) -> Arc<EndpointRegistry> {
        self.endpoints.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    pub fn template(&self) -> ProducerTemplate {
        ProducerTemplate::new(self.endpoints.clone())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------------

    /// Build and register a route. Starts it right away when the context is
    /// already running and the route auto-starts.
    pub async fn add_route(&self, definition: RouteDefinition) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RouterError::ContextStopped);
        }

        let startup_order = {
            let routes = self.routes.read();
            if routes.contains_key(&definition.id) {
                return Err(ConfigError::DuplicateRoute(definition.id.clone()).into());
            }
            match definition.startup_order {
                Some(order) => {
                    if let Some(existing) = routes.values().find(|r| r.startup_order() == order) {
                        return Err(ConfigError::DuplicateStartupOrder {
                            order,
                            first: existing.id().to_string(),
                            second: definition.id.clone(),
                        }
                        .into());
                    }
                    order
                }
                None => DEFAULT_STARTUP_ORDER + routes.len() as u32,
            }
        };

        let reified = reify(
            &definition,
            ReifyContext {
                endpoints: &self.endpoints,
                registry: &self.registry,
                executors: &self.executors,
                signal: &self.signal,
                default_error_handler: &self.error_handler,
            },
        )?;

        let route = Arc::new(Route::new(
            RouteSettings {
                id: definition.id.clone(),
                from_uri: definition.from.clone(),
                startup_order,
                auto_startup: definition.auto_startup,
                shutdown_route: definition.shutdown_route,
                shutdown_running_task: definition.shutdown_running_task,
                consumer: definition.consumer.clone(),
            },
            reified.processor,
            reified.services,
            reified.on_completions,
            self.signal.clone(),
        ));

        {
            let mut routes = self.routes.write();
            if routes.contains_key(route.id()) {
                return Err(ConfigError::DuplicateRoute(definition.id).into());
            }
            routes.insert(route.id().to_string(), route.clone());
        }
        if self.endpoints.contains(route.from_uri()) {
            warn!(route_id = %route.id(), uri = %route.from_uri(), "Replacing endpoint registered under route uri");
        }
        self.endpoints.register(route.from_uri(), route.entry());
        info!(route_id = %route.id(), from = %route.from_uri(), startup_order, "Route added");

        if self.is_started() && route.auto_startup() {
            route.start().await?;
        }
        Ok(())
    }

    fn route(&self, id: &str) -> Result<Arc<Route>> {
        self.routes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RouterError::RouteNotFound(id.to_string()))
    }

    /// Routes sorted by startup order.
    fn routes_in_startup_order(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<Arc<Route>> = self.routes.read().values().cloned().collect();
        routes.sort_by_key(|route| route.startup_order());
        routes
    }

    pub fn route_ids(&self) -> Vec<String> {
        self.routes.read().keys().cloned().collect()
    }

    pub fn route_status(&self, id: &str) -> Option<RouteStatus> {
        self.routes.read().get(id).map(|route| route.status())
    }

    pub fn inflight(&self, id: &str) -> Option<usize> {
        self.routes.read().get(id).map(|route| route.inflight())
    }

    pub async fn start_route(&self, id: &str) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RouterError::ContextStopped);
        }
        self.route(id)?.start().await
    }

    /// Gracefully stop one route. The engine-wide shutdown signal is left alone.
    pub async fn stop_route(&self, id: &str) -> Result<ShutdownReport> {
        let route = self.route(id)?;
        Ok(self.shutdown_strategy.shutdown(vec![route], None, None).await)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start every auto-startup route by ascending startup order.
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RouterError::ContextStopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.signal.reset();

        let routes = self.routes_in_startup_order();
        for route in routes.iter().filter(|route| route.auto_startup()) {
            if let Err(e) = route.start().await {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        info!(name = %self.name, routes = routes.len(), "Engine context started");
        Ok(())
    }

    /// Stop every route and the executor pools. A context cannot be started
    /// again once shut down.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        info!(name = %self.name, "Engine context shutting down");
        self.signal.begin();

        let report = self
            .shutdown_strategy
            .shutdown(self.routes_in_startup_order(), Some(&self.signal), Some(&self.executors))
            .await;
        self.executors.shutdown_all(self.shutdown_strategy.timeout()).await;
        self.started.store(false, Ordering::SeqCst);

        info!(
            name = %self.name,
            routes = report.routes.len(),
            timed_out = report.timed_out,
            abandoned = report.abandoned,
            "Engine context stopped"
        );
        report
    }
}
