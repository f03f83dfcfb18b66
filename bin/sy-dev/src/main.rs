//! Switchyard Development Runner
//!
//! Runs a small order-processing integration in one process:
//! - A generator consumer feeding sample orders into the intake route
//! - Duplicate detection, content-based routing and a wire-tapped audit trail
//! - Failover between two flaky express carriers
//! - Item splitting and per-customer batching for standard orders
//! - Prometheus metrics endpoint and graceful shutdown on Ctrl+C

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use sy_common::expression::{expression_fn, predicate_fn};
use sy_common::{Exchange, ExchangeError};
use sy_config::EngineConfig;
use sy_idempotent::{FileIdempotentRepository, IdempotentRepository, MemoryIdempotentRepository};
use sy_router::{
    processor_fn, AggregateDefinition, BeanRef, ChoiceDefinition, Consumer, ConsumerContext, EngineContext,
    ErrorHandlerDefinition, ExpressionSplit, FailoverConfig, GroupedBodyAggregationStrategy,
    IdempotentConsumerDefinition, JsonDataFormat, LoadBalanceDefinition, Node, ProcessorRef, RouteDefinition,
    RouterError, ShutdownRoute, ShutdownRunningTask, SplitDefinition, WireTapDefinition,
};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Switchyard Development Runner
#[derive(Parser, Debug)]
#[command(name = "sy-dev")]
#[command(about = "Switchyard development runner - sample routes with graceful shutdown")]
struct Args {
    /// Engine configuration file (TOML). Defaults plus environment when absent.
    #[arg(long, env = "SWITCHYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Metrics server port
    #[arg(long, env = "SWITCHYARD_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Emit logs as JSON
    #[arg(long, env = "SWITCHYARD_JSON_LOGS", default_value = "false")]
    json_logs: bool,

    /// Number of sample orders to generate
    #[arg(long, env = "SWITCHYARD_SAMPLE_ORDERS", default_value = "50")]
    orders: usize,

    /// Interval between sample orders in milliseconds
    #[arg(long, env = "SWITCHYARD_SAMPLE_INTERVAL_MS", default_value = "200")]
    interval_ms: u64,

    /// File backing the duplicate detection store. In-memory when absent.
    #[arg(long, env = "SWITCHYARD_IDEMPOTENT_STORE")]
    idempotent_store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    info!("Starting Switchyard Dev Runner");

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
    PrometheusBuilder::new().with_http_listener(metrics_addr).install()?;
    info!("Metrics endpoint listening on {}", metrics_addr);

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };
    let max_cache_size = config.idempotent.max_cache_size;
    let context = EngineContext::new(config)?;

    context
        .registry()
        .bind_data_format_factory("json", Arc::new(JsonDataFormat::default()));
    context.registry().bind_idempotent_repository(
        "orders",
        idempotent_repository(args.idempotent_store.as_ref(), max_cache_size).await?,
    );
    for name in ["express-audit", "items", "batches", "audit", "dead-letter"] {
        context
            .endpoints()
            .register(format!("log:{}", name), log_endpoint(name));
    }
    context.endpoints().register("carrier:primary", flaky_carrier("primary", 3));
    context.endpoints().register("carrier:backup", flaky_carrier("backup", 0));

    let generator = Arc::new(OrderGenerator::new(args.orders, Duration::from_millis(args.interval_ms)));
    add_routes(&context, generator.clone()).await?;
    context.start().await?;

    info!(routes = ?context.route_ids(), "Switchyard Dev Runner started successfully");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    let report = context.shutdown().await;
    info!(
        generated = generator.generated(),
        routes = ?report.routes,
        timed_out = report.timed_out,
        abandoned = report.abandoned,
        "Switchyard Dev Runner shutdown complete"
    );
    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn idempotent_repository(
    store: Option<&PathBuf>,
    max_cache_size: usize,
) -> Result<Arc<dyn IdempotentRepository>> {
    Ok(match store {
        Some(path) => {
            info!(path = %path.display(), "Using file idempotent repository");
            Arc::new(FileIdempotentRepository::open_with_capacity(path, max_cache_size).await?)
        }
        None => Arc::new(MemoryIdempotentRepository::new(max_cache_size)),
    })
}

async fn add_routes(context: &EngineContext, generator: Arc<OrderGenerator>) -> std::result::Result<(), RouterError> {
    let order_id = expression_fn(|ex| Ok(ex.body().get("id").cloned().unwrap_or(Value::Null)));
    let customer = expression_fn(|ex| Ok(ex.body().get("customer").cloned().unwrap_or(Value::Null)));
    let items = expression_fn(|ex| Ok(ex.body().get("items").cloned().unwrap_or(Value::Null)));
    let is_express = predicate_fn(|ex| Ok(ex.body().get("priority") == Some(&json!("express"))));

    context
        .add_route(
            RouteDefinition::new("order-intake", "seda:orders")
                .with_startup_order(10)
                .with_consumer(generator)
                .with_shutdown_running_task(ShutdownRunningTask::CompleteAllTasks)
                .with_error_handler(
                    ErrorHandlerDefinition::dead_letter_channel("log:dead-letter")
                        .maximum_redeliveries(2)
                        .redelivery_delay(Duration::from_millis(100)),
                )
                .node(Node::IdempotentConsumer(IdempotentConsumerDefinition::new(
                    order_id,
                    BeanRef::named("orders"),
                    vec![
                        Node::WireTap(WireTapDefinition::new("direct:audit")),
                        Node::Choice(
                            ChoiceDefinition::new()
                                .when(is_express, vec![Node::to("direct:express")])
                                .otherwise(vec![Node::to("direct:standard")]),
                        ),
                    ],
                ))),
        )
        .await?;

    context
        .add_route(
            RouteDefinition::new("express-orders", "direct:express")
                .with_startup_order(20)
                .node(Node::LoadBalance(
                    LoadBalanceDefinition::new()
                        .failover(FailoverConfig::default().with_exceptions(["ConnectException"]))
                        .to("carrier:primary")
                        .to("carrier:backup"),
                ))
                .to("log:express-audit"),
        )
        .await?;

    context
        .add_route(
            RouteDefinition::new("standard-orders", "direct:standard")
                .with_startup_order(30)
                .node(Node::Split(SplitDefinition::new(
                    Arc::new(ExpressionSplit::new(items)),
                    vec![Node::to("log:items")],
                )))
                .node(Node::Aggregate(
                    AggregateDefinition::new(customer, vec![Node::to("log:batches")])
                        .with_strategy(Arc::new(GroupedBodyAggregationStrategy))
                        .completion_size(3)
                        .completion_timeout(Duration::from_secs(2))
                        .force_completion_on_stop(),
                )),
        )
        .await?;

    context
        .add_route(
            RouteDefinition::new("audit", "direct:audit")
                .with_startup_order(40)
                .with_shutdown_route(ShutdownRoute::Defer)
                .node(Node::Marshal("json".into()))
                .to("log:audit"),
        )
        .await?;

    Ok(())
}

fn log_endpoint(name: &'static str) -> ProcessorRef {
    processor_fn(move |ex| {
        info!(endpoint = name, exchange_id = %ex.id(), body = %ex.body(), "Exchange received");
        Ok(())
    })
}

/// Fails every `every`-th call with a connection error; never when `every` is 0.
fn flaky_carrier(name: &'static str, every: usize) -> ProcessorRef {
    let calls = AtomicUsize::new(0);
    processor_fn(move |ex| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if every > 0 && call % every == 0 {
            warn!(carrier = name, exchange_id = %ex.id(), "Carrier unavailable");
            return Err(ExchangeError::processing("ConnectException", format!("{} carrier unavailable", name)));
        }
        ex.set_header("carrier", name);
        Ok(())
    })
}

// ============================================================================
// Sample order consumer
// ============================================================================

/// Emits a fixed number of sample orders at a steady pace. Every seventh order
/// repeats the previous id so duplicate detection has something to do.
struct OrderGenerator {
    total: usize,
    interval: Duration,
    generated: Arc<AtomicUsize>,
    stop_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl OrderGenerator {
    fn new(total: usize, interval: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            total,
            interval,
            generated: Arc::new(AtomicUsize::new(0)),
            stop_tx,
            task: parking_lot::Mutex::new(None),
        }
    }

    fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    fn order(n: usize) -> Value {
        let id = if n % 7 == 0 && n > 0 { n - 1 } else { n };
        let priority = if n % 4 == 0 { "express" } else { "standard" };
        let items: Vec<String> = (0..(n % 3 + 1)).map(|i| format!("SKU-{}", 100 + i)).collect();
        json!({
            "id": format!("ORD-{:05}", id),
            "customer": format!("C{}", n % 3),
            "priority": priority,
            "items": items,
        })
    }
}

#[async_trait]
impl Consumer for OrderGenerator {
    async fn start(&self, context: ConsumerContext) -> std::result::Result<(), RouterError> {
        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let generated = self.generated.clone();
        let total = self.total;
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while generated.load(Ordering::SeqCst) < total {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                let n = generated.fetch_add(1, Ordering::SeqCst);
                let mut exchange = Exchange::with_body(Self::order(n));
                if let Err(e) = context.processor.process(&mut exchange).await {
                    context
                        .exception_handler
                        .handle_exception("Error processing exchange", Some(&exchange), &e);
                }
            }
            info!(route_id = %context.route_id, generated = generated.load(Ordering::SeqCst), "Order generator finished");
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Order generator task failed: {}", e);
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
