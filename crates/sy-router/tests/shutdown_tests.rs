//! Graceful shutdown tests with consumer-fed routes.

mod common;

use std::time::{Duration, Instant};

use common::{init_tracing, BacklogConsumer, MockEndpoint};
use sy_config::EngineConfig;
use sy_router::{
    EngineContext, RouteDefinition, RouteStatus, ShutdownRoute, ShutdownRunningTask, ShutdownStrategy,
};

fn context() -> EngineContext {
    init_tracing();
    EngineContext::new(EngineConfig::default()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_complete_all_tasks_drains_backlog() {
    let context = context();
    let out = MockEndpoint::register(&context, "mock:out");
    out.set_delay(Duration::from_millis(20));
    let consumer = BacklogConsumer::new(1..=5);

    context
        .add_route(
            RouteDefinition::new("drain", "seda:orders")
                .with_consumer(consumer.clone())
                .with_shutdown_running_task(ShutdownRunningTask::CompleteAllTasks)
                .to("mock:out"),
        )
        .await
        .unwrap();
    context.start().await.unwrap();

    let report = context.shutdown().await;

    assert!(!report.timed_out);
    assert_eq!(report.abandoned, 0);
    assert_eq!(out.count(), 5);
    assert_eq!(consumer.processed(), 5);
    assert_eq!(context.route_status("drain"), Some(RouteStatus::Stopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_complete_current_task_only_drops_backlog() {
    let context = context();
    let out = MockEndpoint::register(&context, "mock:out");
    out.set_delay(Duration::from_millis(50));
    let consumer = BacklogConsumer::new(1..=10);

    context
        .add_route(
            RouteDefinition::new("current", "seda:orders")
                .with_consumer(consumer.clone())
                .to("mock:out"),
        )
        .await
        .unwrap();
    context.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = context.shutdown().await;

    assert!(!report.timed_out);
    let delivered = out.count();
    assert!((1..10).contains(&delivered), "delivered {}", delivered);
    assert_eq!(consumer.processed(), delivered);

    // intake is closed for good
    let ex = context.template().send_body("seda:orders", "late").await;
    assert_eq!(ex.exception().map(|e| e.kind_name()), Some("RejectedExecution"));
    assert_eq!(out.count(), delivered);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deferred_route_outlives_its_callers() {
    let context = context();
    let out = MockEndpoint::register(&context, "mock:out");
    out.set_delay(Duration::from_millis(10));
    let consumer = BacklogConsumer::new(["a", "b", "c"]);

    context
        .add_route(
            RouteDefinition::new("producer", "seda:input")
                .with_startup_order(1)
                .with_consumer(consumer.clone())
                .with_shutdown_running_task(ShutdownRunningTask::CompleteAllTasks)
                .to("direct:worker"),
        )
        .await
        .unwrap();
    context
        .add_route(
            RouteDefinition::new("worker", "direct:worker")
                .with_startup_order(2)
                .with_shutdown_route(ShutdownRoute::Defer)
                .to("mock:out"),
        )
        .await
        .unwrap();
    context.start().await.unwrap();

    let report = context.shutdown().await;

    assert_eq!(report.routes, vec!["producer".to_string(), "worker".to_string()]);
    assert_eq!(out.count(), 3);
    assert!(!report.timed_out);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_forces_stop() {
    let context =
        context().with_shutdown_strategy(ShutdownStrategy::default().with_timeout(Duration::from_millis(300)));
    let out = MockEndpoint::register(&context, "mock:out");
    out.set_delay(Duration::from_secs(30));
    let consumer = BacklogConsumer::new(1..=3);

    context
        .add_route(
            RouteDefinition::new("stuck", "seda:orders")
                .with_consumer(consumer.clone())
                .with_shutdown_running_task(ShutdownRunningTask::CompleteAllTasks)
                .to("mock:out"),
        )
        .await
        .unwrap();
    context.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let report = context.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(report.timed_out);
    // the exchange in progress plus the two still queued
    assert_eq!(report.abandoned, 3);
    assert!(context.signal().is_forced());
    assert_eq!(context.route_status("stuck"), Some(RouteStatus::Stopped));
    assert_eq!(out.count(), 0);
}

#[tokio::test]
async fn test_stop_route_leaves_others_running() {
    let context = context();
    let out = MockEndpoint::register(&context, "mock:out");

    for id in ["a", "b"] {
        context
            .add_route(RouteDefinition::new(id, format!("direct:{}", id)).to("mock:out"))
            .await
            .unwrap();
    }
    context.start().await.unwrap();

    context.stop_route("a").await.unwrap();
    let template = context.template();
    let rejected = template.send_body("direct:a", 1).await;
    let accepted = template.send_body("direct:b", 2).await;

    assert_eq!(rejected.exception().map(|e| e.kind_name()), Some("RejectedExecution"));
    assert!(!accepted.is_failed());
    assert_eq!(out.count(), 1);

    context.start_route("a").await.unwrap();
    assert!(!template.send_body("direct:a", 3).await.is_failed());
    assert_eq!(out.count(), 2);

    context.shutdown().await;
}
