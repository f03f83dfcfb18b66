//! Idempotent consumer backed by the file repository, across engine restarts.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{init_tracing, MockEndpoint};
use sy_common::expression::header;
use sy_common::json;
use sy_config::EngineConfig;
use sy_idempotent::{FileIdempotentRepository, IdempotentRepository};
use sy_router::{BeanRef, EngineContext, IdempotentConsumerDefinition, Node, RouteDefinition};

async fn engine(store: &Path) -> (EngineContext, Arc<MockEndpoint>, Arc<dyn IdempotentRepository>) {
    init_tracing();
    let context = EngineContext::new(EngineConfig::default()).unwrap();
    let out = MockEndpoint::register(&context, "mock:out");
    let repository: Arc<dyn IdempotentRepository> = Arc::new(FileIdempotentRepository::open(store).await.unwrap());

    context
        .add_route(RouteDefinition::new("orders", "direct:orders").node(Node::IdempotentConsumer(
            IdempotentConsumerDefinition::new(
                header("orderId"),
                BeanRef::Instance(repository.clone()),
                vec![Node::to("mock:out")],
            ),
        )))
        .await
        .unwrap();
    context.start().await.unwrap();
    (context, out, repository)
}

async fn send(context: &EngineContext, order_id: &str) {
    let mut exchange = sy_common::Exchange::with_body(json!({ "order": order_id }));
    exchange.set_header("orderId", order_id);
    let exchange = context.template().send("direct:orders", exchange).await;
    assert!(!exchange.is_failed());
}

#[tokio::test]
async fn test_seen_keys_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("state").join("orders.dat");

    let (context, out, _) = engine(&store).await;
    send(&context, "X").await;
    send(&context, "Y").await;
    send(&context, "X").await;
    assert_eq!(out.count(), 2);
    context.shutdown().await;

    let (context, out, repository) = engine(&store).await;
    send(&context, "X").await;
    assert_eq!(out.count(), 0);

    assert!(repository.remove("X").await.unwrap());
    send(&context, "X").await;
    assert_eq!(out.count(), 1);
    context.shutdown().await;

    let content = std::fs::read_to_string(&store).unwrap();
    let keys: Vec<&str> = content.lines().collect();
    assert_eq!(keys, vec!["Y", "X"]);
}
