//! Endpoint resolution and the producer side of the engine.
//!
//! Endpoints are processors registered under a uri. Every route registers its
//! `from` uri here so routes can call each other in-process; applications
//! register their own producers (mocks, adapters) the same way. Resolution is
//! lazy: an unknown uri fails the exchange with `ResolveEndpointFailed` at the
//! moment it is first used.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sy_common::constants::TO_ENDPOINT;
use sy_common::{Exchange, ExchangeError, ExchangePattern, Message, Result, Value};
use tracing::debug;

use crate::processor::{invoke, Processor, ProcessorRef};

#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<String, ProcessorRef>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uri: impl Into<String>, processor: ProcessorRef) {
        let uri = uri.into();
        debug!(uri = %uri, "Registered endpoint");
        self.endpoints.insert(uri, processor);
    }

    pub fn unregister(&self, uri: &str) -> bool {
        self.endpoints.remove(uri).is_some()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.endpoints.contains_key(uri)
    }

    pub fn uris(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.key().clone()).collect()
    }

    pub fn resolve(&self, uri: &str) -> Result<ProcessorRef> {
        self.endpoints
            .get(uri)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ExchangeError::resolve_endpoint(uri, "No endpoint registered for uri"))
    }
}

/// Sends the exchange to a fixed endpoint uri, resolved on each call.
pub struct SendProcessor {
    uri: String,
    endpoints: Arc<EndpointRegistry>,
}

impl SendProcessor {
    pub fn new(uri: impl Into<String>, endpoints: Arc<EndpointRegistry>) -> Self {
        Self {
            uri: uri.into(),
            endpoints,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl Processor for SendProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let target = self.endpoints.resolve(&self.uri)?;
        exchange.set_property(TO_ENDPOINT, self.uri.clone());
        invoke(target.as_ref(), exchange).await;
        Ok(())
    }
}

/// Entry point for code outside the engine that wants to push exchanges
/// into an endpoint.
#[derive(Clone)]
pub struct ProducerTemplate {
    endpoints: Arc<EndpointRegistry>,
}

impl ProducerTemplate {
    pub fn new(endpoints: Arc<EndpointRegistry>) -> Self {
        Self { endpoints }
    }

    /// Send an exchange and return it with whatever outcome it reached.
    pub async fn send(&self, uri: &str, mut exchange: Exchange) -> Exchange {
        match self.endpoints.resolve(uri) {
            Ok(target) => invoke(target.as_ref(), &mut exchange).await,
            Err(e) => exchange.set_exception(e),
        }
        exchange
    }

    pub async fn send_body(&self, uri: &str, body: impl Into<Value>) -> Exchange {
        self.send(uri, Exchange::with_body(body)).await
    }

    pub async fn send_body_and_headers(
        &self,
        uri: &str,
        body: impl Into<Value>,
        headers: HashMap<String, Value>,
    ) -> Exchange {
        let mut message = Message::new(body);
        message.headers = headers;
        self.send(uri, Exchange::new(message)).await
    }

    /// Request/reply. Failures come back wrapped once in `ExecutionFailed`;
    /// an unknown uri is reported as is.
    pub async fn request(&self, uri: &str, exchange: Exchange) -> Result<Exchange> {
        let target = self.endpoints.resolve(uri)?;
        let mut exchange = exchange.with_pattern(ExchangePattern::InOut);
        invoke(target.as_ref(), &mut exchange).await;
        match exchange.take_exception() {
            Some(error) => Err(ExchangeError::execution_failed(exchange.id(), error)),
            None => Ok(exchange),
        }
    }

    pub async fn request_body(&self, uri: &str, body: impl Into<Value>) -> Result<Value> {
        let exchange = self.request(uri, Exchange::with_body(body)).await?;
        Ok(exchange.body().clone())
    }
}
