//! Dynamic destinations: recipient list (fan-out to a computed list) and
//! routing slip (sequential hops through a computed list).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sy_common::constants::{RECIPIENT_LIST_ENDPOINT, SLIP_ENDPOINT, SLIP_INDEX};
use sy_common::expression::value_to_string;
use sy_common::{Exchange, ExpressionRef, Result};
use tracing::debug;

use crate::endpoint::EndpointRegistry;
use crate::errorhandler::{ErrorHandlerConfig, RedeliveryErrorHandler};
use crate::multicast::{Branch, FanOut};
use crate::processor::{continue_processing, invoke, Processor, ProcessorRef};

/// Split an evaluated destination value into uris: arrays yield their
/// elements, strings are split on `delimiter`. Blank entries are dropped.
pub fn destination_uris(value: &Value, delimiter: &str) -> Vec<String> {
    let raw: Vec<String> = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().map(value_to_string).collect(),
        Value::String(s) => s.split(delimiter).map(str::to_string).collect(),
        other => vec![value_to_string(other)],
    };
    raw.into_iter()
        .map(|uri| uri.trim().to_string())
        .filter(|uri| !uri.is_empty())
        .collect()
}

/// Resolve a uri and wrap the endpoint with the route's error handler so
/// dynamic destinations are redelivered the same way static outputs are.
fn resolve_wrapped(
    endpoints: &EndpointRegistry,
    error_handler: Option<&Arc<ErrorHandlerConfig>>,
    uri: &str,
) -> Result<ProcessorRef> {
    let endpoint = endpoints.resolve(uri)?;
    Ok(match error_handler {
        Some(config) => Arc::new(RedeliveryErrorHandler::new(endpoint, config.clone())),
        None => endpoint,
    })
}

pub struct RecipientList {
    expression: ExpressionRef,
    delimiter: String,
    ignore_invalid_endpoints: bool,
    endpoints: Arc<EndpointRegistry>,
    error_handler: Option<Arc<ErrorHandlerConfig>>,
    fan_out: FanOut,
}

impl RecipientList {
    pub fn new(
        expression: ExpressionRef,
        endpoints: Arc<EndpointRegistry>,
        error_handler: Option<Arc<ErrorHandlerConfig>>,
        fan_out: FanOut,
    ) -> Self {
        Self {
            expression,
            delimiter: ",".to_string(),
            ignore_invalid_endpoints: false,
            endpoints,
            error_handler,
            fan_out,
        }
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_ignore_invalid_endpoints(mut self, ignore: bool) -> Self {
        self.ignore_invalid_endpoints = ignore;
        self
    }
}

#[async_trait]
impl Processor for RecipientList {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let value = self.expression.evaluate(exchange)?;
        let uris = destination_uris(&value, &self.delimiter);

        let mut branches = Vec::with_capacity(uris.len());
        for uri in uris {
            let processor = match resolve_wrapped(&self.endpoints, self.error_handler.as_ref(), &uri) {
                Ok(processor) => processor,
                Err(e) if self.ignore_invalid_endpoints => {
                    debug!(exchange_id = %exchange.id(), uri = %uri, error = %e, "Ignoring invalid recipient");
                    continue;
                }
                Err(e) => return Err(e),
            };
            branches.push(Branch {
                processor,
                body: None,
                properties: vec![(RECIPIENT_LIST_ENDPOINT, Value::String(uri))],
            });
        }

        self.fan_out.run(exchange, branches.into_iter().map(Ok)).await
    }
}

/// Visits the destinations its expression yields one after another. Hops
/// share the exchange the way pipeline steps do.
///
/// The expression is evaluated once and the slip ends after the last
/// destination. A dynamic slip evaluates it again each time the destinations
/// run out, so later hops can depend on what earlier hops did; it ends when
/// the expression yields nothing.
pub struct RoutingSlip {
    expression: ExpressionRef,
    delimiter: String,
    ignore_invalid_endpoints: bool,
    dynamic: bool,
    endpoints: Arc<EndpointRegistry>,
    error_handler: Option<Arc<ErrorHandlerConfig>>,
}

impl RoutingSlip {
    pub fn new(
        expression: ExpressionRef,
        endpoints: Arc<EndpointRegistry>,
        error_handler: Option<Arc<ErrorHandlerConfig>>,
    ) -> Self {
        Self {
            expression,
            delimiter: ",".to_string(),
            ignore_invalid_endpoints: false,
            dynamic: false,
            endpoints,
            error_handler,
        }
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_ignore_invalid_endpoints(mut self, ignore: bool) -> Self {
        self.ignore_invalid_endpoints = ignore;
        self
    }

    pub fn with_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    fn destinations(&self, exchange: &Exchange) -> Result<Vec<String>> {
        let value = self.expression.evaluate(exchange)?;
        Ok(destination_uris(&value, &self.delimiter))
    }
}

#[async_trait]
impl Processor for RoutingSlip {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let mut hop = 0usize;
        let mut uris = self.destinations(exchange)?;

        while !uris.is_empty() {
            for uri in uris {
                let processor = match resolve_wrapped(&self.endpoints, self.error_handler.as_ref(), &uri) {
                    Ok(processor) => processor,
                    Err(e) if self.ignore_invalid_endpoints => {
                        debug!(exchange_id = %exchange.id(), uri = %uri, error = %e, "Ignoring invalid slip endpoint");
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                if hop > 0 {
                    exchange.prepare_next();
                }
                exchange.set_property(SLIP_ENDPOINT, uri);
                exchange.set_property(SLIP_INDEX, json!(hop));
                hop += 1;

                invoke(processor.as_ref(), exchange).await;
                if !continue_processing(exchange) {
                    return Ok(());
                }
            }

            if !self.dynamic {
                break;
            }
            // cooperative point between evaluations of a long-running slip
            tokio::task::yield_now().await;
            uris = self.destinations(exchange)?;
        }
        Ok(())
    }
}
