//! Processor capability and the small message-manipulation processors.
//!
//! A processor reports failure by returning `Err`. Callers that compose
//! processors go through [`invoke`], which folds the error into the exchange so
//! the rest of the engine only ever inspects `exchange.exception()`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sy_common::constants::{ERRORHANDLER_HANDLED, ROUTE_STOP};
use sy_common::{Exchange, ExchangeError, ExpressionRef, Message, Result};

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<()>;
}

pub type ProcessorRef = Arc<dyn Processor>;

/// Run a processor and attach any returned error to the exchange.
pub async fn invoke(processor: &dyn Processor, exchange: &mut Exchange) {
    if let Err(error) = processor.process(exchange).await {
        exchange.set_exception(error);
    }
}

/// Whether a pipeline may hand the exchange to its next step.
pub fn continue_processing(exchange: &Exchange) -> bool {
    !(exchange.is_failed()
        || exchange.message().is_fault()
        || exchange.property_bool(ROUTE_STOP)
        || exchange.property_bool(ERRORHANDLER_HANDLED))
}

// ============================================================================
// Closures
// ============================================================================

struct FnProcessor<F>(F);

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<()> + Send + Sync,
{
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        (self.0)(exchange)
    }
}

/// Wrap a synchronous closure as a processor.
pub fn processor_fn<F>(f: F) -> ProcessorRef
where
    F: Fn(&mut Exchange) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnProcessor(f))
}

// ============================================================================
// Message manipulation
// ============================================================================

pub struct SetBody {
    expression: ExpressionRef,
}

impl SetBody {
    pub fn new(expression: ExpressionRef) -> Self {
        Self { expression }
    }
}

#[async_trait]
impl Processor for SetBody {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let body = self.expression.evaluate(exchange)?;
        exchange.set_body(body);
        Ok(())
    }
}

/// Produces an out message carrying the evaluated body and the current headers.
pub struct Transform {
    expression: ExpressionRef,
}

impl Transform {
    pub fn new(expression: ExpressionRef) -> Self {
        Self { expression }
    }
}

#[async_trait]
impl Processor for Transform {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let body = self.expression.evaluate(exchange)?;
        let mut out = Message::new(body);
        out.headers = exchange.message().headers.clone();
        exchange.set_out(out);
        Ok(())
    }
}

pub struct SetHeader {
    name: String,
    expression: ExpressionRef,
}

impl SetHeader {
    pub fn new(name: impl Into<String>, expression: ExpressionRef) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

#[async_trait]
impl Processor for SetHeader {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let value = self.expression.evaluate(exchange)?;
        exchange.set_header(self.name.clone(), value);
        Ok(())
    }
}

pub struct SetProperty {
    name: String,
    expression: ExpressionRef,
}

impl SetProperty {
    pub fn new(name: impl Into<String>, expression: ExpressionRef) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

#[async_trait]
impl Processor for SetProperty {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let value = self.expression.evaluate(exchange)?;
        exchange.set_property(self.name.clone(), value);
        Ok(())
    }
}

pub struct RemoveHeader {
    name: String,
}

impl RemoveHeader {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Processor for RemoveHeader {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        exchange.message_mut().remove_header(&self.name);
        Ok(())
    }
}

// ============================================================================
// Flow control
// ============================================================================

/// Fails the exchange with a rollback; the error handler never redelivers it.
pub struct RollbackProcessor {
    message: String,
}

impl RollbackProcessor {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[async_trait]
impl Processor for RollbackProcessor {
    async fn process(&self, _exchange: &mut Exchange) -> Result<()> {
        Err(ExchangeError::Rollback(self.message.clone()))
    }
}

/// Marks the exchange so no further node processes it.
pub struct StopProcessor;

#[async_trait]
impl Processor for StopProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        exchange.set_property(ROUTE_STOP, true);
        Ok(())
    }
}

/// Records a message history entry around the wrapped node.
pub struct Traced {
    route_id: Arc<str>,
    node_id: String,
    label: String,
    inner: ProcessorRef,
}

impl Traced {
    pub fn new(route_id: Arc<str>, node_id: String, label: String, inner: ProcessorRef) -> Self {
        Self {
            route_id,
            node_id,
            label,
            inner,
        }
    }
}

#[async_trait]
impl Processor for Traced {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let started = Instant::now();
        let index = exchange
            .history_mut()
            .begin(Some(&*self.route_id), self.node_id.clone(), self.label.clone());
        let result = self.inner.process(exchange).await;
        exchange
            .history_mut()
            .complete(index, started.elapsed().as_millis() as u64);
        result
    }
}
