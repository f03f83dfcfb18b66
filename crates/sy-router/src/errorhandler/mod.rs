//! Redelivery error handling.
//!
//! - `RedeliveryPolicy`: attempt limits and delay calculation
//! - `ExceptionPolicy`: per-failure-kind clauses (`onException`)
//! - `RedeliveryErrorHandler`: wraps a processor, retries it and routes
//!   exhausted exchanges to a recovery processor or dead letter endpoint

pub mod exception_policy;
pub mod handler;
pub mod redelivery;

use std::time::Duration;

use sy_config::RedeliveryConfig;

pub use exception_policy::ExceptionPolicy;
pub use handler::{ErrorHandlerConfig, RedeliveryErrorHandler};
pub use redelivery::{DelayPattern, RedeliveryPolicy};

use crate::error::ConfigError;
use crate::processor::ProcessorRef;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorHandlerKind {
    /// Retry, then leave the failure on the exchange.
    Default,
    /// Retry, then hand the exchange to the endpoint with this uri.
    DeadLetterChannel(String),
    /// Outputs are not wrapped at all.
    NoErrorHandler,
}

/// Route-level error handler settings, reified into an [`ErrorHandlerConfig`].
#[derive(Clone)]
pub struct ErrorHandlerDefinition {
    pub kind: ErrorHandlerKind,
    pub redelivery: RedeliveryPolicy,
    pub use_original_message: bool,
    pub dead_letter_handle_new_exception: bool,
    pub on_redelivery: Option<ProcessorRef>,
    pub allow_redelivery_while_stopping: bool,
    pub handle_fault: bool,
}

impl ErrorHandlerDefinition {
    fn with_kind(kind: ErrorHandlerKind) -> Self {
        Self {
            kind,
            redelivery: RedeliveryPolicy::default(),
            use_original_message: false,
            dead_letter_handle_new_exception: true,
            on_redelivery: None,
            allow_redelivery_while_stopping: true,
            handle_fault: false,
        }
    }

    pub fn default_error_handler() -> Self {
        Self::with_kind(ErrorHandlerKind::Default)
    }

    pub fn dead_letter_channel(uri: impl Into<String>) -> Self {
        Self::with_kind(ErrorHandlerKind::DeadLetterChannel(uri.into()))
    }

    pub fn no_error_handler() -> Self {
        Self::with_kind(ErrorHandlerKind::NoErrorHandler)
    }

    /// A default error handler carrying the configured redelivery settings.
    pub fn from_config(config: &RedeliveryConfig) -> Result<Self, ConfigError> {
        let mut definition = Self::default_error_handler();
        definition.redelivery = RedeliveryPolicy::from_config(config)?;
        definition.use_original_message = config.use_original_message;
        definition.dead_letter_handle_new_exception = config.dead_letter_handle_new_exception;
        definition.allow_redelivery_while_stopping = config.allow_redelivery_while_stopping;
        Ok(definition)
    }

    pub fn redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    pub fn maximum_redeliveries(mut self, maximum: i32) -> Self {
        self.redelivery.maximum_redeliveries = maximum;
        self
    }

    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery.redelivery_delay = delay;
        self
    }

    pub fn use_original_message(mut self) -> Self {
        self.use_original_message = true;
        self
    }

    pub fn dead_letter_handle_new_exception(mut self, handle: bool) -> Self {
        self.dead_letter_handle_new_exception = handle;
        self
    }

    pub fn on_redelivery(mut self, processor: ProcessorRef) -> Self {
        self.on_redelivery = Some(processor);
        self
    }

    pub fn allow_redelivery_while_stopping(mut self, allow: bool) -> Self {
        self.allow_redelivery_while_stopping = allow;
        self
    }

    pub fn handle_fault(mut self, handle: bool) -> Self {
        self.handle_fault = handle;
        self
    }
}

impl Default for ErrorHandlerDefinition {
    fn default() -> Self {
        Self::default_error_handler()
    }
}
