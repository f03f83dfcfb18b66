use thiserror::Error;

/// Failure carried by an exchange.
///
/// Every variant has a stable kind name (see [`ExchangeError::kind_name`]) which
/// exception clauses, catch blocks and failover allowlists match against.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("{kind}: {message}")]
    Processing { kind: String, message: String },

    #[error("Fault: {0}")]
    Fault(String),

    #[error("Rollback: {0}")]
    Rollback(String),

    #[error("Redelivery rejected: {0}")]
    RedeliveryRejected(String),

    #[error("Failed to resolve endpoint: {uri} due to: {reason}")]
    ResolveEndpointFailed { uri: String, reason: String },

    #[error("Expression evaluation failed: {0}")]
    Expression(String),

    #[error("Aggregation failed: {0}")]
    Aggregation(String),

    #[error("Rejected execution: {0}")]
    Rejected(String),

    #[error("Execution failed for exchange {exchange_id}: {cause}")]
    ExecutionFailed {
        exchange_id: String,
        cause: Box<ExchangeError>,
    },
}

pub type Result<T> = std::result::Result<T, ExchangeError>;

impl ExchangeError {
    pub fn processing(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Processing {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn expression(message: impl Into<String>) -> Self {
        Self::Expression(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn resolve_endpoint(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResolveEndpointFailed {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Wrap in the envelope handed to synchronous callers. Never nests.
    pub fn execution_failed(exchange_id: impl Into<String>, cause: ExchangeError) -> Self {
        match cause {
            wrapped @ Self::ExecutionFailed { .. } => wrapped,
            cause => Self::ExecutionFailed {
                exchange_id: exchange_id.into(),
                cause: Box::new(cause),
            },
        }
    }

    pub fn kind_name(&self) -> &str {
        match self {
            Self::Processing { kind, .. } => kind,
            Self::Fault(_) => "Fault",
            Self::Rollback(_) => "Rollback",
            Self::RedeliveryRejected(_) => "RedeliveryRejected",
            Self::ResolveEndpointFailed { .. } => "ResolveEndpointFailed",
            Self::Expression(_) => "ExpressionEvaluation",
            Self::Aggregation(_) => "Aggregation",
            Self::Rejected(_) => "RejectedExecution",
            Self::ExecutionFailed { .. } => "ExecutionFailed",
        }
    }

    pub fn cause(&self) -> Option<&ExchangeError> {
        match self {
            Self::ExecutionFailed { cause, .. } => Some(cause),
            _ => None,
        }
    }

    pub fn root_cause(&self) -> &ExchangeError {
        let mut current = self;
        while let Some(next) = current.cause() {
            current = next;
        }
        current
    }

    /// True when this error or any error in its cause chain has the given kind.
    /// `"*"` matches everything.
    pub fn matches_kind(&self, kind: &str) -> bool {
        if kind == "*" {
            return true;
        }
        let mut current = Some(self);
        while let Some(err) = current {
            if err.kind_name() == kind {
                return true;
            }
            current = err.cause();
        }
        false
    }

    /// Rollbacks, rejected redeliveries and unresolvable endpoints are surfaced
    /// as-is and never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.root_cause(),
            Self::Rollback(_) | Self::RedeliveryRejected(_) | Self::ResolveEndpointFailed { .. }
        )
    }
}
