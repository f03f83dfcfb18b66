//! doTry / doCatch / doFinally.
//!
//! The try block is not wrapped by the route's error handler: a failure goes
//! straight to the first catch clause whose kinds (and optional `on_when`)
//! match. The finally block always runs, with any still-unhandled failure
//! set aside while it does.

use async_trait::async_trait;
use sy_common::constants::EXCEPTION_CAUGHT;
use sy_common::{Exchange, ExchangeError, PredicateRef, Result};
use tracing::debug;

use crate::processor::{invoke, Processor, ProcessorRef};

pub struct CatchClause {
    pub kinds: Vec<String>,
    pub on_when: Option<PredicateRef>,
    pub processor: ProcessorRef,
}

impl CatchClause {
    fn matches(&self, error: &ExchangeError, exchange: &Exchange) -> bool {
        if !self.kinds.iter().any(|kind| error.matches_kind(kind)) {
            return false;
        }
        match &self.on_when {
            Some(predicate) => predicate.matches(exchange).unwrap_or(false),
            None => true,
        }
    }
}

pub struct DoTry {
    block: ProcessorRef,
    catches: Vec<CatchClause>,
    finally: Option<ProcessorRef>,
}

impl DoTry {
    pub fn new(block: ProcessorRef, catches: Vec<CatchClause>, finally: Option<ProcessorRef>) -> Self {
        Self { block, catches, finally }
    }
}

#[async_trait]
impl Processor for DoTry {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        invoke(self.block.as_ref(), exchange).await;

        if let Some(error) = exchange.exception().cloned() {
            let clause = self.catches.iter().position(|c| c.matches(&error, exchange));
            if let Some(index) = clause {
                debug!(exchange_id = %exchange.id(), clause = index, error = %error, "doCatch handling failure");
                exchange.clear_failure_state();
                exchange.set_property(EXCEPTION_CAUGHT, error.to_string());
                exchange.set_caught_exception(error);
                invoke(self.catches[index].processor.as_ref(), exchange).await;
            }
        }

        if let Some(finally) = &self.finally {
            let pending = exchange.take_exception();
            invoke(finally.as_ref(), exchange).await;
            if !exchange.is_failed() {
                if let Some(error) = pending {
                    exchange.set_exception(error);
                }
            }
        }
        Ok(())
    }
}
