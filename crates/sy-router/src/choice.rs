//! Content-based routing: `Choice` (first matching branch) and `Filter`.

use async_trait::async_trait;
use serde_json::json;
use sy_common::constants::{CHOICE_BRANCH, CHOICE_MATCHED, FILTER_MATCHED};
use sy_common::{Exchange, PredicateRef, Result};
use tracing::trace;

use crate::processor::{invoke, Processor, ProcessorRef};

pub struct WhenClause {
    pub predicate: PredicateRef,
    pub processor: ProcessorRef,
}

/// Evaluates `when` predicates in declaration order and routes to the first
/// match only, else to `otherwise`, else passes the exchange through untouched.
/// A predicate that fails to evaluate fails the choice node itself.
pub struct Choice {
    whens: Vec<WhenClause>,
    otherwise: Option<ProcessorRef>,
}

impl Choice {
    pub fn new(whens: Vec<WhenClause>, otherwise: Option<ProcessorRef>) -> Self {
        Self { whens, otherwise }
    }
}

#[async_trait]
impl Processor for Choice {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        for (index, when) in self.whens.iter().enumerate() {
            let matched = when.predicate.matches(exchange)?;
            exchange.set_property(CHOICE_MATCHED, matched);
            if matched {
                trace!(exchange_id = %exchange.id(), branch = index, "Choice matched when clause");
                exchange.set_property(CHOICE_BRANCH, json!(index));
                invoke(when.processor.as_ref(), exchange).await;
                return Ok(());
            }
        }

        if let Some(otherwise) = &self.otherwise {
            exchange.set_property(CHOICE_BRANCH, "otherwise");
            invoke(otherwise.as_ref(), exchange).await;
        }
        Ok(())
    }
}

/// Runs the child only when the predicate matches. The result is recorded so
/// a splitter can leave filtered-out elements out of its aggregate.
pub struct Filter {
    predicate: PredicateRef,
    processor: ProcessorRef,
}

impl Filter {
    pub fn new(predicate: PredicateRef, processor: ProcessorRef) -> Self {
        Self { predicate, processor }
    }
}

#[async_trait]
impl Processor for Filter {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let matched = self.predicate.matches(exchange)?;
        exchange.set_property(FILTER_MATCHED, matched);
        if matched {
            invoke(self.processor.as_ref(), exchange).await;
        }
        Ok(())
    }
}
