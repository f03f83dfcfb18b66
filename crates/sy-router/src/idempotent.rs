//! Idempotent consumer: lets the first exchange for a message id through and
//! drops (or flags) later ones.
//!
//! In eager mode the id is added to the repository before the guarded
//! processor runs, so concurrent duplicates are caught. Otherwise it is only
//! added once the exchange completes. A failed exchange removes its id again
//! when `remove_on_failure` is set so a retry from the source is accepted.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sy_common::constants::DUPLICATE_MESSAGE;
use sy_common::expression::value_to_string;
use sy_common::{Exchange, ExchangeError, ExpressionRef, Result, Synchronization};
use sy_idempotent::IdempotentRepository;
use tracing::{debug, warn};

use crate::processor::{invoke, Processor, ProcessorRef};

fn repository_error(error: anyhow::Error) -> ExchangeError {
    ExchangeError::processing("IdempotentRepositoryException", error.to_string())
}

pub struct IdempotentConsumer {
    expression: ExpressionRef,
    repository: Arc<dyn IdempotentRepository>,
    processor: ProcessorRef,
    eager: bool,
    skip_duplicate: bool,
    remove_on_failure: bool,
}

impl IdempotentConsumer {
    pub fn new(expression: ExpressionRef, repository: Arc<dyn IdempotentRepository>, processor: ProcessorRef) -> Self {
        Self {
            expression,
            repository,
            processor,
            eager: true,
            skip_duplicate: true,
            remove_on_failure: true,
        }
    }

    pub fn with_eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    /// When false, duplicates are passed on with the duplicate flag set.
    pub fn with_skip_duplicate(mut self, skip: bool) -> Self {
        self.skip_duplicate = skip;
        self
    }

    pub fn with_remove_on_failure(mut self, remove: bool) -> Self {
        self.remove_on_failure = remove;
        self
    }

    fn confirmation(&self, key: String) -> Confirmation {
        Confirmation {
            repository: self.repository.clone(),
            key,
            eager: self.eager,
            remove_on_failure: self.remove_on_failure,
        }
    }
}

#[async_trait]
impl Processor for IdempotentConsumer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let key = match self.expression.evaluate(exchange)? {
            Value::Null => {
                return Err(ExchangeError::processing(
                    "NoMessageIdException",
                    format!("No message ID could be found for exchange {}", exchange.id()),
                ))
            }
            value => value_to_string(&value),
        };

        let is_new = if self.eager {
            self.repository.add(&key).await.map_err(repository_error)?
        } else {
            !self.repository.contains(&key).await.map_err(repository_error)?
        };

        if !is_new {
            exchange.set_property(DUPLICATE_MESSAGE, true);
            if self.skip_duplicate {
                debug!(
                    exchange_id = %exchange.id(),
                    message_id = %key,
                    repository = self.repository.name(),
                    "Dropping duplicate message"
                );
                metrics::counter!("switchyard_duplicate_messages_total").increment(1);
                return Ok(());
            }
            invoke(self.processor.as_ref(), exchange).await;
            return Ok(());
        }

        match exchange.unit_of_work() {
            Some(uow) => {
                uow.add_synchronization(Arc::new(self.confirmation(key)));
                invoke(self.processor.as_ref(), exchange).await;
            }
            None => {
                invoke(self.processor.as_ref(), exchange).await;
                self.confirmation(key).settle(exchange.is_failed()).await;
            }
        }
        Ok(())
    }
}

/// Settles a message id once the exchange that carried it is done.
struct Confirmation {
    repository: Arc<dyn IdempotentRepository>,
    key: String,
    eager: bool,
    remove_on_failure: bool,
}

impl Confirmation {
    async fn settle(&self, failed: bool) {
        let result = if failed {
            if self.remove_on_failure {
                self.repository.remove(&self.key).await.map(|_| ())
            } else {
                Ok(())
            }
        } else if !self.eager {
            self.repository.add(&self.key).await.map(|_| ())
        } else {
            Ok(())
        };

        if let Err(e) = result {
            warn!(message_id = %self.key, repository = self.repository.name(), error = %e, "Failed to settle message id");
        }
    }
}

#[async_trait]
impl Synchronization for Confirmation {
    async fn on_complete(&self, _exchange: &Exchange) {
        self.settle(false).await;
    }

    async fn on_failure(&self, _exchange: &Exchange) {
        self.settle(true).await;
    }
}
