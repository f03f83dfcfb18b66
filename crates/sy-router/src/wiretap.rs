//! Wire tap: sends a copy of the exchange to a processor on an executor pool
//! and lets the original continue immediately. When the pool is saturated the
//! tap runs on the caller's task instead of waiting for a slot.

use std::sync::Arc;

use async_trait::async_trait;
use sy_common::{Exchange, ExpressionRef, Result};
use tracing::{debug, warn};

use crate::executor::{Submission, ThreadPool};
use crate::processor::{invoke, Processor, ProcessorRef};

pub struct WireTap {
    processor: ProcessorRef,
    pool: Arc<ThreadPool>,
    /// Replaces the body of the tapped copy when set.
    body: Option<ExpressionRef>,
}

impl WireTap {
    pub fn new(processor: ProcessorRef, pool: Arc<ThreadPool>) -> Self {
        Self {
            processor,
            pool,
            body: None,
        }
    }

    pub fn with_body(mut self, body: ExpressionRef) -> Self {
        self.body = Some(body);
        self
    }
}

#[async_trait]
impl Processor for WireTap {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let mut tap = exchange.copy_for_branch();
        // the tap must not hold up the original's completion
        tap.detach_unit_of_work();
        if let Some(body) = &self.body {
            tap.set_body(body.evaluate(exchange)?);
        }

        debug!(exchange_id = %exchange.id(), tap_id = %tap.id(), pool = self.pool.name(), "Wire tapping exchange");
        let processor = self.processor.clone();
        let task = async move {
            invoke(processor.as_ref(), &mut tap).await;
            if let Some(error) = tap.exception() {
                warn!(exchange_id = %tap.id(), error = %error, "Wire tap processing failed");
            }
        };
        if let Submission::CallerRuns(task) = self.pool.try_submit(task)? {
            task.await;
        }
        Ok(())
    }
}
