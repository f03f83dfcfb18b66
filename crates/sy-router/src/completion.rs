//! onCompletion: a sub-route run when the unit of work of an exchange is done.

use std::sync::Arc;

use async_trait::async_trait;
use sy_common::constants::{ERRORHANDLER_HANDLED, EXCEPTION_CAUGHT, ON_COMPLETION, ROUTE_STOP};
use sy_common::{Exchange, PredicateRef, Synchronization};
use tracing::{debug, warn};

use crate::executor::ThreadPool;
use crate::processor::{invoke, ProcessorRef};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnCompletionMode {
    #[default]
    Always,
    CompleteOnly,
    FailureOnly,
}

/// Synchronization that runs its processor on a copy of the finished exchange.
pub struct OnCompletion {
    route_id: String,
    mode: OnCompletionMode,
    on_when: Option<PredicateRef>,
    processor: ProcessorRef,
    pool: Option<Arc<ThreadPool>>,
}

impl OnCompletion {
    pub fn new(route_id: impl Into<String>, mode: OnCompletionMode, processor: ProcessorRef) -> Self {
        Self {
            route_id: route_id.into(),
            mode,
            on_when: None,
            processor,
            pool: None,
        }
    }

    pub fn with_on_when(mut self, predicate: PredicateRef) -> Self {
        self.on_when = Some(predicate);
        self
    }

    /// Run the sub-route on this pool instead of the completing task.
    pub fn with_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    async fn run(&self, exchange: &Exchange) {
        if let Some(predicate) = &self.on_when {
            match predicate.matches(exchange) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(route_id = %self.route_id, exchange_id = %exchange.id(), error = %e, "onCompletion onWhen failed");
                    return;
                }
            }
        }

        let mut copy = exchange.clone();
        copy.detach_unit_of_work();
        if let Some(error) = copy.take_exception() {
            copy.set_property(EXCEPTION_CAUGHT, error.to_string());
            copy.set_caught_exception(error);
        }
        copy.remove_property(ERRORHANDLER_HANDLED);
        copy.remove_property(ROUTE_STOP);
        copy.set_property(ON_COMPLETION, true);

        debug!(route_id = %self.route_id, exchange_id = %exchange.id(), "Running onCompletion");

        match &self.pool {
            Some(pool) => {
                let processor = self.processor.clone();
                let route_id = self.route_id.clone();
                let submitted = pool
                    .submit(async move {
                        invoke(processor.as_ref(), &mut copy).await;
                        report(&route_id, &copy);
                    })
                    .await;
                if let Err(e) = submitted {
                    warn!(route_id = %self.route_id, error = %e, "Could not submit onCompletion");
                }
            }
            None => {
                invoke(self.processor.as_ref(), &mut copy).await;
                report(&self.route_id, &copy);
            }
        }
    }
}

fn report(route_id: &str, exchange: &Exchange) {
    if let Some(error) = exchange.exception() {
        warn!(route_id = %route_id, exchange_id = %exchange.id(), error = %error, "onCompletion processing failed");
    }
}

#[async_trait]
impl Synchronization for OnCompletion {
    async fn on_complete(&self, exchange: &Exchange) {
        if self.mode != OnCompletionMode::FailureOnly {
            self.run(exchange).await;
        }
    }

    async fn on_failure(&self, exchange: &Exchange) {
        if self.mode != OnCompletionMode::CompleteOnly {
            self.run(exchange).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor_fn;
    use parking_lot::Mutex;
    use std::time::Duration;
    use sy_common::expression::header_equals;
    use sy_common::{ExchangeError, Message, UnitOfWork};

    fn recorder() -> (ProcessorRef, Arc<Mutex<Vec<Exchange>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let processor = {
            let seen = seen.clone();
            processor_fn(move |ex| {
                seen.lock().push(ex.clone());
                Ok(())
            })
        };
        (processor, seen)
    }

    #[tokio::test]
    async fn test_modes_filter_terminal_state() {
        let (processor, seen) = recorder();
        let failure_only = OnCompletion::new("r1", OnCompletionMode::FailureOnly, processor);

        let ok = Exchange::with_body("ok");
        failure_only.on_complete(&ok).await;
        assert!(seen.lock().is_empty());

        let mut failed = Exchange::with_body("bad");
        failed.set_exception(ExchangeError::processing("IOException", "x"));
        failure_only.on_failure(&failed).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].is_failed());
        assert!(seen[0].property_bool(ON_COMPLETION));
        assert_eq!(seen[0].caught_exception().map(|e| e.kind_name()), Some("IOException"));
    }

    #[tokio::test]
    async fn test_on_when_and_unit_of_work_detached() {
        let (processor, seen) = recorder();
        let sync = Arc::new(
            OnCompletion::new("r1", OnCompletionMode::Always, processor).with_on_when(header_equals("notify", true)),
        );

        for notify in [false, true] {
            let mut ex = Exchange::new(Message::new("x").with_header("notify", notify));
            let uow = Arc::new(UnitOfWork::new(&ex));
            uow.add_synchronization(sync.clone());
            ex.set_unit_of_work(uow.clone());
            uow.done(&ex).await;
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].unit_of_work().is_none());
    }

    #[tokio::test]
    async fn test_runs_on_pool() {
        let (processor, seen) = recorder();
        let pool = Arc::new(ThreadPool::new("completion", 1));
        let sync = OnCompletion::new("r1", OnCompletionMode::Always, processor).with_pool(pool.clone());

        sync.on_complete(&Exchange::with_body("x")).await;
        assert!(pool.shutdown(Duration::from_secs(1)).await);
        assert_eq!(seen.lock().len(), 1);
    }
}
