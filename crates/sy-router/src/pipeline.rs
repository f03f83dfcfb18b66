use async_trait::async_trait;
use sy_common::{Exchange, Result};

use crate::processor::{continue_processing, invoke, Processor, ProcessorRef};

/// Runs steps in order against the same exchange.
///
/// Between steps the out message of the previous step becomes the in message
/// of the next. The pipeline stops at the first step that leaves the exchange
/// failed, faulted, stopped or handled; later steps never see it.
pub struct Pipeline {
    steps: Vec<ProcessorRef>,
}

impl Pipeline {
    pub fn new(steps: Vec<ProcessorRef>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            if index > 0 {
                if !continue_processing(exchange) {
                    break;
                }
                exchange.prepare_next();
            }
            invoke(step.as_ref(), exchange).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{processor_fn, StopProcessor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use sy_common::{ExchangeError, Message};

    fn counting(counter: Arc<AtomicUsize>) -> ProcessorRef {
        processor_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_fail_fast() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(vec![
            counting(before.clone()),
            processor_fn(|_| Err(ExchangeError::processing("IllegalArgument", "bad order"))),
            counting(after.clone()),
        ]);

        let mut ex = Exchange::with_body("order");
        pipeline.process(&mut ex).await.unwrap();

        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert_eq!(ex.exception().map(|e| e.kind_name()), Some("IllegalArgument"));
    }

    #[tokio::test]
    async fn test_out_becomes_next_in() {
        let pipeline = Pipeline::new(vec![
            processor_fn(|ex| {
                ex.set_out(Message::new("step1"));
                Ok(())
            }),
            processor_fn(|ex| {
                assert!(!ex.has_out());
                let next = format!("{}-step2", ex.in_message().body_str().unwrap_or_default());
                ex.set_body(next);
                Ok(())
            }),
        ]);

        let mut ex = Exchange::with_body("start");
        pipeline.process(&mut ex).await.unwrap();
        assert_eq!(ex.body_str(), Some("step1-step2"));
    }

    #[tokio::test]
    async fn test_stop_ends_pipeline() {
        let after = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(vec![Arc::new(StopProcessor), counting(after.clone())]);

        let mut ex = Exchange::with_body("x");
        pipeline.process(&mut ex).await.unwrap();
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert!(!ex.is_failed());
    }
}
