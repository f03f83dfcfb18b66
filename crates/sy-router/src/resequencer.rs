//! Batch resequencer: collects exchanges for a window and emits them ordered
//! by a sequence key.
//!
//! A batch is released when it reaches `batch_size` or when the oldest
//! exchange in it has waited `batch_timeout`. Ordering is stable, so exchanges
//! with equal keys keep their arrival order; without `allow_duplicates` only
//! the first (or last) of them is emitted.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sy_common::{Exchange, ExchangeError, ExpressionRef, Result};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::processor::{invoke, Processor, ProcessorRef};
use crate::service::{Service, ShutdownRunningTask};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Which exchange survives when several share a sequence key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    #[default]
    KeepFirst,
    KeepLast,
}

#[derive(Default)]
struct Batch {
    items: Vec<(Value, Exchange)>,
    started: Option<Instant>,
}

impl Batch {
    fn take(&mut self) -> Vec<(Value, Exchange)> {
        self.started = None;
        std::mem::take(&mut self.items)
    }
}

/// Order shared by sort keys: numbers numerically, strings lexically, then
/// by JSON type.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)).then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[derive(Clone, Copy)]
struct Arrangement {
    reverse: bool,
    allow_duplicates: bool,
    duplicates: DuplicatePolicy,
}

impl Arrangement {
    fn arrange(&self, mut items: Vec<(Value, Exchange)>) -> Vec<Exchange> {
        if self.reverse {
            items.sort_by(|a, b| compare_values(&b.0, &a.0));
        } else {
            items.sort_by(|a, b| compare_values(&a.0, &b.0));
        }

        if self.allow_duplicates {
            return items.into_iter().map(|(_, ex)| ex).collect();
        }

        let mut kept: Vec<(Value, Exchange)> = Vec::with_capacity(items.len());
        for (key, exchange) in items {
            match kept.last_mut() {
                Some(last) if compare_values(&last.0, &key) == Ordering::Equal => {
                    if self.duplicates == DuplicatePolicy::KeepLast {
                        *last = (key, exchange);
                    }
                }
                _ => kept.push((key, exchange)),
            }
        }
        kept.into_iter().map(|(_, ex)| ex).collect()
    }
}

pub struct Resequencer {
    route_id: String,
    expression: ExpressionRef,
    output: ProcessorRef,
    batch_size: usize,
    batch_timeout: Duration,
    ignore_invalid_exchanges: bool,
    ordering: Arrangement,
    batch: Arc<Mutex<Batch>>,
    ticker: Mutex<Option<broadcast::Sender<()>>>,
}

impl Resequencer {
    pub fn new(route_id: impl Into<String>, expression: ExpressionRef, output: ProcessorRef) -> Self {
        Self {
            route_id: route_id.into(),
            expression,
            output,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            ignore_invalid_exchanges: false,
            ordering: Arrangement {
                reverse: false,
                allow_duplicates: false,
                duplicates: DuplicatePolicy::KeepFirst,
            },
            batch: Arc::new(Mutex::new(Batch::default())),
            ticker: Mutex::new(None),
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_allow_duplicates(mut self, allow: bool) -> Self {
        self.ordering.allow_duplicates = allow;
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.ordering.duplicates = policy;
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.ordering.reverse = reverse;
        self
    }

    pub fn with_ignore_invalid_exchanges(mut self, ignore: bool) -> Self {
        self.ignore_invalid_exchanges = ignore;
        self
    }

    /// Release the current batch regardless of size or age.
    pub async fn flush(&self) -> usize {
        let items = self.batch.lock().take();
        release(&self.route_id, self.output.as_ref(), self.ordering, items).await
    }
}

async fn release(route_id: &str, output: &dyn Processor, ordering: Arrangement, items: Vec<(Value, Exchange)>) -> usize {
    if items.is_empty() {
        return 0;
    }
    let received = items.len();
    let ordered = ordering.arrange(items);
    let emitted = ordered.len();
    debug!(route_id = %route_id, received, emitted, "Releasing resequenced batch");

    for mut exchange in ordered {
        invoke(output, &mut exchange).await;
        if let Some(error) = exchange.exception() {
            warn!(route_id = %route_id, exchange_id = %exchange.id(), error = %error, "Resequenced exchange failed");
        }
    }
    emitted
}

#[async_trait]
impl Processor for Resequencer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let key = self.expression.evaluate(exchange)?;
        if key.is_null() {
            if self.ignore_invalid_exchanges {
                debug!(route_id = %self.route_id, exchange_id = %exchange.id(), "Ignoring exchange without sequence key");
                return Ok(());
            }
            return Err(ExchangeError::processing(
                "InvalidSequenceKey",
                format!("No sequence key for exchange {}", exchange.id()),
            ));
        }

        let mut held = exchange.copy_for_branch();
        held.detach_unit_of_work();

        let full = {
            let mut batch = self.batch.lock();
            batch.started.get_or_insert_with(Instant::now);
            batch.items.push((key, held));
            if batch.items.len() >= self.batch_size {
                Some(batch.take())
            } else {
                None
            }
        };

        if let Some(items) = full {
            release(&self.route_id, self.output.as_ref(), self.ordering, items).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Service for Resequencer {
    async fn start(&self) {
        let mut rx = {
            let mut slot = self.ticker.lock();
            if slot.is_some() {
                return;
            }
            let (tx, rx) = broadcast::channel(1);
            *slot = Some(tx);
            rx
        };

        let batch = self.batch.clone();
        let output = self.output.clone();
        let route_id = self.route_id.clone();
        let ordering = self.ordering;
        let timeout = self.batch_timeout;
        let period = (timeout / 4).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = {
                            let mut guard = batch.lock();
                            match guard.started {
                                Some(started) if started.elapsed() >= timeout => guard.take(),
                                _ => Vec::new(),
                            }
                        };
                        release(&route_id, output.as_ref(), ordering, expired).await;
                    }
                    _ = rx.recv() => {
                        debug!(route_id = %route_id, "Resequencer batch timer shutting down");
                        break;
                    }
                }
            }
        });
    }

    async fn stop(&self) {
        if let Some(tx) = self.ticker.lock().take() {
            let _ = tx.send(());
        }
    }

    fn pending_exchanges(&self) -> usize {
        self.batch.lock().items.len()
    }

    async fn prepare_shutdown(&self, task: ShutdownRunningTask, forced: bool) {
        if task == ShutdownRunningTask::CompleteAllTasks && !forced {
            self.flush().await;
        }
    }
}
