//! Aggregator: buffers exchanges by correlation key and emits each group as
//! one exchange once it completes.
//!
//! A group completes when it reaches the completion size, when the completion
//! predicate matches the aggregate, or when it has been idle for the completion
//! timeout (checked by a background ticker started with the route). Incoming
//! exchanges pass through unchanged; completed groups are sent to the
//! aggregator's own output.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sy_common::constants::{AGGREGATED_COMPLETED_BY, AGGREGATED_CORRELATION_KEY, AGGREGATED_SIZE};
use sy_common::expression::value_to_string;
use sy_common::{Exchange, ExchangeError, ExpressionRef, PredicateRef, Result};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::aggregation::AggregationStrategyRef;
use crate::processor::{invoke, Processor, ProcessorRef};
use crate::service::{Service, ShutdownRunningTask};

struct Group {
    aggregate: Exchange,
    size: usize,
    updated: Instant,
}

type Groups = Arc<Mutex<HashMap<String, Group>>>;

pub struct Aggregator {
    route_id: String,
    correlation: ExpressionRef,
    strategy: AggregationStrategyRef,
    output: ProcessorRef,
    completion_size: Option<usize>,
    completion_predicate: Option<PredicateRef>,
    completion_timeout: Option<Duration>,
    ignore_invalid_correlation_keys: bool,
    force_completion_on_stop: bool,
    groups: Groups,
    ticker: Mutex<Option<broadcast::Sender<()>>>,
}

impl Aggregator {
    pub fn new(
        route_id: impl Into<String>,
        correlation: ExpressionRef,
        strategy: AggregationStrategyRef,
        output: ProcessorRef,
    ) -> Self {
        Self {
            route_id: route_id.into(),
            correlation,
            strategy,
            output,
            completion_size: None,
            completion_predicate: None,
            completion_timeout: None,
            ignore_invalid_correlation_keys: false,
            force_completion_on_stop: false,
            groups: Arc::new(Mutex::new(HashMap::new())),
            ticker: Mutex::new(None),
        }
    }

    pub fn with_completion_size(mut self, size: usize) -> Self {
        self.completion_size = Some(size.max(1));
        self
    }

    pub fn with_completion_predicate(mut self, predicate: PredicateRef) -> Self {
        self.completion_predicate = Some(predicate);
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = Some(timeout);
        self
    }

    pub fn with_ignore_invalid_correlation_keys(mut self, ignore: bool) -> Self {
        self.ignore_invalid_correlation_keys = ignore;
        self
    }

    pub fn with_force_completion_on_stop(mut self, force: bool) -> Self {
        self.force_completion_on_stop = force;
        self
    }

    pub fn has_completion_condition(&self) -> bool {
        self.completion_size.is_some() || self.completion_predicate.is_some() || self.completion_timeout.is_some()
    }

    /// Number of groups still being aggregated.
    pub fn pending_groups(&self) -> usize {
        self.groups.lock().len()
    }

    /// Emit every open group now. Returns how many were emitted.
    pub async fn force_completion(&self) -> usize {
        let drained: Vec<(String, Group)> = self.groups.lock().drain().collect();
        let count = drained.len();
        for (key, group) in drained {
            emit(&self.route_id, self.output.as_ref(), key, group, "force").await;
        }
        if count > 0 {
            info!(route_id = %self.route_id, groups = count, "Forced completion of aggregated groups");
        }
        count
    }

    fn completed_by(&self, group: &Group) -> Result<Option<&'static str>> {
        if let Some(predicate) = &self.completion_predicate {
            if predicate.matches(&group.aggregate)? {
                return Ok(Some("predicate"));
            }
        }
        if let Some(size) = self.completion_size {
            if group.size >= size {
                return Ok(Some("size"));
            }
        }
        Ok(None)
    }

    fn correlation_key(&self, exchange: &Exchange) -> Result<Option<String>> {
        let key = match self.correlation.evaluate(exchange)? {
            Value::Null => None,
            value => Some(value_to_string(&value)).filter(|k| !k.is_empty()),
        };
        Ok(key)
    }
}

async fn emit(route_id: &str, output: &dyn Processor, key: String, group: Group, completed_by: &'static str) {
    let mut exchange = group.aggregate;
    exchange.set_property(AGGREGATED_SIZE, group.size);
    exchange.set_property(AGGREGATED_COMPLETED_BY, completed_by);
    exchange.set_property(AGGREGATED_CORRELATION_KEY, key.clone());

    debug!(route_id = %route_id, correlation_key = %key, size = group.size, completed_by, "Aggregated group complete");
    metrics::counter!("switchyard_aggregated_groups_total", "route" => route_id.to_string(), "completed_by" => completed_by)
        .increment(1);

    invoke(output, &mut exchange).await;
    if let Some(error) = exchange.exception() {
        warn!(
            route_id = %route_id,
            correlation_key = %key,
            error = %error,
            "Processing of aggregated exchange failed"
        );
    }
}

#[async_trait]
impl Processor for Aggregator {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let key = match self.correlation_key(exchange)? {
            Some(key) => key,
            None if self.ignore_invalid_correlation_keys => {
                debug!(route_id = %self.route_id, exchange_id = %exchange.id(), "Ignoring exchange with invalid correlation key");
                return Ok(());
            }
            None => {
                return Err(ExchangeError::processing(
                    "InvalidCorrelationKey",
                    format!("Invalid correlation key for exchange {}", exchange.id()),
                ))
            }
        };

        // The batch outlives every exchange in it.
        let mut incoming = exchange.copy_for_branch();
        incoming.detach_unit_of_work();

        let completed = {
            let mut groups = self.groups.lock();
            let previous = groups.remove(&key);
            let size = previous.as_ref().map(|g| g.size).unwrap_or(0) + 1;

            let aggregate = match self.strategy.aggregate(previous.map(|g| g.aggregate), incoming) {
                Ok(aggregate) => aggregate,
                Err(e) => {
                    warn!(route_id = %self.route_id, correlation_key = %key, error = %e, "Aggregation failed, discarding group");
                    return Err(match e {
                        ExchangeError::Aggregation(_) => e,
                        other => ExchangeError::Aggregation(other.to_string()),
                    });
                }
            };

            let group = Group {
                aggregate,
                size,
                updated: Instant::now(),
            };
            match self.completed_by(&group) {
                Ok(Some(reason)) => Some((group, reason)),
                Ok(None) => {
                    groups.insert(key.clone(), group);
                    None
                }
                Err(e) => {
                    groups.insert(key.clone(), group);
                    return Err(e);
                }
            }
        };

        if let Some((group, reason)) = completed {
            emit(&self.route_id, self.output.as_ref(), key, group, reason).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Service for Aggregator {
    async fn start(&self) {
        let Some(timeout) = self.completion_timeout else {
            return;
        };

        let mut rx = {
            let mut slot = self.ticker.lock();
            if slot.is_some() {
                return;
            }
            let (tx, rx) = broadcast::channel(1);
            *slot = Some(tx);
            rx
        };

        let groups = self.groups.clone();
        let output = self.output.clone();
        let route_id = self.route_id.clone();
        let period = (timeout / 4).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired: Vec<(String, Group)> = {
                            let mut guard = groups.lock();
                            let keys: Vec<String> = guard
                                .iter()
                                .filter(|(_, group)| group.updated.elapsed() >= timeout)
                                .map(|(key, _)| key.clone())
                                .collect();
                            keys.into_iter()
                                .filter_map(|key| guard.remove(&key).map(|group| (key, group)))
                                .collect()
                        };
                        for (key, group) in expired {
                            emit(&route_id, output.as_ref(), key, group, "timeout").await;
                        }
                    }
                    _ = rx.recv() => {
                        debug!(route_id = %route_id, "Aggregator timeout checker shutting down");
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
        if self.force_completion_on_stop {
            self.force_completion().await;
        }
    }

    fn pending_exchanges(&self) -> usize {
        self.pending_groups()
    }

    async fn prepare_shutdown(&self, task: ShutdownRunningTask, forced: bool) {
        if task == ShutdownRunningTask::CompleteAllTasks && !forced {
            self.force_completion().await;
        }
    }
}
