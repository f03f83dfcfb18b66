//! Fan-out core shared by multicast, recipient list and splitter.
//!
//! Each branch gets its own copy of the exchange. Branches run sequentially in
//! the caller's task or concurrently on a bounded executor pool; results are
//! folded with an aggregation strategy in completion order and written back
//! to the parent. With `stop_on_exception` the first failed branch ends the
//! fan-out and its failure is copied to the parent.
//!
//! Parallel branches that find the pool saturated run on the caller's task,
//! and finished branches are folded while the source is still being read.
//! Ending a parallel fan-out early stops submitting new branches; branches
//! already running finish their current step and their results are dropped.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{json, Value};
use sy_common::constants::{FILTER_MATCHED, MULTICAST_COMPLETE, MULTICAST_INDEX};
use sy_common::{Exchange, ExchangeError, Result};
use tokio::task::JoinError;
use tracing::debug;

use crate::aggregation::AggregationStrategyRef;
use crate::executor::{Submission, TaskHandle, ThreadPool};
use crate::processor::{invoke, Processor, ProcessorRef};

/// One unit of fan-out work.
pub struct Branch {
    pub processor: ProcessorRef,
    /// Replaces the body of the branch copy when set.
    pub body: Option<Value>,
    pub properties: Vec<(&'static str, Value)>,
}

impl Branch {
    pub fn new(processor: ProcessorRef) -> Self {
        Self {
            processor,
            body: None,
            properties: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct FanOut {
    /// `None` leaves the parent's message as it was and only propagates failures.
    strategy: Option<AggregationStrategyRef>,
    pool: Option<Arc<ThreadPool>>,
    stop_on_exception: bool,
}

#[derive(Default)]
struct FoldState {
    aggregate: Option<Exchange>,
    first_failure: Option<Exchange>,
}

impl FanOut {
    pub fn new(strategy: Option<AggregationStrategyRef>) -> Self {
        Self {
            strategy,
            pool: None,
            stop_on_exception: false,
        }
    }

    pub fn with_parallel(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }

    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Run every branch produced by `branches` against copies of `exchange`.
    /// An `Err` item from the iterator aborts the fan-out with that error.
    pub async fn run<I>(&self, exchange: &mut Exchange, branches: I) -> Result<()>
    where
        I: Iterator<Item = Result<Branch>> + Send,
    {
        let (state, stopped_by) = match &self.pool {
            Some(pool) => self.run_parallel(exchange, branches, pool).await?,
            None => self.run_sequential(exchange, branches).await?,
        };
        self.complete(exchange, state, stopped_by);
        Ok(())
    }

    async fn run_sequential<I>(&self, exchange: &Exchange, branches: I) -> Result<(FoldState, Option<Exchange>)>
    where
        I: Iterator<Item = Result<Branch>> + Send,
    {
        let mut state = FoldState::default();
        for branch in branches {
            let branch = branch?;
            let mut sub = prepare(exchange, &branch);
            invoke(branch.processor.as_ref(), &mut sub).await;

            if sub.is_failed() && self.stop_on_exception {
                debug!(exchange_id = %exchange.id(), branch = %sub.id(), "Stopping fan-out on exception");
                return Ok((state, Some(sub)));
            }
            self.fold(&mut state, sub)?;
        }
        Ok((state, None))
    }

    async fn run_parallel<I>(
        &self,
        exchange: &Exchange,
        branches: I,
        pool: &ThreadPool,
    ) -> Result<(FoldState, Option<Exchange>)>
    where
        I: Iterator<Item = Result<Branch>> + Send,
    {
        let mut tasks: FuturesUnordered<TaskHandle<Exchange>> = FuturesUnordered::new();
        let mut state = FoldState::default();
        let mut outcome: Result<Option<Exchange>> = Ok(None);

        for branch in branches {
            let branch = match branch {
                Ok(branch) => branch,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };
            let mut sub = prepare(exchange, &branch);
            let processor = branch.processor.clone();
            let task = async move {
                invoke(processor.as_ref(), &mut sub).await;
                sub
            };

            let mut settled = match pool.try_submit(task) {
                Ok(Submission::Spawned(handle)) => {
                    tasks.push(handle);
                    Ok(None)
                }
                Ok(Submission::CallerRuns(task)) => {
                    let sub = task.await;
                    self.settle(exchange, &mut state, Ok(sub))
                }
                Err(e) => Err(e),
            };
            // fold whatever already finished before reading the next element
            while matches!(settled, Ok(None)) {
                match tasks.next().now_or_never() {
                    Some(Some(joined)) => settled = self.settle(exchange, &mut state, joined_branch(joined)),
                    _ => break,
                }
            }
            if !matches!(settled, Ok(None)) {
                outcome = settled;
                break;
            }
        }

        if matches!(outcome, Ok(None)) {
            while let Some(joined) = tasks.next().await {
                let settled = self.settle(exchange, &mut state, joined_branch(joined));
                if !matches!(settled, Ok(None)) {
                    outcome = settled;
                    break;
                }
            }
        }

        if !tasks.is_empty() {
            debug!(
                exchange_id = %exchange.id(),
                running = tasks.len(),
                "Fan-out ended early, waiting for running branches"
            );
            while tasks.next().await.is_some() {}
        }

        outcome.map(|stopped_by| (state, stopped_by))
    }

    /// Fold one finished branch. `Some` carries the branch that stops the fan-out.
    fn settle(&self, exchange: &Exchange, state: &mut FoldState, sub: Result<Exchange>) -> Result<Option<Exchange>> {
        let sub = sub?;
        if sub.is_failed() && self.stop_on_exception {
            debug!(exchange_id = %exchange.id(), branch = %sub.id(), "Stopping parallel fan-out on exception");
            return Ok(Some(sub));
        }
        self.fold(state, sub)?;
        Ok(None)
    }

    fn fold(&self, state: &mut FoldState, sub: Exchange) -> Result<()> {
        // Elements a nested filter rejected take no part in the aggregate.
        if sub.property(FILTER_MATCHED) == Some(&Value::Bool(false)) {
            return Ok(());
        }

        if sub.is_failed() && state.first_failure.is_none() {
            state.first_failure = Some(sub.clone());
        }

        if let Some(strategy) = &self.strategy {
            let aggregated = strategy.aggregate(state.aggregate.take(), sub).map_err(|e| match e {
                ExchangeError::Aggregation(_) => e,
                other => ExchangeError::Aggregation(other.to_string()),
            })?;
            state.aggregate = Some(aggregated);
        }
        Ok(())
    }

    fn complete(&self, exchange: &mut Exchange, state: FoldState, stopped_by: Option<Exchange>) {
        if self.strategy.is_some() {
            if let Some(aggregate) = state.aggregate {
                exchange.copy_results_from(aggregate);
            }
        }

        if let Some(failed) = stopped_by {
            exchange.propagate_failure_from(&failed);
        } else if self.strategy.is_none() {
            if let Some(failed) = state.first_failure {
                exchange.propagate_failure_from(&failed);
            }
        }
    }
}

fn joined_branch(joined: std::result::Result<Result<Exchange>, JoinError>) -> Result<Exchange> {
    joined.map_err(|e| ExchangeError::rejected(format!("Parallel branch did not complete: {}", e)))?
}

fn prepare(exchange: &Exchange, branch: &Branch) -> Exchange {
    let mut sub = exchange.copy_for_branch();
    if let Some(body) = &branch.body {
        sub.set_body(body.clone());
    }
    for (name, value) in &branch.properties {
        sub.set_property(*name, value.clone());
    }
    sub
}

/// Sends a copy of the exchange to each of a fixed list of processors.
pub struct Multicast {
    processors: Vec<ProcessorRef>,
    fan_out: FanOut,
}

impl Multicast {
    pub fn new(processors: Vec<ProcessorRef>, fan_out: FanOut) -> Self {
        Self { processors, fan_out }
    }
}

#[async_trait]
impl Processor for Multicast {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let total = self.processors.len();
        let branches = self.processors.iter().enumerate().map(move |(index, processor)| {
            Ok(Branch {
                processor: processor.clone(),
                body: None,
                properties: vec![
                    (MULTICAST_INDEX, json!(index)),
                    (MULTICAST_COMPLETE, json!(index + 1 == total)),
                ],
            })
        });
        self.fan_out.run(exchange, branches).await
    }
}
