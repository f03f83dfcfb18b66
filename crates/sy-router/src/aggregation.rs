//! Aggregation strategies: how fan-out branch results and aggregator groups
//! are folded into a single exchange.

use std::sync::Arc;

use serde_json::Value;
use sy_common::{Exchange, Result};

/// Folds a new exchange into the running aggregate. `old` is `None` for the
/// first exchange of a group.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange>;
}

pub type AggregationStrategyRef = Arc<dyn AggregationStrategy>;

/// Keeps the newest exchange. A failure recorded on an earlier result is kept
/// when the newer one succeeded.
#[derive(Debug, Default, Clone, Copy)]
pub struct UseLatestAggregationStrategy;

impl AggregationStrategy for UseLatestAggregationStrategy {
    fn aggregate(&self, old: Option<Exchange>, mut new: Exchange) -> Result<Exchange> {
        if let Some(old) = old {
            if old.is_failed() && !new.is_failed() {
                new.propagate_failure_from(&old);
            }
        }
        Ok(new)
    }
}

/// Collects every body into a JSON array on the first exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupedBodyAggregationStrategy;

impl AggregationStrategy for GroupedBodyAggregationStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange> {
        let mut old = match old {
            Some(old) => old,
            None => {
                let mut first = new;
                let body = first.body().clone();
                first.set_body(Value::Array(vec![body]));
                return Ok(first);
            }
        };

        let body = new.body().clone();
        if let Value::Array(items) = &mut old.message_mut().body {
            items.push(body);
        }
        if new.is_failed() && !old.is_failed() {
            old.propagate_failure_from(&new);
        }
        Ok(old)
    }
}

struct FnAggregationStrategy<F>(F);

impl<F> AggregationStrategy for FnAggregationStrategy<F>
where
    F: Fn(Option<Exchange>, Exchange) -> Result<Exchange> + Send + Sync,
{
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange> {
        (self.0)(old, new)
    }
}

pub fn aggregation_fn<F>(f: F) -> AggregationStrategyRef
where
    F: Fn(Option<Exchange>, Exchange) -> Result<Exchange> + Send + Sync + 'static,
{
    Arc::new(FnAggregationStrategy(f))
}
