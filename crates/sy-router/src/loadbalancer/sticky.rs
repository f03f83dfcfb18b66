use dashmap::DashMap;
use serde_json::Value;
use sy_common::expression::value_to_string;
use sy_common::{Exchange, ExpressionRef, Result};
use tracing::debug;

use super::round_robin::RoundRobinSelector;
use super::{LoadBalanceSelector, Selection};

/// Keeps sending a correlation key to the processor that last served it
/// successfully. Keys seen for the first time (and keys whose processor
/// failed) are assigned round robin.
pub struct StickySelector {
    expression: ExpressionRef,
    assignments: DashMap<String, usize>,
    fallback: RoundRobinSelector,
}

impl StickySelector {
    pub fn new(expression: ExpressionRef) -> Self {
        Self {
            expression,
            assignments: DashMap::new(),
            fallback: RoundRobinSelector::default(),
        }
    }
}

impl LoadBalanceSelector for StickySelector {
    fn select(&self, exchange: &Exchange, count: usize) -> Result<Selection> {
        let key = match self.expression.evaluate(exchange)? {
            Value::Null => None,
            value => Some(value_to_string(&value)),
        };

        let remembered = key
            .as_ref()
            .and_then(|k| self.assignments.get(k).map(|entry| *entry))
            .filter(|index| *index < count);

        let index = match remembered {
            Some(index) => index,
            None => self.fallback.next(count),
        };
        Ok(Selection { index, key })
    }

    fn on_outcome(&self, selection: &Selection, failed: bool) {
        let Some(key) = &selection.key else {
            return;
        };
        if failed {
            if self.assignments.remove(key).is_some() {
                debug!(correlation_key = %key, index = selection.index, "Dropping sticky assignment after failure");
            }
        } else {
            self.assignments.insert(key.clone(), selection.index);
        }
    }

    fn reset(&self) {
        self.assignments.clear();
        self.fallback.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sy_common::expression::header;
    use sy_common::Message;

    fn keyed(key: &str) -> Exchange {
        Exchange::new(Message::new("x").with_header("customer", key))
    }

    #[test]
    fn test_sticks_until_failure() {
        let selector = StickySelector::new(header("customer"));

        let first = selector.select(&keyed("acme"), 3).unwrap();
        selector.on_outcome(&first, false);
        let other = selector.select(&keyed("globex"), 3).unwrap();
        selector.on_outcome(&other, false);
        assert_ne!(first.index, other.index);

        for _ in 0..3 {
            assert_eq!(selector.select(&keyed("acme"), 3).unwrap().index, first.index);
        }

        selector.on_outcome(&first, true);
        let moved = selector.select(&keyed("acme"), 3).unwrap();
        assert_ne!(moved.index, first.index);

        selector.reset();
        assert_eq!(selector.select(&keyed("acme"), 3).unwrap().index, 0);
    }
}
