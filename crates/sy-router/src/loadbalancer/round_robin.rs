use std::sync::atomic::{AtomicUsize, Ordering};

use sy_common::{Exchange, Result};

use super::{LoadBalanceSelector, Selection};

#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl RoundRobinSelector {
    pub(crate) fn next(&self, count: usize) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) % count.max(1)
    }
}

impl LoadBalanceSelector for RoundRobinSelector {
    fn select(&self, _exchange: &Exchange, count: usize) -> Result<Selection> {
        Ok(Selection::index(self.next(count)))
    }

    fn reset(&self) {
        self.counter.store(0, Ordering::SeqCst);
    }
}
