use rand::Rng;
use sy_common::{Exchange, Result};

use super::{LoadBalanceSelector, Selection};

/// Uniform choice per exchange. Stateless.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl LoadBalanceSelector for RandomSelector {
    fn select(&self, _exchange: &Exchange, count: usize) -> Result<Selection> {
        Ok(Selection::index(rand::thread_rng().gen_range(0..count.max(1))))
    }
}
