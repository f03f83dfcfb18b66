//! Throttler and delayer.
//!
//! The throttler is a `governor` rate limiter allowing `max_requests` per
//! `period`. By default an exchange over the limit waits for a slot; with
//! `reject_execution` it fails immediately instead.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde_json::Value;
use sy_common::{Exchange, ExchangeError, ExpressionRef, Result};
use tracing::debug;

use crate::error::ConfigError;
use crate::processor::Processor;

pub struct Throttler {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    max_requests: u32,
    period: Duration,
    reject_execution: bool,
}

impl Throttler {
    pub fn new(max_requests: u32, period: Duration) -> std::result::Result<Self, ConfigError> {
        let burst = NonZeroU32::new(max_requests)
            .ok_or_else(|| ConfigError::InvalidThrottle("maximum requests must be positive".into()))?;
        let quota = Quota::with_period(period / max_requests)
            .ok_or_else(|| ConfigError::InvalidThrottle(format!("period {:?} is too short", period)))?
            .allow_burst(burst);

        Ok(Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            max_requests,
            period,
            reject_execution: false,
        })
    }

    pub fn with_reject_execution(mut self, reject: bool) -> Self {
        self.reject_execution = reject;
        self
    }
}

#[async_trait]
impl Processor for Throttler {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        if self.limiter.check().is_ok() {
            return Ok(());
        }

        if self.reject_execution {
            metrics::counter!("switchyard_throttle_rejected_total").increment(1);
            return Err(ExchangeError::rejected(format!(
                "Exceeded the maximum of {} requests per {:?}",
                self.max_requests, self.period
            )));
        }

        debug!(exchange_id = %exchange.id(), "Throttling exchange");
        self.limiter.until_ready().await;
        Ok(())
    }
}

/// Holds each exchange for the number of milliseconds an expression yields.
pub struct Delayer {
    expression: ExpressionRef,
}

impl Delayer {
    pub fn new(expression: ExpressionRef) -> Self {
        Self { expression }
    }

    fn delay_for(&self, exchange: &Exchange) -> Result<Duration> {
        let millis = match self.expression.evaluate(exchange)? {
            Value::Null => 0,
            Value::Number(n) => n.as_u64().unwrap_or(0),
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| ExchangeError::expression(format!("Invalid delay '{}': {}", s, e)))?,
            other => return Err(ExchangeError::expression(format!("Invalid delay: {}", other))),
        };
        Ok(Duration::from_millis(millis))
    }
}

#[async_trait]
impl Processor for Delayer {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let delay = self.delay_for(exchange)?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
