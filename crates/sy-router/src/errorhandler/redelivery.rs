use std::time::Duration;

use rand::Rng;
use sy_config::RedeliveryConfig;

use crate::error::ConfigError;

/// Delay tiers parsed from `limit:delay;limit:delay`. The tier with the
/// highest limit not above the redelivery counter applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayPattern {
    tiers: Vec<(u32, Duration)>,
}

impl DelayPattern {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidDelayPattern {
            pattern: pattern.to_string(),
            reason,
        };

        let mut tiers = Vec::new();
        for group in pattern.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let (limit, delay) = group
                .split_once(':')
                .ok_or_else(|| invalid(format!("group '{}' must be <limit>:<delay>", group)))?;
            let limit = limit
                .trim()
                .parse::<u32>()
                .map_err(|_| invalid(format!("invalid limit in group '{}'", group)))?;
            let delay = delay
                .trim()
                .parse::<u64>()
                .map_err(|_| invalid(format!("invalid delay in group '{}'", group)))?;
            tiers.push((limit, Duration::from_millis(delay)));
        }

        if tiers.is_empty() {
            return Err(invalid("no delay groups".to_string()));
        }
        tiers.sort_by_key(|(limit, _)| *limit);
        Ok(Self { tiers })
    }

    pub fn delay_for(&self, redelivery_counter: u32) -> Duration {
        self.tiers
            .iter()
            .rev()
            .find(|(limit, _)| *limit <= redelivery_counter)
            .map(|(_, delay)| *delay)
            .unwrap_or(Duration::ZERO)
    }
}

/// How many times and how far apart failed deliveries are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    /// -1 retries forever, 0 never retries
    pub maximum_redeliveries: i32,
    pub redelivery_delay: Duration,
    pub maximum_redelivery_delay: Duration,
    pub back_off_multiplier: f64,
    pub use_exponential_back_off: bool,
    pub use_collision_avoidance: bool,
    pub collision_avoidance_factor: f64,
    pub delay_pattern: Option<DelayPattern>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: Duration::from_millis(1000),
            maximum_redelivery_delay: Duration::from_secs(60),
            back_off_multiplier: 2.0,
            use_exponential_back_off: false,
            use_collision_avoidance: false,
            collision_avoidance_factor: 0.15,
            delay_pattern: None,
        }
    }
}

impl RedeliveryPolicy {
    pub fn from_config(config: &RedeliveryConfig) -> Result<Self, ConfigError> {
        let delay_pattern = config.delay_pattern.as_deref().map(DelayPattern::parse).transpose()?;
        Ok(Self {
            maximum_redeliveries: config.maximum_redeliveries,
            redelivery_delay: Duration::from_millis(config.redelivery_delay_ms),
            maximum_redelivery_delay: Duration::from_millis(config.maximum_redelivery_delay_ms),
            back_off_multiplier: config.back_off_multiplier,
            use_exponential_back_off: config.use_exponential_back_off,
            use_collision_avoidance: config.use_collision_avoidance,
            collision_avoidance_factor: config.collision_avoidance_factor,
            delay_pattern,
        })
    }

    pub fn maximum_redeliveries(mut self, maximum: i32) -> Self {
        self.maximum_redeliveries = maximum;
        self
    }

    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn maximum_redelivery_delay(mut self, delay: Duration) -> Self {
        self.maximum_redelivery_delay = delay;
        self
    }

    pub fn exponential_back_off(mut self, multiplier: f64) -> Self {
        self.use_exponential_back_off = true;
        self.back_off_multiplier = multiplier;
        self
    }

    pub fn collision_avoidance(mut self, factor: f64) -> Self {
        self.use_collision_avoidance = true;
        self.collision_avoidance_factor = factor;
        self
    }

    pub fn delay_pattern(mut self, pattern: DelayPattern) -> Self {
        self.delay_pattern = Some(pattern);
        self
    }

    /// Whether redelivery number `redelivery_counter` (1-based) may happen.
    pub fn should_redeliver(&self, redelivery_counter: u32) -> bool {
        if self.maximum_redeliveries < 0 {
            return true;
        }
        i64::from(redelivery_counter) <= i64::from(self.maximum_redeliveries)
    }

    /// Delay before redelivery number `redelivery_counter`, given the delay
    /// used before the previous one.
    pub fn calculate_delay(&self, previous: Duration, redelivery_counter: u32) -> Duration {
        if let Some(pattern) = &self.delay_pattern {
            return pattern.delay_for(redelivery_counter);
        }

        let mut delay = if previous.is_zero() || !self.use_exponential_back_off {
            self.redelivery_delay
        } else {
            scale(previous, self.back_off_multiplier)
        };

        if self.use_collision_avoidance && !delay.is_zero() {
            let factor = self.collision_avoidance_factor;
            let variance = rand::thread_rng().gen_range(-factor..=factor);
            delay = scale(delay, (1.0 + variance).max(0.0));
        }

        if self.use_exponential_back_off && delay > self.maximum_redelivery_delay {
            delay = self.maximum_redelivery_delay;
        }
        delay
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_pattern_tiers() {
        let pattern = DelayPattern::parse("0:250;2:500").unwrap();
        assert_eq!(pattern.delay_for(1), Duration::from_millis(250));
        assert_eq!(pattern.delay_for(2), Duration::from_millis(500));
        assert_eq!(pattern.delay_for(3), Duration::from_millis(500));

        let late_start = DelayPattern::parse("3:1000;5:2000").unwrap();
        assert_eq!(late_start.delay_for(1), Duration::ZERO);
        assert_eq!(late_start.delay_for(4), Duration::from_millis(1000));
    }

    #[test]
    fn test_invalid_delay_pattern() {
        assert!(matches!(
            DelayPattern::parse("0:250;x:500"),
            Err(ConfigError::InvalidDelayPattern { .. })
        ));
        assert!(DelayPattern::parse("250").is_err());
        assert!(DelayPattern::parse("").is_err());
    }

    #[test]
    fn test_should_redeliver() {
        let policy = RedeliveryPolicy::default().maximum_redeliveries(3);
        assert!(policy.should_redeliver(1));
        assert!(policy.should_redeliver(3));
        assert!(!policy.should_redeliver(4));

        assert!(!RedeliveryPolicy::default().should_redeliver(1));
        assert!(RedeliveryPolicy::default().maximum_redeliveries(-1).should_redeliver(10_000));
    }

    #[test]
    fn test_exponential_back_off_capped() {
        let policy = RedeliveryPolicy::default()
            .redelivery_delay(Duration::from_millis(100))
            .exponential_back_off(2.0)
            .maximum_redelivery_delay(Duration::from_millis(300));

        let first = policy.calculate_delay(Duration::ZERO, 1);
        let second = policy.calculate_delay(first, 2);
        let third = policy.calculate_delay(second, 3);
        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(third, Duration::from_millis(300));
    }

    #[test]
    fn test_collision_avoidance_stays_in_range() {
        let policy = RedeliveryPolicy::default()
            .redelivery_delay(Duration::from_millis(1000))
            .collision_avoidance(0.15);
        for _ in 0..50 {
            let delay = policy.calculate_delay(Duration::ZERO, 1).as_millis();
            assert!((849..=1151).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_from_config() {
        let config = RedeliveryConfig {
            maximum_redeliveries: 2,
            delay_pattern: Some("0:10".into()),
            ..RedeliveryConfig::default()
        };
        let policy = RedeliveryPolicy::from_config(&config).unwrap();
        assert_eq!(policy.maximum_redeliveries, 2);
        assert_eq!(policy.calculate_delay(Duration::ZERO, 1), Duration::from_millis(10));
    }
}
