//! Space allocation strategies
//!
//! A strategy decides how many bytes to reserve for a payload. Reserving more
//! than the payload needs trades space for fewer relocations when the record
//! grows later. Strategies are pure functions of sizes and are shared by all
//! callers of a storage.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Capacity policy for new and relocated records
pub trait SpaceAllocationStrategy: Send + Sync + Debug {
    /// Capacity to reserve for a payload of `payload_len` bytes
    ///
    /// Must be at least `payload_len`.
    fn capacity_for(&self, payload_len: usize) -> usize;

    /// Whether a slot of `existing_capacity` may hold a payload of `payload_len`
    fn can_reuse(&self, existing_capacity: usize, payload_len: usize) -> bool {
        payload_len <= existing_capacity
    }

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Capacity is exactly the payload length: no slack, most relocations
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactFit;

impl SpaceAllocationStrategy for ExactFit {
    fn capacity_for(&self, payload_len: usize) -> usize {
        payload_len
    }

    fn name(&self) -> &'static str {
        "exact_fit"
    }
}

/// Capacity is the next power of two, never below `min_capacity`
#[derive(Debug, Clone, Copy)]
pub struct PowerOfTwo {
    min_capacity: usize,
}

impl PowerOfTwo {
    pub fn new(min_capacity: usize) -> Self {
        Self { min_capacity }
    }
}

impl SpaceAllocationStrategy for PowerOfTwo {
    fn capacity_for(&self, payload_len: usize) -> usize {
        payload_len
            .max(self.min_capacity)
            .checked_next_power_of_two()
            .unwrap_or(usize::MAX)
    }

    fn name(&self) -> &'static str {
        "power_of_two"
    }
}

/// Capacity is the payload plus a fixed percentage on top
#[derive(Debug, Clone, Copy)]
pub struct PercentSlack {
    min_capacity: usize,
    percent_on_top: usize,
}

impl PercentSlack {
    pub fn new(min_capacity: usize, percent_on_top: usize) -> Self {
        Self {
            min_capacity,
            percent_on_top,
        }
    }
}

impl SpaceAllocationStrategy for PercentSlack {
    fn capacity_for(&self, payload_len: usize) -> usize {
        let slack = payload_len
            .saturating_mul(self.percent_on_top)
            .div_ceil(100);
        payload_len.saturating_add(slack).max(self.min_capacity)
    }

    fn name(&self) -> &'static str {
        "percent_slack"
    }
}

/// Serializable strategy choice, see [`StrategyConfig::build`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    ExactFit,
    PowerOfTwo { min_capacity: usize },
    PercentSlack { min_capacity: usize, percent_on_top: usize },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::PercentSlack {
            min_capacity: 64,
            percent_on_top: 30,
        }
    }
}

impl StrategyConfig {
    /// Instantiate the configured strategy
    pub fn build(&self) -> Box<dyn SpaceAllocationStrategy> {
        match *self {
            StrategyConfig::ExactFit => Box::new(ExactFit),
            StrategyConfig::PowerOfTwo { min_capacity } => Box::new(PowerOfTwo::new(min_capacity)),
            StrategyConfig::PercentSlack {
                min_capacity,
                percent_on_top,
            } => Box::new(PercentSlack::new(min_capacity, percent_on_top)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            StrategyConfig::PercentSlack { percent_on_top, .. } if percent_on_top > 1000 => Err(
                Error::Config(format!("percent_on_top {} exceeds 1000", percent_on_top)),
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_fit() {
        let strategy = ExactFit;
        assert_eq!(strategy.capacity_for(0), 0);
        assert_eq!(strategy.capacity_for(10), 10);
        assert!(strategy.can_reuse(10, 10));
        assert!(!strategy.can_reuse(10, 11));
    }

    #[test]
    fn test_power_of_two() {
        let strategy = PowerOfTwo::new(16);
        assert_eq!(strategy.capacity_for(1), 16);
        assert_eq!(strategy.capacity_for(16), 16);
        assert_eq!(strategy.capacity_for(17), 32);
        assert_eq!(strategy.capacity_for(1000), 1024);
    }

    #[test]
    fn test_power_of_two_saturates() {
        let strategy = PowerOfTwo::new(1);
        assert_eq!(strategy.capacity_for(usize::MAX - 1), usize::MAX);
    }

    #[test]
    fn test_percent_slack() {
        let strategy = PercentSlack::new(64, 30);
        assert_eq!(strategy.capacity_for(10), 64);
        assert_eq!(strategy.capacity_for(100), 130);
        assert_eq!(strategy.capacity_for(101), 132);
    }

    #[test]
    fn test_capacity_never_below_payload() {
        let strategies: Vec<Box<dyn SpaceAllocationStrategy>> = vec![
            StrategyConfig::ExactFit.build(),
            StrategyConfig::PowerOfTwo { min_capacity: 8 }.build(),
            StrategyConfig::default().build(),
        ];
        for strategy in &strategies {
            for len in [0usize, 1, 7, 63, 64, 65, 4095, 70_000] {
                assert!(
                    strategy.capacity_for(len) >= len,
                    "{} gave less than {}",
                    strategy.name(),
                    len
                );
            }
        }
    }

    #[test]
    fn test_config_validate() {
        assert!(StrategyConfig::default().validate().is_ok());
        let bad = StrategyConfig::PercentSlack {
            min_capacity: 0,
            percent_on_top: 5000,
        };
        assert!(bad.validate().is_err());
    }
}
