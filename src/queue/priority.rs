//! Priority scoring of submitted transfers.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::PriorityConfig;

/// Weighted blend of the fee hint and the (capped) amount. Higher is claimed first.
#[derive(Debug, Clone, Copy)]
pub struct PriorityPolicy {
    config: PriorityConfig,
}

impl PriorityPolicy {
    pub fn new(config: PriorityConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, gas_price: Decimal, amount: Decimal) -> f64 {
        let capped = amount.min(self.config.amount_cap);
        let gas = gas_price.to_f64().unwrap_or(f64::MAX);
        let amount = capped.to_f64().unwrap_or(0.0);
        self.config.gas_weight * gas + self.config.amount_weight * amount
    }
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self::new(PriorityConfig::default())
    }
}
