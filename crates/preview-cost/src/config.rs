//! Pricing configuration

use crate::error::{CostError, Result};
use serde::{Deserialize, Serialize};

/// Rates used to price resource requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Price of one CPU core for one hour
    #[serde(default = "default_cpu_hour_rate")]
    pub cpu_hour_rate: f64,

    /// Price of one GiB of memory for one hour
    #[serde(default = "default_memory_gib_hour_rate")]
    pub memory_gib_hour_rate: f64,

    /// Fraction taken off when spot pricing applies, in `[0, 1)`
    #[serde(default = "default_spot_discount")]
    pub spot_discount: f64,

    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            cpu_hour_rate: default_cpu_hour_rate(),
            memory_gib_hour_rate: default_memory_gib_hour_rate(),
            spot_discount: default_spot_discount(),
            currency: default_currency(),
        }
    }
}

impl PricingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.cpu_hour_rate.is_finite() && self.cpu_hour_rate >= 0.0) {
            return Err(CostError::InvalidPricing(format!(
                "cpu_hour_rate must be a non-negative number, got {}",
                self.cpu_hour_rate
            )));
        }
        if !(self.memory_gib_hour_rate.is_finite() && self.memory_gib_hour_rate >= 0.0) {
            return Err(CostError::InvalidPricing(format!(
                "memory_gib_hour_rate must be a non-negative number, got {}",
                self.memory_gib_hour_rate
            )));
        }
        if !(0.0..1.0).contains(&self.spot_discount) {
            return Err(CostError::InvalidPricing(format!(
                "spot_discount must be in [0, 1), got {}",
                self.spot_discount
            )));
        }
        if self.currency.trim().is_empty() {
            return Err(CostError::InvalidPricing("currency must not be empty".into()));
        }
        Ok(())
    }

    /// Multiplier applied to on-demand prices
    pub(crate) fn price_factor(&self, use_spot: bool) -> f64 {
        if use_spot {
            1.0 - self.spot_discount
        } else {
            1.0
        }
    }
}

fn default_cpu_hour_rate() -> f64 {
    0.04
}

fn default_memory_gib_hour_rate() -> f64 {
    0.005
}

fn default_spot_discount() -> f64 {
    0.30
}

fn default_currency() -> String {
    "USD".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(PricingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let negative = PricingConfig {
            cpu_hour_rate: -0.01,
            ..Default::default()
        };
        assert!(negative.validate().is_err());

        let full_discount = PricingConfig {
            spot_discount: 1.0,
            ..Default::default()
        };
        assert!(full_discount.validate().is_err());

        let no_currency = PricingConfig {
            currency: " ".into(),
            ..Default::default()
        };
        assert!(no_currency.validate().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: PricingConfig = serde_json::from_str(r#"{"currency":"EUR"}"#).unwrap();
        assert_eq!(config.currency, "EUR");
        assert_eq!(config.cpu_hour_rate, 0.04);
        assert_eq!(config.spot_discount, 0.30);
    }
}
