//! Shared pricing cell

use crate::config::PricingConfig;
use crate::error::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// Read/write-locked pricing configuration.
///
/// Clones share the same cell. Readers take a full snapshot under the read
/// lock; [`PricingHandle::update`] replaces the whole configuration under the
/// write lock, so no reader sees a half-applied change.
#[derive(Debug, Clone)]
pub struct PricingHandle {
    inner: Arc<RwLock<PricingConfig>>,
}

impl PricingHandle {
    pub fn new(config: PricingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
        })
    }

    /// Consistent copy of the current configuration
    pub fn snapshot(&self) -> PricingConfig {
        self.inner.read().clone()
    }

    /// Validate and swap in a new configuration
    pub fn update(&self, config: PricingConfig) -> Result<()> {
        config.validate()?;
        let mut current = self.inner.write();
        info!(
            cpu_hour_rate = config.cpu_hour_rate,
            memory_gib_hour_rate = config.memory_gib_hour_rate,
            spot_discount = config.spot_discount,
            currency = %config.currency,
            "Pricing updated"
        );
        *current = config;
        Ok(())
    }
}
