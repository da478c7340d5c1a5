//! Preview Cost - resource-to-price estimation
//!
//! The estimator sums CPU and memory *requests* across a set of pods and
//! prices them per hour. Pricing lives in a [`PricingHandle`], a shared cell
//! that many ticks read concurrently while an operator occasionally swaps in
//! new rates; each calculation takes one consistent snapshot.
//!
//! ```
//! use preview_cost::{CostEstimator, PricingConfig, PricingHandle};
//! use std::time::Duration;
//!
//! let estimator = CostEstimator::new(PricingHandle::new(PricingConfig::default()).unwrap());
//! let estimate = estimator
//!     .estimate_environment_cost(&[], Duration::from_secs(3600), false)
//!     .unwrap();
//! assert_eq!(estimate.total_cost, "0.0000");
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod estimator;
pub mod pricing;

pub use config::PricingConfig;
pub use error::{CostError, Result};
pub use estimator::{format_amount, ActualCost, CostEstimate, CostEstimator};
pub use pricing::PricingHandle;
