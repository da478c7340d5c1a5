//! Cost Estimator

use crate::config::PricingConfig;
use crate::error::{CostError, Result};
use crate::pricing::PricingHandle;
use chrono::{DateTime, Utc};
use preview_types::{parse_cpu_cores, parse_memory_gib, CostSnapshot, Pod};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SECS_PER_HOUR: f64 = 3600.0;

/// Projected cost of an environment over its TTL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub currency: String,
    /// Fixed 4-decimal string
    pub hourly_cost: String,
    /// Fixed 4-decimal string
    pub total_cost: String,
}

impl CostEstimate {
    /// Status snapshot for this estimate, keeping any recorded actual cost
    pub fn into_snapshot(
        self,
        actual_cost: Option<String>,
        calculated_at: DateTime<Utc>,
    ) -> CostSnapshot {
        CostSnapshot {
            currency: self.currency,
            hourly_cost: self.hourly_cost,
            total_cost: self.total_cost,
            actual_cost,
            calculated_at,
        }
    }
}

/// Cost actually incurred by one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActualCost {
    pub namespace: String,
    pub currency: String,
    /// Fixed 4-decimal string
    pub total_cost: String,
}

/// Format a monetary amount with exactly four decimals
pub fn format_amount(amount: f64) -> String {
    format!("{:.4}", amount)
}

/// Prices pod resource requests against the shared pricing configuration
#[derive(Debug, Clone)]
pub struct CostEstimator {
    pricing: PricingHandle,
}

impl CostEstimator {
    pub fn new(pricing: PricingHandle) -> Self {
        Self { pricing }
    }

    pub fn pricing(&self) -> &PricingHandle {
        &self.pricing
    }

    /// Cost of running `pod` for `duration`.
    ///
    /// Requests are summed across containers; a container with no request
    /// contributes nothing.
    pub fn calculate_unit_cost(&self, pod: &Pod, duration: Duration, use_spot: bool) -> Result<f64> {
        let pricing = self.pricing.snapshot();
        unit_cost(&pricing, pod, duration, use_spot)
    }

    /// Hourly and TTL-total cost of `pods`
    pub fn estimate_environment_cost(
        &self,
        pods: &[Pod],
        ttl: Duration,
        use_spot: bool,
    ) -> Result<CostEstimate> {
        let pricing = self.pricing.snapshot();
        let mut hourly = 0.0;
        for pod in pods {
            hourly += unit_cost(&pricing, pod, Duration::from_secs(3600), use_spot)?;
        }
        let total = hourly * hours(ttl);

        debug!(pods = pods.len(), hourly, total, use_spot, "Environment cost estimated");
        Ok(CostEstimate {
            currency: pricing.currency,
            hourly_cost: format_amount(hourly),
            total_cost: format_amount(total),
        })
    }

    /// Cost incurred by the pods of `namespace` over `actual_duration`.
    ///
    /// Pods belonging to other namespaces are ignored.
    pub fn track_actual_cost(
        &self,
        namespace: &str,
        pods: &[Pod],
        actual_duration: Duration,
        use_spot: bool,
    ) -> Result<ActualCost> {
        let pricing = self.pricing.snapshot();
        let mut total = 0.0;
        for pod in pods
            .iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
        {
            total += unit_cost(&pricing, pod, actual_duration, use_spot)?;
        }

        debug!(namespace, total, "Actual cost tracked");
        Ok(ActualCost {
            namespace: namespace.to_string(),
            currency: pricing.currency,
            total_cost: format_amount(total),
        })
    }
}

fn hours(duration: Duration) -> f64 {
    duration.as_secs_f64() / SECS_PER_HOUR
}

fn unit_cost(pricing: &PricingConfig, pod: &Pod, duration: Duration, use_spot: bool) -> Result<f64> {
    let mut cores = 0.0;
    let mut gib = 0.0;
    for container in &pod.containers {
        let requests = &container.resources.requests;
        if let Some(cpu) = requests.get("cpu") {
            cores += parse_cpu_cores(cpu).map_err(|source| CostError::InvalidQuantity {
                pod: pod.metadata.name.clone(),
                container: container.name.clone(),
                resource: "cpu",
                source,
            })?;
        }
        if let Some(memory) = requests.get("memory") {
            gib += parse_memory_gib(memory).map_err(|source| CostError::InvalidQuantity {
                pod: pod.metadata.name.clone(),
                container: container.name.clone(),
                resource: "memory",
                source,
            })?;
        }
    }

    let hourly = cores * pricing.cpu_hour_rate + gib * pricing.memory_gib_hour_rate;
    Ok(hourly * hours(duration) * pricing.price_factor(use_spot))
}
