//! Cost estimation errors

use preview_types::QuantityError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CostError {
    /// A container request could not be parsed
    #[error("pod {pod} container {container}: {resource} request: {source}")]
    InvalidQuantity {
        pod: String,
        container: String,
        resource: &'static str,
        #[source]
        source: QuantityError,
    },

    /// Rejected pricing update
    #[error("invalid pricing: {0}")]
    InvalidPricing(String),
}

pub type Result<T> = std::result::Result<T, CostError>;
