//! Resource quantity parsing (`500m`, `2`, `512Mi`, `4Gi`).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid number in quantity '{0}'")]
    InvalidNumber(String),

    #[error("unknown suffix '{suffix}' in quantity '{quantity}'")]
    UnknownSuffix { quantity: String, suffix: String },
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Parse a CPU quantity into cores
pub fn parse_cpu_cores(quantity: &str) -> Result<f64, QuantityError> {
    let (value, suffix) = split(quantity)?;
    let scale = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "u" => 1e-6,
        "n" => 1e-9,
        other => {
            return Err(QuantityError::UnknownSuffix {
                quantity: quantity.to_string(),
                suffix: other.to_string(),
            })
        }
    };
    Ok(value * scale)
}

/// Parse a memory quantity into GiB
pub fn parse_memory_gib(quantity: &str) -> Result<f64, QuantityError> {
    let (value, suffix) = split(quantity)?;
    let bytes_per_unit = match suffix {
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => GIB,
        "Ti" => GIB * 1024.0,
        "Pi" => GIB * 1024.0 * 1024.0,
        "Ei" => GIB * 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(QuantityError::UnknownSuffix {
                quantity: quantity.to_string(),
                suffix: other.to_string(),
            })
        }
    };
    Ok(value * bytes_per_unit / GIB)
}

fn split(quantity: &str) -> Result<(f64, &str), QuantityError> {
    let trimmed = quantity.trim();
    if trimmed.is_empty() {
        return Err(QuantityError::Empty);
    }

    let boundary = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(boundary);

    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::InvalidNumber(quantity.to_string()))?;
    if !value.is_finite() {
        return Err(QuantityError::InvalidNumber(quantity.to_string()));
    }
    Ok((value, suffix))
}
