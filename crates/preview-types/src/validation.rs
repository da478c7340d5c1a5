//! Environment spec validation.
//!
//! Everything here is a permanent error: retrying cannot fix it, only an
//! edited spec can.

use crate::environment::{EnvironmentSpec, QuotaOverrides};
use crate::quantity::{parse_cpu_cores, parse_memory_gib};
use std::collections::HashSet;
use thiserror::Error;

/// Maximum length of a DNS-1123 label, and so of every generated name.
pub const MAX_NAME_LENGTH: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("repository '{0}' is not in owner/name form")]
    InvalidRepository(String),

    #[error("pull request number must be positive")]
    InvalidPrNumber,

    #[error("head revision '{0}' is not a 7-40 character hex commit id")]
    InvalidRevision(String),

    #[error("service name '{0}' is not a valid DNS label")]
    InvalidServiceName(String),

    #[error("service '{0}' is listed more than once")]
    DuplicateService(String),

    #[error("no services requested")]
    NoServices,

    #[error("ttl must be positive")]
    InvalidTtl,

    #[error("generated name '{name}' is {len} characters, limit is {max}")]
    NameTooLong { name: String, len: usize, max: usize },

    #[error("quota override {field}: {message}")]
    InvalidQuota { field: &'static str, message: String },
}

impl ValidationError {
    /// Machine-readable reason recorded on the Failed phase
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidRepository(_) => "InvalidRepository",
            Self::InvalidPrNumber => "InvalidPrNumber",
            Self::InvalidRevision(_) => "InvalidRevision",
            Self::InvalidServiceName(_) => "InvalidServiceName",
            Self::DuplicateService(_) => "DuplicateService",
            Self::NoServices => "NoServices",
            Self::InvalidTtl => "InvalidTtl",
            Self::NameTooLong { .. } => "NameTooLong",
            Self::InvalidQuota { .. } => "InvalidQuota",
        }
    }
}

impl EnvironmentSpec {
    /// Validate the desired state.
    ///
    /// The service list may be empty here since services can be detected
    /// from the diff; [`validate_services`] checks the resolved list.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_repository(&self.repository)?;

        if self.pr_number == 0 {
            return Err(ValidationError::InvalidPrNumber);
        }

        validate_revision(&self.head_sha)?;

        if self.ttl.is_zero() {
            return Err(ValidationError::InvalidTtl);
        }

        for service in &self.services {
            validate_service_name(service)?;
        }

        if let Some(overrides) = &self.resources {
            validate_quota_overrides(overrides)?;
        }

        Ok(())
    }
}

/// Validate a resolved, non-empty service list
pub fn validate_services(services: &[String]) -> Result<(), ValidationError> {
    if services.is_empty() {
        return Err(ValidationError::NoServices);
    }

    let mut seen = HashSet::new();
    for service in services {
        validate_service_name(service)?;
        if !seen.insert(service.as_str()) {
            return Err(ValidationError::DuplicateService(service.clone()));
        }
    }
    Ok(())
}

/// Validate one service name as a DNS-1123 label
pub fn validate_service_name(service: &str) -> Result<(), ValidationError> {
    validate_dns_label(service)
        .map_err(|_| ValidationError::InvalidServiceName(service.to_string()))
}

/// Validate a generated name against the label length budget
pub fn validate_name_length(name: &str) -> Result<(), ValidationError> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(ValidationError::NameTooLong {
            name: name.to_string(),
            len: name.len(),
            max: MAX_NAME_LENGTH,
        });
    }
    Ok(())
}

fn validate_repository(repository: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidRepository(repository.to_string());

    let (owner, name) = repository.split_once('/').ok_or_else(invalid)?;
    for segment in [owner, name] {
        let ok = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !ok {
            return Err(invalid());
        }
    }
    Ok(())
}

fn validate_revision(revision: &str) -> Result<(), ValidationError> {
    let ok = (7..=40).contains(&revision.len()) && revision.chars().all(|c| c.is_ascii_hexdigit());
    if !ok {
        return Err(ValidationError::InvalidRevision(revision.to_string()));
    }
    Ok(())
}

fn validate_dns_label(label: &str) -> Result<(), ()> {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LENGTH {
        return Err(());
    }

    let valid_char = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-';
    if !bytes.iter().all(valid_char) {
        return Err(());
    }

    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return Err(());
    }
    Ok(())
}

fn validate_quota_overrides(overrides: &QuotaOverrides) -> Result<(), ValidationError> {
    let cpu_fields = [
        ("cpuRequests", &overrides.cpu_requests),
        ("cpuLimits", &overrides.cpu_limits),
    ];
    for (field, value) in cpu_fields {
        if let Some(value) = value {
            parse_cpu_cores(value).map_err(|e| ValidationError::InvalidQuota {
                field,
                message: e.to_string(),
            })?;
        }
    }

    let memory_fields = [
        ("memoryRequests", &overrides.memory_requests),
        ("memoryLimits", &overrides.memory_limits),
    ];
    for (field, value) in memory_fields {
        if let Some(value) = value {
            parse_memory_gib(value).map_err(|e| ValidationError::InvalidQuota {
                field,
                message: e.to_string(),
            })?;
        }
    }

    Ok(())
}
