use std::{net::IpAddr, time::Duration};

use tracing_subscriber::EnvFilter;

use crate::config::models::AppConfig;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Application configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire configuration, reporting every problem at once.
    pub fn validate(config: &AppConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_host(&config.host) {
            errors.push(e);
        }

        if let Err(e) = Self::validate_log_level(&config.log_level) {
            errors.push(e);
        }

        if config.shutdown.hang_report_interval == Duration::ZERO {
            errors.push(ValidationError::InvalidField {
                field: "shutdown.hang_report_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(&errors),
            }),
        }
    }

    /// The host must be an IP literal; an empty host means "pick a loopback address".
    pub fn validate_host(host: &str) -> ValidationResult<Option<IpAddr>> {
        if host.is_empty() {
            return Ok(None);
        }
        host.parse::<IpAddr>()
            .map(Some)
            .map_err(|e| ValidationError::InvalidHost {
                host: host.to_string(),
                reason: e.to_string(),
            })
    }

    fn validate_log_level(level: &str) -> ValidationResult<()> {
        EnvFilter::try_new(level)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidField {
                field: "log_level".to_string(),
                message: e.to_string(),
            })
    }

    fn format_multiple_errors(errors: &[ValidationError]) -> String {
        let mut message = format!("{} configuration errors:", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("\n  {}. {}", i + 1, error));
        }
        message
    }
}
