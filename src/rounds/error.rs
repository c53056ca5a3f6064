//! Round engine error taxonomy.

use serde_json::Value;
use std::fmt;

pub const INVALID_TRANSITION: &str = "INVALID_TRANSITION";
pub const INVALID_ROUND_STATUS: &str = "INVALID_ROUND_STATUS";
pub const CONCURRENT_TRANSITION: &str = "CONCURRENT_TRANSITION";
pub const PAYOUTS_ALREADY_WRITTEN: &str = "PAYOUTS_ALREADY_WRITTEN";

#[derive(Debug)]
pub enum RoundError {
    /// Malformed identifier or missing transition metadata. Never retried.
    Validation {
        message: String,
        missing_fields: Vec<String>,
    },
    /// Referenced round or bet does not exist.
    NotFound { entity: &'static str, id: String },
    /// Illegal transition or operation for the current round status.
    BusinessRule {
        code: &'static str,
        message: String,
        details: Value,
    },
    /// Storage failure, propagated unchanged from the repository.
    Persistence(anyhow::Error),
}

impl RoundError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            missing_fields: Vec::new(),
        }
    }

    pub fn missing_fields(message: impl Into<String>, fields: Vec<String>) -> Self {
        Self::Validation {
            message: message.into(),
            missing_fields: fields,
        }
    }

    pub fn round_not_found(id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity: "round",
            id: id.to_string(),
        }
    }

    pub fn business(code: &'static str, message: impl Into<String>, details: Value) -> Self {
        Self::BusinessRule {
            code,
            message: message.into(),
            details,
        }
    }

    /// Only storage failures are worth retrying at the scheduler level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::BusinessRule { code, .. } => code,
            Self::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

impl fmt::Display for RoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation {
                message,
                missing_fields,
            } => {
                if missing_fields.is_empty() {
                    write!(f, "Validation failed: {}", message)
                } else {
                    write!(
                        f,
                        "Validation failed: {} (missing: {})",
                        message,
                        missing_fields.join(", ")
                    )
                }
            }
            Self::NotFound { entity, id } => write!(f, "{} not found: {}", entity, id),
            Self::BusinessRule { code, message, .. } => write!(f, "[{}] {}", code, message),
            Self::Persistence(e) => write!(f, "Persistence error: {:#}", e),
        }
    }
}

impl std::error::Error for RoundError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persistence(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for RoundError {
    fn from(e: anyhow::Error) -> Self {
        Self::Persistence(e)
    }
}

pub type RoundResult<T> = std::result::Result<T, RoundError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_display_lists_missing_fields() {
        let err = RoundError::missing_fields(
            "SCHEDULED -> BETTING_OPEN",
            vec!["goldStartPrice".into(), "bettingOpenedAt".into()],
        );
        assert_eq!(
            err.to_string(),
            "Validation failed: SCHEDULED -> BETTING_OPEN (missing: goldStartPrice, bettingOpenedAt)"
        );
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_only_persistence_is_retryable() {
        assert!(RoundError::from(anyhow::anyhow!("disk full")).is_retryable());
        assert!(!RoundError::round_not_found("x").is_retryable());
        assert!(!RoundError::business(INVALID_TRANSITION, "nope", json!({})).is_retryable());
    }
}
