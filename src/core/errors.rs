use axum::http::StatusCode;
use thiserror::Error;

/// Pre-flight rejections carry no side effects: no reservation is taken and
/// no execution row is written before one of these is returned.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent is not active: {0}")]
    AgentNotActive(String),

    #[error("no connected {platform} account for this agent")]
    AccountNotConnected { platform: String },

    #[error("connected {platform} account is {status}, reconnect required")]
    AccountExpired { platform: String, status: String },

    #[error("input validation failed: {}", .0.join("; "))]
    InvalidInput(Vec<String>),

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("too many concurrent executions for this user (cap {cap})")]
    TooManyExecutions { cap: usize },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    /// Stable machine-readable code, persisted in execution error detail and
    /// returned in API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::AgentNotFound(_) => "AgentNotFound",
            DispatchError::AgentNotActive(_) => "AgentNotActive",
            DispatchError::AccountNotConnected { .. } => "AccountNotConnected",
            DispatchError::AccountExpired { .. } => "AccountExpired",
            DispatchError::InvalidInput(_) => "InvalidInput",
            DispatchError::InsufficientCredits { .. } => "InsufficientCredits",
            DispatchError::TooManyExecutions { .. } => "TooManyExecutions",
            DispatchError::Internal(_) => "Internal",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            DispatchError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::AgentNotActive(_) => StatusCode::CONFLICT,
            DispatchError::AccountNotConnected { .. } => StatusCode::BAD_REQUEST,
            DispatchError::AccountExpired { .. } => StatusCode::BAD_REQUEST,
            DispatchError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DispatchError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            DispatchError::TooManyExecutions { .. } => StatusCode::TOO_MANY_REQUESTS,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(DispatchError::AgentNotFound("x".into()).code(), "AgentNotFound");
        assert_eq!(
            DispatchError::InsufficientCredits {
                required: 10,
                available: 5
            }
            .code(),
            "InsufficientCredits"
        );
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(
            DispatchError::AgentNotFound("x".into()).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DispatchError::AgentNotActive("x".into()).http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            DispatchError::InsufficientCredits {
                required: 10,
                available: 0
            }
            .http_status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            DispatchError::TooManyExecutions { cap: 4 }.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn invalid_input_lists_fields() {
        let err = DispatchError::InvalidInput(vec![
            "missing required field 'query'".to_string(),
            "field 'limit' expected integer".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("query"));
        assert!(msg.contains("limit"));
    }
}
