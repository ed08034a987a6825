//! Error types for the arbiter SDK

use crate::gateway::GatewayError;
use arbiter_store_client::StoreError;
use thiserror::Error;

/// Result type for SDK operations
pub type Result<T> = std::result::Result<T, SdkError>;

/// SDK error types
#[derive(Error, Debug)]
pub enum SdkError {
    /// Gateway or profile store unreachable, timed out, or unhealthy
    #[error("Transport error: {0}")]
    Transport(String),

    /// Contract, profile, dispute or notification does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Contract state forbids the operation (e.g. a reverted simulation)
    #[error("State error: {0}")]
    State(String),

    /// Malformed event arguments or store documents
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SdkError {
    pub fn is_transport(&self) -> bool {
        matches!(self, SdkError::Transport(_))
    }
}

impl From<StoreError> for SdkError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => SdkError::NotFound(what),
            StoreError::Json(e) => SdkError::Validation(e.to_string()),
            StoreError::InvalidResponse(msg) => SdkError::Validation(msg),
            other => SdkError::Transport(other.to_string()),
        }
    }
}

impl From<GatewayError> for SdkError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(_) | GatewayError::LoadFailed(_) => {
                SdkError::Transport(err.to_string())
            }
            GatewayError::NotDeployed(_) => SdkError::NotFound(err.to_string()),
            GatewayError::Reverted(_) => SdkError::State(err.to_string()),
            GatewayError::Decode(_) => SdkError::Validation(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Validation(err.to_string())
    }
}

impl From<toml::de::Error> for SdkError {
    fn from(err: toml::de::Error) -> Self {
        SdkError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_into_taxonomy() {
        let err: SdkError = StoreError::Server {
            status: 503,
            message: "down".into(),
        }
        .into();
        assert!(err.is_transport());

        let err: SdkError = StoreError::NotFound("0xaa".into()).into();
        assert!(matches!(err, SdkError::NotFound(_)));

        let err: SdkError = StoreError::InvalidResponse("bad".into()).into();
        assert!(matches!(err, SdkError::Validation(_)));
    }

    #[test]
    fn test_reverted_simulation_is_a_state_error() {
        let err: SdkError = GatewayError::Reverted("insufficient balance".into()).into();
        assert!(matches!(err, SdkError::State(msg) if msg.contains("insufficient balance")));
    }
}
