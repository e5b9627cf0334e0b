use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Command {0} timed out waiting for device confirmation")]
    CommandTimeout(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Invalid transport configuration: {0}")]
    InvalidTransportConfig(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] anyhow::Error),
}

impl DomainError {
    /// Transient errors leave the operation retryable; the caller keeps its
    /// buffered work instead of dropping it.
    pub fn is_transient(&self) -> bool {
        matches!(self, DomainError::TransportUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_unavailable_is_transient() {
        assert!(DomainError::TransportUnavailable("broker down".to_string()).is_transient());
        assert!(!DomainError::ValidationError("bad".to_string()).is_transient());
        assert!(!DomainError::PersistenceFailure(anyhow::anyhow!("boom")).is_transient());
    }

    #[test]
    fn test_persistence_failure_from_anyhow() {
        let err: DomainError = anyhow::anyhow!("connection reset").into();
        assert_eq!(err.to_string(), "Persistence failure: connection reset");
    }
}
