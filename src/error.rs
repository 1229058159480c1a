use thiserror::Error;

/// Errors raised while talking to the gateway or decoding what it sends.
///
/// Everything here is recoverable at the call site; the workers decide
/// whether a failure is charged to a failure budget or escalated.
#[derive(Debug, Error)]
pub enum EnvoyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("{resource} answered with HTTP status {status}")]
    Status { resource: String, status: u16 },
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("No snapshot available yet")]
    NotReady,
}

impl EnvoyError {
    /// Timeouts are the only failures the stream reader retries quickly.
    pub fn is_timeout(&self) -> bool {
        match self {
            EnvoyError::Timeout(_) => true,
            EnvoyError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        EnvoyError::Decode(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EnvoyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(EnvoyError::Timeout("stream chunk".into()).is_timeout());
        assert!(!EnvoyError::decode("missing field `p`").is_timeout());
        assert!(!EnvoyError::Status {
            resource: "/stream/meter".into(),
            status: 401
        }
        .is_timeout());
    }

    #[test]
    fn test_status_message() {
        let err = EnvoyError::Status {
            resource: "/production.json".into(),
            status: 500,
        };
        assert_eq!(
            err.to_string(),
            "/production.json answered with HTTP status 500"
        );
    }
}
