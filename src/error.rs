use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MillworkError {
    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("No handler registered for function: {function_name}")]
    HandlerNotFound { function_name: String },

    #[error("Handler error: {message}")]
    Handler { message: String },

    #[error("Job timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Claim lost for job {job_id}")]
    ClaimLost { job_id: String },

    #[error("Job aborted: {job_id}")]
    Aborted { job_id: String },

    #[error("Job expired before it could run: {job_id}")]
    Expired { job_id: String },

    #[error("Cron error: {0}")]
    Cron(#[from] crate::cron::CronError),

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MillworkError {
    /// True for transient store failures that loops should back off and retry.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, MillworkError::StoreUnavailable { .. })
    }
}

impl From<serde_json::Error> for MillworkError {
    fn from(err: serde_json::Error) -> Self {
        MillworkError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<base64::DecodeError> for MillworkError {
    fn from(err: base64::DecodeError) -> Self {
        MillworkError::Serialization {
            message: format!("base64 decoding error: {}", err),
        }
    }
}

#[cfg(feature = "msgpack")]
impl From<rmp_serde::encode::Error> for MillworkError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        MillworkError::Serialization {
            message: format!("MessagePack encoding error: {}", err),
        }
    }
}

#[cfg(feature = "msgpack")]
impl From<rmp_serde::decode::Error> for MillworkError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        MillworkError::Serialization {
            message: format!("MessagePack decoding error: {}", err),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for MillworkError {
    fn from(err: redis::RedisError) -> Self {
        MillworkError::StoreUnavailable {
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for MillworkError {
    fn from(err: toml::de::Error) -> Self {
        MillworkError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for MillworkError {
    fn from(err: toml::ser::Error) -> Self {
        MillworkError::Config(format!("TOML serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let worker_error = MillworkError::Worker {
            message: "Test worker error".to_string(),
        };
        assert_eq!(worker_error.to_string(), "Worker error: Test worker error");

        let not_found = MillworkError::HandlerNotFound {
            function_name: "resize_image".to_string(),
        };
        assert_eq!(
            not_found.to_string(),
            "No handler registered for function: resize_image"
        );

        let timeout = MillworkError::Timeout {
            timeout: Duration::from_secs(30),
        };
        assert_eq!(timeout.to_string(), "Job timed out after 30s");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_error.is_err());

        let error: MillworkError = json_error.unwrap_err().into();
        assert!(matches!(error, MillworkError::Serialization { .. }));
    }

    #[test]
    fn test_store_unavailable_classification() {
        let store = MillworkError::StoreUnavailable {
            message: "connection refused".to_string(),
        };
        assert!(store.is_store_unavailable());

        let lost = MillworkError::ClaimLost {
            job_id: "abc".to_string(),
        };
        assert!(!lost.is_store_unavailable());
    }
}
