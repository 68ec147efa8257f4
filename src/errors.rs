use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProfileError>;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Server rejected request ({reason}): {}", .message.as_deref().unwrap_or("no message"))]
    Server {
        reason: String,
        message: Option<String>,
    },
    #[error("Quota exceeded: {}", .0.as_deref().unwrap_or("no message"))]
    Quota(Option<String>),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Could not fetch image: {0}")]
    CacheFetch(String),
    #[error("Executor error: {0}")]
    Executor(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parsing error")]
    Parse,
    #[error("Storage error: {0} {1}")]
    Storage(String, String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProfileError {
    /// Reason code plus optional human readable message, as handed to the
    /// presentation layer.
    pub fn failure(&self) -> Failure {
        match self {
            Self::Network(message) => {
                Failure::new(FailureReason::Network, Some(message.clone()))
            }
            Self::Server { reason, message } => Failure::new(
                FailureReason::Server(reason.clone()),
                message.clone(),
            ),
            Self::Quota(message) => {
                Failure::new(FailureReason::Quota, message.clone())
            }
            Self::Validation(message) => {
                Failure::new(FailureReason::Validation, Some(message.clone()))
            }
            Self::CacheFetch(message) => {
                Failure::new(FailureReason::CacheFetch, Some(message.clone()))
            }
            other => {
                Failure::new(FailureReason::Internal, Some(other.to_string()))
            }
        }
    }
}

impl From<serde_json::Error> for ProfileError {
    fn from(_: serde_json::Error) -> Self {
        Self::Parse
    }
}

impl From<url::ParseError> for ProfileError {
    fn from(_: url::ParseError) -> Self {
        Self::Parse
    }
}

impl From<reqwest::Error> for ProfileError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<image::ImageError> for ProfileError {
    fn from(e: image::ImageError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ProfileError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Executor(e.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    Network,
    Server(String),
    Quota,
    Validation,
    CacheFetch,
    Internal,
}

/// Failure reported through a pipeline's failure channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub reason: FailureReason,
    pub message: Option<String>,
}

impl Failure {
    pub fn new(reason: FailureReason, message: Option<String>) -> Self {
        Self { reason, message }
    }
}

impl From<ProfileError> for Failure {
    fn from(e: ProfileError) -> Self {
        e.failure()
    }
}

impl From<Failure> for ProfileError {
    fn from(f: Failure) -> Self {
        match f.reason {
            FailureReason::Network => {
                Self::Network(f.message.unwrap_or_default())
            }
            FailureReason::Server(reason) => Self::Server {
                reason,
                message: f.message,
            },
            FailureReason::Quota => Self::Quota(f.message),
            FailureReason::Validation => {
                Self::Validation(f.message.unwrap_or_default())
            }
            FailureReason::CacheFetch => {
                Self::CacheFetch(f.message.unwrap_or_default())
            }
            FailureReason::Internal => {
                Self::Other(anyhow::anyhow!(f.message.unwrap_or_default()))
            }
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match &self.reason {
            FailureReason::Network => "network".to_owned(),
            FailureReason::Server(code) => format!("server({})", code),
            FailureReason::Quota => "quota".to_owned(),
            FailureReason::Validation => "validation".to_owned(),
            FailureReason::CacheFetch => "cache-fetch".to_owned(),
            FailureReason::Internal => "internal".to_owned(),
        };
        match &self.message {
            Some(message) => write!(f, "{}: {}", reason, message),
            None => f.write_str(&reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_failure_keeps_reason_and_message() {
        let err = ProfileError::Server {
            reason: "username_taken".to_owned(),
            message: Some("Username has been taken".to_owned()),
        };
        let failure = err.failure();
        assert_eq!(
            failure.reason,
            FailureReason::Server("username_taken".to_owned())
        );
        assert_eq!(failure.message.as_deref(), Some("Username has been taken"));
        assert_eq!(
            failure.to_string(),
            "server(username_taken): Username has been taken"
        );
    }

    #[test]
    fn internal_errors_collapse_to_internal_reason() {
        let failure = ProfileError::Parse.failure();
        assert_eq!(failure.reason, FailureReason::Internal);
        assert_eq!(failure.message.as_deref(), Some("Parsing error"));
    }

    #[test]
    fn failure_converts_back_into_error() {
        let failure = Failure::new(FailureReason::Quota, None);
        let err: ProfileError = failure.into();
        assert!(matches!(err, ProfileError::Quota(None)));
    }
}
