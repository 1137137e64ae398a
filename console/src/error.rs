use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Error body returned by the backend on non-success responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorResponse {
    pub message: Option<String>,
    pub error: Option<String>,
    pub status: Option<u16>,
    pub path: Option<String>,
    pub details: Option<Value>,
}

impl ErrorResponse {
    /// Most specific human-readable text in the body, if any.
    pub fn best_message(&self) -> Option<&str> {
        self.message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.error.as_deref().filter(|e| !e.trim().is_empty()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Rejected locally, no request was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid request URL for {path}: {reason}")]
    InvalidUrl { path: String, reason: String },

    #[error("HTTP {method} {url} failed: {source}")]
    Transport {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {method} {url} failed: status={status} message={message}")]
    Status {
        method: String,
        url: String,
        status: u16,
        message: String,
    },

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CommandError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Short text suitable for an operator-facing log line.
    pub fn user_message(&self) -> String {
        match self {
            Self::Status { status, message, .. } if message.is_empty() => {
                format!("request failed with status {}", status)
            }
            Self::Status { message, .. } => message.clone(),
            Self::InvalidRequest(reason) => reason.clone(),
            Self::Transport { source, .. } if source.is_timeout() => "request timed out".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("no heartbeat received within {0:?}")]
    HeartbeatTimeout(Duration),

}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("no subscription matches topic {0}")]
    UnknownTopic(String),

    #[error("malformed payload on {topic}: {source}")]
    Malformed {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("a batch is already running")]
    AlreadyRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_message_prefers_message_over_error() {
        let body: ErrorResponse = serde_json::from_str(
            r#"{"status":404,"error":"Not Found","message":"Code package c9 not found","path":"/api/migrations"}"#,
        )
        .unwrap();
        assert_eq!(body.best_message(), Some("Code package c9 not found"));

        let body: ErrorResponse = serde_json::from_str(r#"{"error":"Bad Request","message":""}"#).unwrap();
        assert_eq!(body.best_message(), Some("Bad Request"));
    }

    #[test]
    fn test_status_user_message() {
        let err = CommandError::Status {
            method: "POST".into(),
            url: "http://localhost/api/migrations".into(),
            status: 500,
            message: String::new(),
        };
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.user_message(), "request failed with status 500");
    }
}
