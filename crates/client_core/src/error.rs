use std::time::Duration;

use thiserror::Error;

/// Every way a graceful stop can fail. Each variant terminates the whole call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("transport error calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },
    #[error("event channel {url} failed: {message}")]
    Connection { url: String, message: String },
    #[error("invalid system configuration: {0}")]
    Configuration(String),
    #[error("remote system reported an error: {0}")]
    RemoteReported(String),
    #[error("graceful stop was cancelled")]
    Cancelled,
    #[error("timed out after {0:?} waiting for the system to become ready to shut down")]
    TimedOut(Duration),
}

impl ShutdownError {
    pub fn transport(endpoint: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn connection(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            url: url.into(),
            message: message.to_string(),
        }
    }
}
