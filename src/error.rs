use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that end a connect/stream cycle or stop the process.
///
/// Everything except [`RelayError::RunnerExited`] and
/// [`RelayError::RunnerPanicked`] is recoverable: a runner logs it and
/// reconnects after a backoff delay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration file missing or malformed.
    #[error("failed to load configuration from {path}: {message}")]
    Config {
        path: PathBuf,
        message: String,
    },

    /// Cursor file exists but could not be read.
    #[error("failed to read cursor file {path}: {source}")]
    CursorRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The streaming collaborator refused or failed to open a stream.
    #[error("failed to open event stream: {message}")]
    StreamOpen {
        message: String,
    },

    /// The stream yielded an error after it was opened.
    #[error("event stream failed: {message}")]
    Stream {
        message: String,
    },

    /// The stream finished without an error.
    #[error("event stream ended")]
    StreamEnded,

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    /// A runner returned. Runners loop forever, so this is fatal.
    #[error("subscription {name} stopped unexpectedly")]
    RunnerExited {
        name: String,
    },

    /// A runner panicked.
    #[error("subscription {name} panicked: {message}")]
    RunnerPanicked {
        name: String,
        message: String,
    },
}

impl RelayError {
    pub fn stream_open(message: impl Into<String>) -> Self {
        Self::StreamOpen { message: message.into() }
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream { message: message.into() }
    }

    /// Whether a runner survives this error by backing off and reconnecting.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::RunnerExited { .. } | Self::RunnerPanicked { .. })
    }
}

/// Final outcome of a single webhook delivery attempt.
///
/// Purely observational: outcomes are logged and never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(FailureReason),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Reasons why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Endpoint answered with anything other than 200.
    Status {
        status: u16,
        body: String,
    },
    Timeout,
    Network(String),
    Serialization(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Status { status, .. } =>
                write!(f, "endpoint returned status {}", status),
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Network(message) =>
                write!(f, "network error: {}", message),
            FailureReason::Serialization(message) =>
                write!(f, "failed to serialize event: {}", message),
        }
    }
}
