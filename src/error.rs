//! Driver error taxonomy.

use crate::retryability::server_code_name;

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Label servers attach to errors the change-stream resume protocol may
/// recover from.
pub const RESUMABLE_CHANGE_STREAM_LABEL: &str = "ResumableChangeStreamError";

/// Errors surfaced by the driver core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Transport-level failure: socket close, read/write failure,
    /// connection reset.
    #[error("Network error: {message}")]
    Network {
        /// Description from the transport layer.
        message: String,
    },

    /// Error response to a server command.
    #[error("Server error {code} ({code_name}): {message}")]
    Server {
        /// Numeric server error code.
        code: i32,
        /// Symbolic name of the code, when known.
        code_name: &'static str,
        /// Message from the server.
        message: String,
        /// Error labels attached by the server.
        labels: Vec<String>,
    },

    /// The server rejected the caller's credentials or privileges.
    #[error("Authorization failure: {message}")]
    Authorization {
        /// Description of the rejected action.
        message: String,
    },

    /// A command argument failed client-side validation.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// A change event arrived without the `_id` resume token.
    #[error("Cannot provide resume functionality when the resume token is missing.")]
    MissingResumeToken,

    /// The change-stream protocol was violated in a non-recoverable way.
    #[error("Change stream error: {message}")]
    ChangeStream {
        /// Description of the violation.
        message: String,
    },

    /// A cursor operation was invoked after `close()`.
    #[error("{operation} called after the cursor was closed.")]
    CursorClosed {
        /// The operation the caller invoked.
        operation: &'static str,
    },

    /// A second fetch was started while one was already in flight.
    #[error("{operation} called while another fetch was in progress.")]
    FetchInProgress {
        /// The operation the caller invoked.
        operation: &'static str,
    },

    /// A raw document could not be decoded into the event type.
    #[error("Failed to decode change event: {message}")]
    Decode {
        /// Description from the codec.
        message: String,
    },
}

impl Error {
    /// Creates a transport-level error.
    pub fn network(message: impl Into<String>) -> Self {
        Error::Network {
            message: message.into(),
        }
    }

    /// Creates a server command error with no labels.
    pub fn server(code: i32, message: impl Into<String>) -> Self {
        Error::Server {
            code,
            code_name: server_code_name(code),
            message: message.into(),
            labels: Vec::new(),
        }
    }

    /// Attaches a server error label. No-op for non-server errors.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        if let Error::Server { labels, .. } = &mut self {
            labels.push(label.into());
        }
        self
    }

    /// The server error code, if this is a server error.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Labels the server attached to this error.
    pub fn labels(&self) -> &[String] {
        match self {
            Error::Server { labels, .. } => labels,
            _ => &[],
        }
    }

    /// Whether the server attached the given label.
    pub fn has_error_label(&self, label: &str) -> bool {
        self.labels().iter().any(|l| l == label)
    }
}

impl From<bson::raw::Error> for Error {
    fn from(error: bson::raw::Error) -> Self {
        Error::Decode {
            message: error.to_string(),
        }
    }
}

impl From<bson::de::Error> for Error {
    fn from(error: bson::de::Error) -> Self {
        Error::Decode {
            message: error.to_string(),
        }
    }
}

impl From<bson::ser::Error> for Error {
    fn from(error: bson::ser::Error) -> Self {
        Error::Decode {
            message: error.to_string(),
        }
    }
}
