//! Error types for zjs-runtime
//!
//! Every script-facing failure is a plain `Err` value. The embedding layer is
//! expected to surface it as a script exception; nothing here is fatal.

use thiserror::Error;

/// Errors that can occur in the bindings, the callback queue or the runtime
#[derive(Error, Debug)]
pub enum ZjsError {
    /// Wrong arity or type of script-supplied arguments
    #[error("Unsupported arguments to {function}: {reason}")]
    InvalidArguments {
        function: &'static str,
        reason: String,
    },

    /// Operation targets a handle with no registry record
    #[error("{0} not found")]
    NotFound(String),

    /// Write offset past the end of a buffer
    #[error("Tried to write beyond end of buffer (offset {offset}, size {size})")]
    OutOfBounds { offset: usize, size: usize },

    /// Native storage could not be allocated
    #[error("Unable to allocate buffer of {size} bytes")]
    Allocation { size: usize },

    /// Encoding other than the ones a buffer can render
    #[error("Unsupported encoding type in Buffer toString: {0}")]
    UnsupportedEncoding(String),

    /// Buffer too small to render as hex
    #[error("Buffer of {size} bytes cannot be rendered as hex")]
    BufferTooSmall { size: usize },

    /// A dequeued callback request had no dispatcher
    #[error("No dispatcher set for callback request targeting {target}")]
    MissingDispatcher { target: String },

    /// Bounded callback queue is full
    #[error("Callback queue is full ({capacity} pending requests)")]
    QueueFull { capacity: usize },

    /// Every receiver of the callback queue was dropped
    #[error("Callback queue disconnected")]
    QueueDisconnected,

    /// `drain_all` was called while a drain was already running
    #[error("Callback queue is already being drained")]
    ReentrantDrain,

    /// A callback raised an error or panicked
    #[error("Callback {function} failed: {message}")]
    Callback { function: String, message: String },

    /// Configuration could not be read or parsed
    #[error("Invalid runtime configuration: {0}")]
    Config(String),
}

impl ZjsError {
    /// Create an invalid-arguments error
    pub fn invalid_arguments(function: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            function,
            reason: reason.into(),
        }
    }

    /// Create a callback error
    pub fn callback(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Callback {
            function: function.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ZjsError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<std::io::Error> for ZjsError {
    fn from(e: std::io::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type alias for runtime operations
pub type ZjsResult<T> = Result<T, ZjsError>;
