use thiserror::Error;

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur during stream operations
#[derive(Debug, Error)]
pub enum StreamError {
    /// A read deadline elapsed (or the read was cancelled) before the
    /// requested number of bytes arrived. Partial data is discarded.
    #[error("read timed out: {received}/{requested} bytes received")]
    Timeout { received: usize, requested: usize },

    /// A pattern read deadline elapsed (or the read was cancelled) before
    /// the pattern was matched. The bytes consumed so far are lost.
    #[error("pattern read timed out after {0} bytes")]
    PatternTimeout(usize),

    #[error("search pattern cannot be empty")]
    EmptyPattern,

    /// The stream has been torn down; no further reads are possible.
    #[error("stream is closed")]
    Closed,

    #[error("transport is not connected")]
    NotConnected,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("serial port error: {0}")]
    Serial(String),

    #[error("message bus error: {0}")]
    Bus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether this error is a timeout (deadline expiry or cancellation,
    /// which callers cannot tell apart).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            StreamError::Timeout { .. } | StreamError::PatternTimeout(_)
        )
    }
}
