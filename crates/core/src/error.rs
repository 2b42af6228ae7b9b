/// Result alias that carries the custom [`SyncError`] type.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Free-form message for failures that do not fit a more specific
    /// variant, such as a poisoned lock.
    #[error("{0}")]
    Message(String),
    /// Invalid configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The operation is not legal in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The media device reported a failure (decode error, permission denial).
    #[error("device error: {0}")]
    Device(String),
    /// The analysis collaborator rejected or failed a request.
    #[error("transport error: {0}")]
    Transport(String),
    /// A batch send exceeded its deadline.
    #[error("analysis request timed out after {0} ms")]
    Timeout(u64),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn state<T: Into<String>>(msg: T) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Returns `true` for failures talking to the analysis collaborator. These
    /// are recoverable: the queued snapshots stay in place for a later drain.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_) | Self::Http(_))
    }
}

impl From<&str> for SyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
