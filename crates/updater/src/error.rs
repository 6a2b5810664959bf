use std::path::PathBuf;

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors raised by the updater's supporting layers.
///
/// The state machine itself never returns these to its caller; it logs them
/// and turns them into [`UpdaterState`](crate::UpdaterState) transitions.
#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// HTTP transport failure inside the bundled transfer engine.
    #[error("transfer failed: {0}")]
    Transfer(#[from] reqwest::Error),
    /// Settings file could not be encoded or decoded.
    #[error("settings decoding failed: {0}")]
    SettingsDecode(#[from] serde_json::Error),
    /// A URL could not be parsed.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    /// Failed to perform an I/O operation.
    #[error("filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted or supplied setting is outside its allowed range.
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting {
        /// Setting key.
        name: &'static str,
        /// Why the value was refused.
        reason: String,
    },
    /// Downloaded artefact did not match the advertised size or digest.
    #[error("artefact verification failed for {}", .0.display())]
    VerificationFailed(PathBuf),
    /// No free destination name could be found in the download directory.
    #[error("no free destination for {0}")]
    NoDestination(String),
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl UpdaterError {
    /// Helper for wrapping validation failures.
    pub fn validation(msg: impl Into<String>) -> Self {
        UpdaterError::Other(msg.into())
    }
}
