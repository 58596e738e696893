// Error handling module
// Defines the error types surfaced by the session layer

use thiserror::Error;

/// Reasons a refresh exchange can fail
///
/// Every waiter of a refresh cycle receives a clone of the same value, so
/// this type carries only owned, cloneable data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// No refresh token is stored (never logged in, or already cleared)
    #[error("No refresh token available")]
    NoRefreshToken,

    /// Backend declined the refresh token (expired, revoked or rotated out)
    #[error("Refresh rejected: {status} - {message}")]
    RefreshRejected { status: u16, message: String },

    /// Success status but the body is not the expected shape
    #[error("Malformed refresh response: {0}")]
    MalformedRefreshResponse(String),

    /// Refresh exchange got no response at all
    #[error("Refresh request failed: {0}")]
    Transport(String),
}

/// Persistence errors from a key-value backend
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the request dispatcher and session manager
#[derive(Error, Debug)]
pub enum SessionError {
    /// No response from the network; never retried here
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Refresh failed; the session has been cleared and the caller must
    /// re-authenticate
    #[error("Session expired: {0}")]
    SessionExpired(#[source] RefreshError),

    /// Login or signup rejected by the backend
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Non-2xx response decoded through the standard envelope
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Response body did not match the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Request path could not be resolved against the base URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Request could not be built (bad body or multipart part)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// File to upload could not be read
    #[error("Upload error: {0}")]
    Upload(#[from] std::io::Error),

    /// Persistence backend could not be opened
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// True when the caller must send the user back to the login view
    pub fn requires_login(&self) -> bool {
        matches!(self, SessionError::SessionExpired(_))
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
