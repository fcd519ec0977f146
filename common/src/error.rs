//! Error taxonomy shared by the device session, the recording scanner and
//! the alarm watcher.
//!
//! Loop bodies in the agent wrap these in `anyhow` with context; the
//! typed variants matter where callers branch on them (startup treats an
//! `AuthError` as fatal, loops treat everything as retryable).

use thiserror::Error;

/// Login or re-login failure.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("login challenge is missing `{0}`")]
    MissingChallenge(&'static str),

    #[error("device returned an empty session token")]
    EmptySession,

    #[error("device rejected the login")]
    Rejected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Network or HTTP failure on any device call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{path} returned HTTP {status}")]
    Status { path: String, status: u16 },

    #[error("no active session")]
    NoSession,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Failure of the digest-authenticated file download.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no WWW-Authenticate challenge in response (HTTP {0})")]
    MissingChallenge(u16),

    #[error("malformed WWW-Authenticate challenge: {0}")]
    MalformedChallenge(String),

    #[error("download of {uri} returned HTTP {status}")]
    Status { uri: String, status: u16 },

    #[error("cannot write download: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Malformed RPC JSON or event payload.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected response shape: {0}")]
    Shape(String),
}

/// Missing or invalid startup parameter.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Notification sink failure. Logged by the dispatcher, never retried.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink returned HTTP {0}")]
    Status(u16),

    #[error("cannot read attachment: {0}")]
    Io(#[from] std::io::Error),
}

/// Processed-file ledger persistence failure.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
