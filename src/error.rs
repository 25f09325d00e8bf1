//! Error taxonomy for the sync and print-dispatch engine.
//!
//! Each layer has its own enum; conversions only go upward (source errors
//! become sync errors, never the other way around).

use thiserror::Error;

// ---------------------------------------------------------------------------
// Remote order source
// ---------------------------------------------------------------------------

/// Failure of a single call to the remote order source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Connection reset by peer: {0}")]
    ConnectionReset(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("Cannot resolve host: {0}")]
    Dns(String),

    #[error("Host unreachable: {0}")]
    Unreachable(String),

    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },

    #[error("Invalid response from order source: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Credentials rejected or terminal not allowed; never worth retrying.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SourceError::Http { status: 401 | 403, .. })
    }
}

// ---------------------------------------------------------------------------
// Persistence collaborator
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored order is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Order {0} not found")]
    NotFound(i64),

    #[error("Repository lock poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// Sync cycle
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    /// No credentials configured at all. Reported immediately, never retried.
    #[error("Order source is not configured: {0}")]
    ConfigurationAbsent(String),

    /// The configured "since" window does not fit the calendar.
    #[error("Fetch window out of range: {0}")]
    InvalidWindow(String),

    /// The cycle did not finish within the cycle timeout.
    #[error("Sync cycle timed out after {0} s")]
    TimedOut(u64),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PrinterError {
    #[error("Unknown printer profile: {0}")]
    UnknownProfile(String),

    #[error("Printer {0} is not connected")]
    NotConnected(String),

    #[error("Invalid printer address: {0}")]
    InvalidAddress(String),

    #[error("Printer transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Printer driver unavailable: {0}")]
    DriverUnavailable(String),
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("Template {0:?} is not valid")]
    InvalidTemplate(String),

    #[error("Order {0} has no line items")]
    EmptyOrder(String),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Engine facade
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Printer(#[from] PrinterError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_detection() {
        let unauthorized = SourceError::Http {
            status: 401,
            message: "Consumer key is invalid".into(),
        };
        let server = SourceError::Http {
            status: 502,
            message: "Bad gateway".into(),
        };
        assert!(unauthorized.is_auth_failure());
        assert!(!server.is_auth_failure());
        assert!(!SourceError::Timeout("shop".into()).is_auth_failure());
    }

    #[test]
    fn test_source_error_wraps_into_sync_error() {
        let err: SyncError = SourceError::Dns("shop.example".into()).into();
        assert_eq!(err.to_string(), "Cannot resolve host: shop.example");
    }
}
