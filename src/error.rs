//! Error types for cloud-init-azure

use std::time::Duration;
use thiserror::Error;

/// Main error type for cloud-init-azure operations
#[derive(Error, Debug)]
pub enum CloudInitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Datasource error: {0}")]
    Datasource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request failed after {attempts} attempt(s): {source}")]
    Fetch {
        attempts: u32,
        #[source]
        source: UrlError,
    },

    #[error("Invalid goal state document: {0}")]
    InvalidGoalState(String),

    #[error("Malformed goal state XML at line {line}, column {column}: {message}")]
    GoalStateParse {
        line: u32,
        column: u32,
        message: String,
    },

    #[error("Certificate decryption failed: {0}")]
    CertificateDecrypt(String),

    #[error("Failed to post health report after {attempts} attempt(s): {source}")]
    HealthReport {
        attempts: u32,
        #[source]
        source: UrlError,
    },

    #[error("Cryptography error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl CloudInitError {
    /// Wrap a final per-attempt failure as a fetch error
    pub fn fetch(attempts: u32, source: UrlError) -> Self {
        Self::Fetch { attempts, source }
    }

    /// Whether this error came out of health reporting itself
    pub fn is_health_report(&self) -> bool {
        matches!(self, Self::HealthReport { .. })
    }
}

/// Failure of a single HTTP attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("connection to {url} failed: {message}")]
    Connection {
        url: String,
        message: String,
        /// Retrying cannot help (network or host unreachable)
        futile: bool,
    },

    #[error("timed out after {timeout:?} waiting for {url}")]
    Timeout { url: String, timeout: Duration },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("request to {url} was cancelled")]
    Cancelled { url: String },

    #[error("could not build request for {url}: {message}")]
    Build { url: String, message: String },
}

impl UrlError {
    pub fn url(&self) -> &str {
        match self {
            Self::Connection { url, .. }
            | Self::Timeout { url, .. }
            | Self::Status { url, .. }
            | Self::Cancelled { url }
            | Self::Build { url, .. } => url,
        }
    }

    /// Whether another attempt is pointless
    pub fn is_futile(&self) -> bool {
        matches!(
            self,
            Self::Connection { futile: true, .. } | Self::Cancelled { .. } | Self::Build { .. }
        )
    }

    /// HTTP status code, when the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
