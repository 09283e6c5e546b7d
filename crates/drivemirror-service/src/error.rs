use std::error::Error;

use reqwest::StatusCode;
use thiserror::Error;

/// An error talking to the upstream drive.
///
/// The error is [`Clone`], as a single failed computation in the
/// [`MemoCache`](crate::caching::MemoCache) is handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriveError {
    /// The upstream had a temporary failure (5xx or a broken connection).
    ///
    /// Retried with backoff up to a bounded number of attempts.
    #[error("upstream temporarily unavailable: {details}")]
    Transient {
        status: Option<u16>,
        details: String,
    },
    /// The quota of a single credential is exhausted.
    #[error("quota exceeded: {reason}")]
    QuotaExhausted { reason: String },
    /// Every credential of the pool was tried and is out of quota.
    #[error("all credentials exhausted: {reason}")]
    AllCredentialsExhausted { reason: String },
    /// The file does not exist, or is not visible to the credential.
    #[error("not found")]
    NotFound,
    /// The credential was rejected by upstream.
    ///
    /// Rotating does not help here, the credential itself needs to be fixed.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The requested byte range lies outside of the file.
    #[error("range not satisfiable for a file of {size} bytes")]
    RangeNotSatisfiable { size: u64 },
    /// No usable credentials are configured.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Any other non-successful upstream response, passed through verbatim.
    #[error("upstream responded with {status}: {body}")]
    Upstream { status: u16, body: String },
    /// The upstream response could not be understood.
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl DriveError {
    /// Returns `true` if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub(crate) fn transient_status(status: StatusCode) -> Self {
        Self::Transient {
            status: Some(status.as_u16()),
            details: status.to_string(),
        }
    }
}

impl From<reqwest::Error> for DriveError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return Self::Malformed(error.to_string());
        }

        // Report the innermost cause, the outer layers only repeat the URL.
        let mut source: &dyn Error = &error;
        while let Some(inner) = source.source() {
            source = inner;
        }

        Self::Transient {
            status: error.status().map(|s| s.as_u16()),
            details: source.to_string(),
        }
    }
}

impl From<serde_json::Error> for DriveError {
    fn from(error: serde_json::Error) -> Self {
        Self::Malformed(error.to_string())
    }
}
