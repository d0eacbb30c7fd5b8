use thiserror::Error;

/// Network failures surfaced by the transport.
///
/// Every variant is network-classified and, by itself, recoverable: the
/// retry controller may try again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("Request aborted: {url}")]
    Aborted { url: String },
    #[error("Timeout: {url}")]
    Timeout { url: String },
    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },
    #[error("HTTP request failed: {0}")]
    Http(String),
}

/// How badly a failure should be treated by the player.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Critical,
}

impl NetError {
    pub fn aborted(url: impl Into<String>) -> Self {
        Self::Aborted { url: url.into() }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn http<S: Into<String>>(msg: S) -> Self {
        Self::Http(msg.into())
    }

    /// Timeouts surfaced by reqwest itself are reported as [`NetError::Timeout`].
    pub fn from_reqwest(error: &reqwest::Error, url: &str) -> Self {
        if error.is_timeout() {
            Self::timeout(url)
        } else {
            Self::Http(error.to_string())
        }
    }

    /// Eligible for retry by [`RetryController`](crate::RetryController).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Aborted { .. }
            | Self::Timeout { .. }
            | Self::HttpStatus { .. }
            | Self::Http(_) => true,
        }
    }

    /// Authorization failures are critical for the player even though the
    /// controller still treats them as network failures.
    pub fn severity(&self) -> Severity {
        match self {
            Self::HttpStatus {
                status: 401 | 403, ..
            } => Severity::Critical,
            _ => Severity::Recoverable,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Broad origin of a failure reported by the player.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCategory {
    Network,
    Manifest,
    Media,
    Drm,
    Other,
}

/// A failure handed to the retry controller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Failure {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("{category:?} failure: {message}")]
    Other {
        category: FailureCategory,
        message: String,
    },
}

impl Failure {
    pub fn other(category: FailureCategory, message: impl Into<String>) -> Self {
        Self::Other {
            category,
            message: message.into(),
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Net(_) => FailureCategory::Network,
            Self::Other { category, .. } => *category,
        }
    }

    /// Only recoverable network failures are retried locally.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Net(error) => error.is_recoverable(),
            Self::Other { .. } => false,
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;
