//! Error handling for range scanning operations.
//!
//! This module defines a single error type that covers every way a scan can
//! fail, from caller mistakes to an upstream that never stops throttling us.

use std::fmt;
use std::time::Duration;

/// Main error type for range scanning operations.
#[derive(Debug, Clone)]
pub enum ScanError {
    /// The identifier range itself is unusable (empty, reversed, too wide)
    InvalidRange {
        low: i64,
        high: i64,
        reason: String,
    },

    /// The range cannot be split across the requested workers
    Partition {
        identifiers: usize,
        workers: usize,
        message: String,
    },

    /// A bounded lock could not be acquired in time
    LockTimeout {
        operation: String,
        duration: Duration,
    },

    /// The upstream answered with a non-2xx status other than 429
    Upstream {
        status: u16,
        body: String,
    },

    /// The upstream answered 429 Too Many Requests
    RateLimited {
        proxy: String,
    },

    /// A 2xx body that matched neither known response shape
    Malformed {
        message: String,
        body: Option<String>,
    },

    /// Timeout, refused connection, broken proxy and friends
    Transport {
        message: String,
        source: Option<String>,
    },

    /// The proxy pool stayed empty after every refill attempt
    PoolExhausted {
        attempts: u32,
    },

    /// The run was aborted through its cancellation token
    Cancelled,

    /// A batch ran out of retry budget
    RetriesExhausted {
        attempts: u32,
        elapsed: Duration,
        last_error: Box<ScanError>,
    },

    /// Configuration errors (invalid settings, etc.)
    ConfigError {
        message: String,
    },

    /// File I/O errors when reading proxy lists or config files
    FileError {
        path: String,
        message: String,
    },

    /// Generic internal errors that don't fit other categories
    Internal {
        message: String,
    },
}

impl ScanError {
    /// Create a new invalid range error.
    pub fn invalid_range<R: Into<String>>(low: i64, high: i64, reason: R) -> Self {
        Self::InvalidRange {
            low,
            high,
            reason: reason.into(),
        }
    }

    /// Create a new partition error.
    pub fn partition<M: Into<String>>(identifiers: usize, workers: usize, message: M) -> Self {
        Self::Partition {
            identifiers,
            workers,
            message: message.into(),
        }
    }

    /// Create a new lock timeout error.
    pub fn lock_timeout<O: Into<String>>(operation: O, duration: Duration) -> Self {
        Self::LockTimeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a new upstream status error.
    pub fn upstream<B: Into<String>>(status: u16, body: B) -> Self {
        Self::Upstream {
            status,
            body: body.into(),
        }
    }

    /// Create a new malformed response error.
    pub fn malformed<M: Into<String>>(message: M, body: Option<String>) -> Self {
        Self::Malformed {
            message: message.into(),
            body,
        }
    }

    /// Create a new transport error.
    pub fn transport<M: Into<String>>(message: M) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new transport error with source information.
    pub fn transport_with_source<M: Into<String>, S: Into<String>>(message: M, source: S) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new configuration error.
    pub fn config<M: Into<String>>(message: M) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create a new file error.
    pub fn file_error<P: Into<String>, M: Into<String>>(path: P, message: M) -> Self {
        Self::FileError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new internal error.
    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is a transient upstream/network condition.
    ///
    /// These are recovered inside the batch state machine and only escape
    /// wrapped in [`ScanError::RetriesExhausted`].
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Upstream { .. }
                | Self::RateLimited { .. }
                | Self::Malformed { .. }
                | Self::Transport { .. }
                | Self::LockTimeout { .. }
        )
    }

    /// Check if the batch state machine should discard its proxied client.
    ///
    /// Rate limiting is handled separately: it only rotates after several
    /// consecutive hits.
    pub fn forces_rotation(&self) -> bool {
        matches!(
            self,
            Self::Upstream { .. } | Self::Malformed { .. } | Self::Transport { .. }
        )
    }

    /// Whether this error was caused by cancellation, directly or not.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::RetriesExhausted { last_error, .. } => last_error.is_cancelled(),
            _ => false,
        }
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRange { low, high, reason } => {
                write!(f, "Invalid range [{}, {}): {}", low, high, reason)
            }
            Self::Partition {
                identifiers,
                workers,
                message,
            } => {
                write!(
                    f,
                    "Cannot split {} identifiers across {} workers: {}",
                    identifiers, workers, message
                )
            }
            Self::LockTimeout {
                operation,
                duration,
            } => {
                write!(f, "Lock not acquired within {:?} during: {}", duration, operation)
            }
            Self::Upstream { status, body } => {
                if body.is_empty() {
                    write!(f, "Upstream error (HTTP {})", status)
                } else {
                    write!(f, "Upstream error (HTTP {}): {}", status, body)
                }
            }
            Self::RateLimited { proxy } => {
                write!(f, "Rate limited through proxy {}", proxy)
            }
            Self::Malformed { message, body: _ } => {
                write!(f, "Malformed response: {}", message)
            }
            Self::Transport { message, source } => {
                if let Some(source) = source {
                    write!(f, "Transport error: {} (source: {})", message, source)
                } else {
                    write!(f, "Transport error: {}", message)
                }
            }
            Self::PoolExhausted { attempts } => {
                write!(
                    f,
                    "Proxy pool still empty after {} refill attempt{}",
                    attempts,
                    if *attempts == 1 { "" } else { "s" }
                )
            }
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::RetriesExhausted {
                attempts,
                elapsed,
                last_error,
            } => {
                write!(
                    f,
                    "Gave up after {} attempts in {:?}; last error: {}",
                    attempts, elapsed, last_error
                )
            }
            Self::ConfigError { message } => {
                write!(f, "Configuration error: {}", message)
            }
            Self::FileError { path, message } => {
                write!(f, "File error at '{}': {}", path, message)
            }
            Self::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for ScanError {}

// Implement From conversions for common error types
impl From<reqwest::Error> for ScanError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::transport_with_source("Request timed out", err.to_string())
        } else if err.is_connect() {
            Self::transport_with_source("Connection failed", err.to_string())
        } else {
            Self::transport_with_source("HTTP request failed", err.to_string())
        }
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed {
            message: format!("JSON parsing failed: {}", err),
            body: None,
        }
    }
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {}", err),
        }
    }
}

impl From<regex::Error> for ScanError {
    fn from(err: regex::Error) -> Self {
        Self::Internal {
            message: format!("Regex error: {}", err),
        }
    }
}
