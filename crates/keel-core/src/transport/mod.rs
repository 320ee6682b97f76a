//! Byte transport used to talk to repositories.
//!
//! The engine only ever issues `GET` requests and consumes the body as a
//! stream; everything else (auth, timeouts, user agent) is the transport's
//! business.

pub mod http;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::credentials::Credentials;

pub use http::HttpTransport;
pub use memory::{MemoryRepository, MemoryTransport};
pub use retry::{Cancelled, RetryPolicy, Retryable, with_retry};

/// A response body.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Failure talking to a repository.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server has no such resource (404 / 410).
    #[error("Not found: {url}")]
    NotFound {
        /// Requested URL.
        url: String,
    },

    /// Any other non-success status.
    #[error("HTTP {status} for {url}")]
    Status {
        /// Requested URL.
        url: String,
        /// Status code.
        status: u16,
    },

    /// Connection, TLS or body read failure.
    #[error("Network error for {url}: {message}")]
    Network {
        /// Requested URL.
        url: String,
        /// Underlying error text.
        message: String,
    },

    /// The request or body read exceeded the configured timeout.
    #[error("Timed out fetching {url}")]
    Timeout {
        /// Requested URL.
        url: String,
    },

    /// The caller cancelled the request.
    #[error("Request cancelled")]
    Cancelled,
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    ///
    /// Network failures, timeouts, 5xx and 429 are transient; 404 and other
    /// 4xx are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::NotFound { .. } | Self::Cancelled => false,
        }
    }

    /// Whether this is a 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl Retryable for TransportError {
    fn is_transient(&self) -> bool {
        TransportError::is_transient(self)
    }
}

impl From<Cancelled> for TransportError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// A source of repository bytes.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Start a `GET` for `url` and return the body stream.
    ///
    /// Status errors must be reported here, before any body bytes.
    async fn get(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<ByteStream, TransportError>;
}

/// Drain a body stream into memory.
///
/// # Errors
///
/// Returns the first error the stream yields.
pub async fn collect_body(mut stream: ByteStream) -> Result<Bytes, TransportError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let url = "u".to_string();
        assert!(TransportError::Timeout { url: url.clone() }.is_transient());
        assert!(
            TransportError::Network {
                url: url.clone(),
                message: "reset".into()
            }
            .is_transient()
        );
        assert!(
            TransportError::Status {
                url: url.clone(),
                status: 503
            }
            .is_transient()
        );
        assert!(
            TransportError::Status {
                url: url.clone(),
                status: 429
            }
            .is_transient()
        );
        assert!(
            !TransportError::Status {
                url: url.clone(),
                status: 403
            }
            .is_transient()
        );
        assert!(!TransportError::NotFound { url }.is_transient());
        assert!(!TransportError::Cancelled.is_transient());
    }
}
