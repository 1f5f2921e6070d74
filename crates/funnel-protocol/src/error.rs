//! The closed transport error taxonomy (§4.3), with retryability and HTTP
//! status mapping.

use thiserror::Error;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Every error a transport can surface. The set is closed: new transports
/// must map into these kinds rather than inventing new ones.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// Could not establish a connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Connection attempt exceeded its deadline.
    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),
    /// The remote end actively refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    /// An established connection was reset.
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    /// DNS resolution of the target host failed.
    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),
    /// A single request exceeded its timeout.
    #[error("request timed out: {0}")]
    RequestTimeout(String),
    /// The remote end rate-limited this request.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The remote service is temporarily unavailable (HTTP 503).
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Bad gateway (HTTP 502).
    #[error("bad gateway: {0}")]
    BadGateway(String),
    /// Gateway timeout (HTTP 504).
    #[error("gateway timeout: {0}")]
    GatewayTimeout(String),
    /// The network itself is unreachable.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    /// The specific host is unreachable.
    #[error("host unreachable: {0}")]
    HostUnreachable(String),
    /// A generic 5xx server error not otherwise classified.
    #[error("server error: {0}")]
    ServerError(String),
    /// TLS/SSL handshake failed.
    #[error("SSL handshake failed: {0}")]
    SslHandshakeFailed(String),
    /// A message violated the wire protocol.
    #[error("protocol error: {0}")]
    ProtocolError(String),
    /// A response could not be parsed or was structurally invalid.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// Too many HTTP redirects were followed.
    #[error("too many redirects: {0}")]
    TooManyRedirects(String),
    /// A configured URL was malformed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// Authentication with the remote endpoint failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    /// An error that does not fit the taxonomy above; retryability is
    /// carried explicitly since it depends on the surrounding context
    /// (e.g. the HTTP status it was derived from).
    #[error("unknown error: {message}")]
    UnknownError {
        /// Description of the error.
        message: String,
        /// Whether the caller should retry.
        retryable: bool,
    },
}

impl TransportError {
    /// Whether this error kind warrants an automated reconnect/resend.
    pub fn retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed(_)
            | Self::ConnectionTimeout(_)
            | Self::ConnectionRefused(_)
            | Self::ConnectionReset(_)
            | Self::DnsLookupFailed(_)
            | Self::RequestTimeout(_)
            | Self::RateLimited(_)
            | Self::ServiceUnavailable(_)
            | Self::BadGateway(_)
            | Self::GatewayTimeout(_)
            | Self::NetworkUnreachable(_)
            | Self::HostUnreachable(_)
            | Self::ServerError(_) => true,
            Self::SslHandshakeFailed(_)
            | Self::ProtocolError(_)
            | Self::InvalidResponse(_)
            | Self::TooManyRedirects(_)
            | Self::InvalidUrl(_)
            | Self::AuthenticationFailed(_) => false,
            Self::UnknownError { retryable, .. } => *retryable,
        }
    }

    /// Maps an HTTP status code to a `TransportError`, per §4.3's table.
    pub fn from_http_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        match status {
            401 | 403 => Self::AuthenticationFailed(context),
            408 => Self::RequestTimeout(context),
            429 => Self::RateLimited(context),
            502 => Self::BadGateway(context),
            503 => Self::ServiceUnavailable(context),
            504 => Self::GatewayTimeout(context),
            500..=599 => Self::ServerError(context),
            other => Self::UnknownError {
                message: format!("unexpected status {other}: {context}"),
                retryable: other == 408 || other == 429,
            },
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectionRefused(err.to_string()),
            ErrorKind::ConnectionReset => Self::ConnectionReset(err.to_string()),
            ErrorKind::TimedOut => Self::ConnectionTimeout(err.to_string()),
            _ => Self::ConnectionFailed(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_table() {
        assert!(TransportError::ConnectionFailed("x".into()).retryable());
        assert!(TransportError::RequestTimeout("x".into()).retryable());
        assert!(TransportError::ServerError("x".into()).retryable());
        assert!(!TransportError::AuthenticationFailed("x".into()).retryable());
        assert!(!TransportError::InvalidUrl("x".into()).retryable());
        assert!(!TransportError::ProtocolError("x".into()).retryable());
    }

    #[test]
    fn http_status_mapping() {
        assert!(matches!(
            TransportError::from_http_status(401, "x"),
            TransportError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            TransportError::from_http_status(429, "x"),
            TransportError::RateLimited(_)
        ));
        assert!(matches!(
            TransportError::from_http_status(502, "x"),
            TransportError::BadGateway(_)
        ));
        assert!(matches!(
            TransportError::from_http_status(599, "x"),
            TransportError::ServerError(_)
        ));
    }

    #[test]
    fn unknown_status_retryable_only_for_408_429() {
        let err = TransportError::from_http_status(451, "x");
        assert!(!err.retryable());
        let err = TransportError::from_http_status(408, "x");
        assert!(err.retryable());
    }
}
