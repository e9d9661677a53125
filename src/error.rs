//! Transport and connection error types.

use thiserror::Error;

/// A specialized `Result` type for transport and connection operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while negotiating, connecting, or exchanging
/// messages over a transport.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// The operation is not permitted in the connection's or transport's
    /// current state (double-start, send before connect, etc.).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The negotiate response body was missing, ill-formed, or
    /// semantically empty (no transports advertised).
    #[error("invalid negotiation response: {0}")]
    InvalidNegotiationResponse(String),

    /// A non-success HTTP status was returned by negotiate, a transport
    /// GET/POST/DELETE, or any other HTTP endpoint this crate calls.
    #[error("unexpected HTTP status {status}")]
    WebError {
        /// The HTTP status code returned by the server.
        status: u16,
    },

    /// `stop()` raced an in-flight `start()`; the start caller observes
    /// this instead of a successful open.
    #[error("connection is being closed")]
    ConnectionIsBeingClosed,

    /// An error surfaced by the hub-invocation layer above this crate,
    /// passed through the same failure channel.
    #[error("hub invocation error: {0}")]
    HubInvocationError(String),

    /// The server violated the wire protocol in a way this crate can
    /// detect (malformed framing, unexpected message shape).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The caller invoked an operation that is never valid, independent
    /// of connection state (e.g. a malformed configuration).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An underlying I/O or network error, flattened to a string so
    /// that `TransportError` can remain `Clone` (foreign error types
    /// from `reqwest`/`tokio-tungstenite` are not `Clone`, and a cloned
    /// `stopError` must be replayable to more than one callback).
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_error_displays_status() {
        let err = TransportError::WebError { status: 404 };
        assert_eq!(err.to_string(), "unexpected HTTP status 404");
    }

    #[test]
    fn is_clone() {
        let err = TransportError::InvalidState("double start".into());
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
