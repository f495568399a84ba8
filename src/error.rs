//! Error types for tcpline.

use std::io;

use thiserror::Error;

/// Main error type for all tcpline operations.
#[derive(Debug, Error)]
pub enum TcplineError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error (span merge only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Protocol error (negative sub-frame length, oversized frame, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A pipelined response announced a different sub-response count than
    /// the request carried.
    #[error("mismatched number of responses for pipelined request: expected {expected}, got {got}")]
    BatchMismatch {
        /// Sub-requests sent.
        expected: i32,
        /// Sub-responses announced by the peer.
        got: i32,
    },

    /// The connection pool was constructed with an empty address list.
    #[error("connection pool has no addresses to dial")]
    NoAddresses,

    /// `close()` was called on an already closed server.
    #[error("closing already closed server")]
    AlreadyClosed,

    /// `serve()` was called on a server whose listener is gone (closed or
    /// already serving).
    #[error("server is not listening")]
    NotListening,
}

/// Result type alias using TcplineError.
pub type Result<T> = std::result::Result<T, TcplineError>;

impl TcplineError {
    /// Whether another attempt on a fresh connection may succeed.
    ///
    /// Covers the transient network conditions a client retries: broken
    /// pipe, connection refused, connection reset. Timeouts are not
    /// retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            TcplineError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }

    /// Whether the error means the peer is gone or a deadline expired.
    ///
    /// The server tears the connection down quietly on these instead of
    /// logging a failure.
    pub fn is_closable(&self) -> bool {
        match self {
            TcplineError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// I/O error used when an absolute deadline elapses mid-operation.
pub(crate) fn timed_out(context: &str) -> TcplineError {
    TcplineError::Io(io::Error::new(io::ErrorKind::TimedOut, context.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset,
        ] {
            let err = TcplineError::Io(io::Error::new(kind, "boom"));
            assert!(err.is_retryable(), "{kind:?} should be retryable");
        }
    }

    #[test]
    fn test_non_retryable() {
        assert!(!TcplineError::Protocol("sup".into()).is_retryable());
        assert!(!timed_out("deadline").is_retryable());
        let err = TcplineError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_closable_kinds() {
        assert!(timed_out("deadline").is_closable());
        let eof = TcplineError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(eof.is_closable());
        let reset = TcplineError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "rst"));
        assert!(!reset.is_closable());
        assert!(!TcplineError::NoAddresses.is_closable());
    }

    #[test]
    fn test_batch_mismatch_message() {
        let err = TcplineError::BatchMismatch {
            expected: 10,
            got: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 10"));
        assert!(msg.contains("got 7"));
    }
}
