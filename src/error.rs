//! Wire error taxonomy (spec §7) and the local error types built on it.
//!
//! [`WireError`] is what actually crosses the network inside a
//! [`crate::rpc::Response`] whose status is not 2xx: a `kind` plus a
//! message plus an optional cause chain, round-tripped through the same
//! codec as everything else. [`ArpcError`] is what callers on either side
//! see locally; it either wraps a reconstructed [`WireError`] or a local
//! failure (I/O, protocol, timeout) that never had a chance to cross the
//! wire.

use std::fmt;
use std::io;

use crate::codec;

/// Status codes used on the wire (spec §6).
pub mod status {
    pub const OK: u16 = 200;
    pub const BINARY_STREAM_FOLLOWS: u16 = 213;
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL_ERROR: u16 = 500;
}

/// Taxonomy of errors that can occur during an ARPC call or a VSSFS
/// operation (spec §7). Every variant has a stable wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// Malformed frame, length overflow, decode failure.
    Protocol = 0,
    /// Unknown method, unknown handle id, file does not exist.
    NotFound = 1,
    /// Write-implying flag on OpenFile, or any other modifying attempt.
    PermissionDenied = 2,
    /// Negative offset, seek before zero, whence out of range, read-at on a directory.
    InvalidArgument = 3,
    /// Sparse seek past end of file.
    PastEndOfFile = 4,
    /// Wraps a native filesystem error; the OS error code is preserved in the message.
    Io = 5,
    /// Deadline elapsed before a response arrived.
    Timeout = 6,
    /// The underlying connection was closed mid-call.
    ConnectionLost = 7,
}

impl ErrorKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        use ErrorKind::*;
        Some(match v {
            0 => Protocol,
            1 => NotFound,
            2 => PermissionDenied,
            3 => InvalidArgument,
            4 => PastEndOfFile,
            5 => Io,
            6 => Timeout,
            7 => ConnectionLost,
            _ => return None,
        })
    }

    /// The HTTP-style status this kind maps to when first observed on the server.
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::Protocol => status::BAD_REQUEST,
            ErrorKind::NotFound => status::NOT_FOUND,
            ErrorKind::PermissionDenied => status::FORBIDDEN,
            ErrorKind::InvalidArgument
            | ErrorKind::PastEndOfFile
            | ErrorKind::Io
            | ErrorKind::Timeout
            | ErrorKind::ConnectionLost => status::INTERNAL_ERROR,
        }
    }

    /// Whether a client-side `ReadAt` retry loop should retry this kind
    /// (spec §4.8, §7 propagation policy): only transient network/stream
    /// failures are retried, application-level errors are returned as-is.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::ConnectionLost)
    }
}

/// Serialized error envelope (spec §3). Round-trips across the wire.
#[derive(Debug, Clone)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<Box<WireError>>,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), cause: None }
    }

    pub fn with_cause(mut self, cause: WireError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        Self::encode_into(self, &mut buf);
        buf
    }

    fn encode_into(err: &WireError, buf: &mut Vec<u8>) {
        buf.push(err.kind as u8);
        codec::primitive::write_string(buf, &err.message);
        match &err.cause {
            Some(cause) => {
                buf.push(1);
                Self::encode_into(cause, buf);
            }
            None => buf.push(0),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ArpcError> {
        let mut cur = codec::primitive::Cursor::new(buf);
        Self::decode_from(&mut cur)
    }

    fn decode_from(cur: &mut codec::primitive::Cursor<'_>) -> Result<Self, ArpcError> {
        let kind_byte = cur.read_u8().map_err(ArpcError::Protocol)?;
        let kind = ErrorKind::from_u8(kind_byte)
            .ok_or_else(|| ArpcError::Protocol("unknown error kind on wire".into()))?;
        let message = codec::primitive::read_string(cur).map_err(ArpcError::Protocol)?;
        let has_cause = cur.read_u8().map_err(ArpcError::Protocol)?;
        let cause = if has_cause == 1 {
            Some(Box::new(Self::decode_from(cur)?))
        } else {
            None
        };
        Ok(WireError { kind, message, cause })
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for WireError {}

/// Local error type observed by callers of [`crate::session::Session`],
/// [`crate::vssfs`], and [`crate::arpcfs`].
#[derive(Debug, thiserror::Error)]
pub enum ArpcError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Remote(#[from] WireError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("deadline exceeded")]
    Timeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("reconnect already attempted by another caller")]
    ReconnectInProgress,

    #[error("reconnect failed after exhausting retries: {0}")]
    ReconnectExhausted(String),
}

impl ArpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArpcError::Protocol(_) => ErrorKind::Protocol,
            ArpcError::Remote(e) => e.kind,
            ArpcError::Io(_) => ErrorKind::Io,
            ArpcError::Timeout => ErrorKind::Timeout,
            ArpcError::ConnectionLost
            | ArpcError::ReconnectInProgress
            | ArpcError::ReconnectExhausted(_) => ErrorKind::ConnectionLost,
        }
    }

    /// Turn this error into the envelope that goes in a [`crate::rpc::Response`].
    pub fn to_wire(&self) -> WireError {
        match self {
            ArpcError::Remote(e) => e.clone(),
            other => WireError::new(other.kind(), other.to_string()),
        }
    }

    pub fn status(&self) -> u16 {
        self.kind().status()
    }
}
