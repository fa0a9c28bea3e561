//! Request/response envelopes and dispatch (spec §3, §4.4, §6).

pub mod binary_stream;
pub mod router;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::codec::primitive::{self, Cursor};
use crate::error::{status, ArpcError, WireError};

/// Header requesting the binary side-channel (spec §4.3, §6).
pub const HEADER_DIRECT_BUFFER: &str = "X-Direct-Buffer";
pub const HEADER_VALUE_TRUE: &str = "true";

/// Top-level methods exchanged on the agent control session, outside any
/// `{jobId}/` prefix (spec §6 "Method namespace"): a liveness check, and
/// the two methods that start/stop a [`crate::backup_session::BackupSession`].
pub const PING_METHOD: &str = "ping";
pub const BACKUP_METHOD: &str = "backup";
pub const CLEANUP_METHOD: &str = "cleanup";

/// A request sent on a freshly opened stream (spec §3).
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl Request {
    pub fn new(method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { method: method.into(), payload, headers: HashMap::new() }
    }

    pub fn with_direct_buffer(mut self) -> Self {
        self.headers.insert(HEADER_DIRECT_BUFFER.to_string(), HEADER_VALUE_TRUE.to_string());
        self
    }

    pub fn wants_direct_buffer(&self) -> bool {
        self.headers.get(HEADER_DIRECT_BUFFER).map(String::as_str) == Some(HEADER_VALUE_TRUE)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        primitive::write_string(&mut buf, &self.method);
        primitive::write_bytes(&mut buf, &self.payload);
        let headers: Vec<(String, String)> =
            self.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        primitive::write_string_map(&mut buf, &headers);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ArpcError> {
        let mut cur = Cursor::new(buf);
        let method = primitive::read_string(&mut cur).map_err(ArpcError::Protocol)?;
        let payload = cur.read_bytes().map_err(ArpcError::Protocol)?;
        let headers = primitive::read_string_map(&mut cur)
            .map_err(ArpcError::Protocol)?
            .into_iter()
            .collect();
        Ok(Request { method, payload, headers })
    }
}

/// Callback a handler provides to write the binary tail of a status-213
/// response (spec §3, §4.5). Invoked by the router after the framed
/// response has been written, on the same stream.
pub type RawStreamWriter = Box<
    dyn for<'a> FnOnce(
            &'a mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        ) -> Pin<Box<dyn Future<Output = Result<(), ArpcError>> + Send + 'a>>
        + Send,
>;

/// A response to a [`Request`] (spec §3, §6).
pub struct Response {
    pub status: u16,
    pub message: String,
    pub data: Vec<u8>,
    pub raw_stream: Option<RawStreamWriter>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("message", &self.message)
            .field("data_len", &self.data.len())
            .field("has_raw_stream", &self.raw_stream.is_some())
            .finish()
    }
}

impl Response {
    pub fn ok(data: Vec<u8>) -> Self {
        Self { status: status::OK, message: String::new(), data, raw_stream: None }
    }

    pub fn binary_stream_follows(data: Vec<u8>, raw_stream: RawStreamWriter) -> Self {
        Self {
            status: status::BINARY_STREAM_FOLLOWS,
            message: String::new(),
            data,
            raw_stream: Some(raw_stream),
        }
    }

    pub fn error(err: &ArpcError) -> Self {
        Self {
            status: err.status(),
            message: err.to_string(),
            data: err.to_wire().encode(),
            raw_stream: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) || self.status == status::BINARY_STREAM_FOLLOWS
    }

    /// Wire encoding, excluding the (server-only, non-wire) raw stream callback.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        primitive::write_u16(&mut buf, self.status);
        primitive::write_string(&mut buf, &self.message);
        primitive::write_bytes(&mut buf, &self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ArpcError> {
        let mut cur = Cursor::new(buf);
        let status = cur.read_u16().map_err(ArpcError::Protocol)?;
        let message = primitive::read_string(&mut cur).map_err(ArpcError::Protocol)?;
        let data = cur.read_bytes().map_err(ArpcError::Protocol)?;
        Ok(Response { status, message, data, raw_stream: None })
    }

    /// Reconstruct the local error a non-2xx response represents.
    pub fn into_error(self) -> ArpcError {
        match WireError::decode(&self.data) {
            Ok(wire) => ArpcError::Remote(wire),
            Err(_) => ArpcError::Protocol(format!(
                "status {} with undecodable error body: {}",
                self.status, self.message
            )),
        }
    }
}

/// Metadata carried in a status-213 response's `data` field when the
/// caller requested the direct-buffer side-channel (spec §4.3): bytes
/// immediately available to read and whether this is the file's last
/// range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectBufferMeta {
    pub available: u32,
    pub eof: bool,
}

impl DirectBufferMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        primitive::write_u32(&mut buf, self.available);
        primitive::write_bool(&mut buf, self.eof);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ArpcError> {
        let mut cur = Cursor::new(buf);
        let available = cur.read_u32().map_err(ArpcError::Protocol)?;
        let eof = cur.read_bool().map_err(ArpcError::Protocol)?;
        Ok(Self { available, eof })
    }
}
