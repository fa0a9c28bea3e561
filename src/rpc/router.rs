//! Method dispatch (spec §4.4).
//!
//! A [`Router`] is a map from method name to handler, guarded by a
//! reader-writer lock so registration (writer, rare — once per backup
//! session start/stop) never blocks dispatch (reader, constant). This
//! mirrors the teacher's actor-per-connection pipeline
//! (`read_task`/`vfs_task`/`stream_writer`) in spirit — a stream's serve
//! loop never blocks another stream — but replaces the teacher's
//! unbounded-mpsc command queue (still `todo!()` in every stub) with
//! direct async dispatch, since ARPC streams are already independent
//! tasks handed out by the mux (spec §5: "the router's per-stream serve
//! task MUST NOT block other streams").

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{instrument, warn};

use crate::codec::{self, pool::BufferPool};
use crate::error::{status, ArpcError};
use crate::rpc::{Request, Response};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered method handler. Returns `Ok(response)` for every outcome
/// the method itself defines (including application-level statuses such
/// as 403/404); returns `Err` only for failures the handler did not
/// anticipate, which the router always surfaces as status 500.
pub type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response, ArpcError>> + Send + Sync>;

pub struct Router {
    handlers: RwLock<HashMap<String, Handler>>,
    pool: BufferPool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            pool: BufferPool::new(codec::SMALL_MESSAGE_THRESHOLD, 16),
        }
    }

    pub fn register(&self, method: impl Into<String>, handler: Handler) {
        let method = method.into();
        self.handlers.write().expect("router handler lock poisoned").insert(method, handler);
    }

    pub fn deregister(&self, method: &str) {
        self.handlers.write().expect("router handler lock poisoned").remove(method);
    }

    /// Removes every handler whose method name starts with `prefix`,
    /// used by the VSSFS server to unregister a whole job's handlers on
    /// shutdown (spec §4.7).
    pub fn deregister_prefix(&self, prefix: &str) {
        self.handlers
            .write()
            .expect("router handler lock poisoned")
            .retain(|method, _| !method.starts_with(prefix));
    }

    fn lookup(&self, method: &str) -> Option<Handler> {
        self.handlers.read().expect("router handler lock poisoned").get(method).cloned()
    }

    /// Reads one framed [`Request`] from `stream`, dispatches it, and
    /// writes the framed [`Response`] (plus binary tail, if any) back.
    /// The stream is expected to be closed by the caller afterwards
    /// (spec §4.4: "the stream is always closed after serving").
    #[instrument(skip(self, stream), fields(method))]
    pub async fn serve_stream<S>(&self, stream: &mut S) -> Result<(), ArpcError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let raw = codec::read_frame(stream, &self.pool).await?;

        let request = match Request::decode(&raw) {
            Ok(req) => req,
            Err(err) => {
                warn!(%err, "malformed request");
                let resp = Response {
                    status: status::BAD_REQUEST,
                    message: err.to_string(),
                    data: err.to_wire().encode(),
                    raw_stream: None,
                };
                codec::write_frame(stream, &resp.encode()).await?;
                return Ok(());
            }
        };
        tracing::Span::current().record("method", &request.method.as_str());

        let handler = self.lookup(&request.method);
        let response = match handler {
            None => Response {
                status: status::NOT_FOUND,
                message: format!("unknown method: {}", request.method),
                data: ArpcError::Protocol(format!("unknown method: {}", request.method))
                    .to_wire()
                    .encode(),
                raw_stream: None,
            },
            Some(handler) => match handler(request).await {
                Ok(resp) => resp,
                Err(err) => Response {
                    status: status::INTERNAL_ERROR,
                    message: err.to_string(),
                    data: err.to_wire().encode(),
                    raw_stream: None,
                },
            },
        };

        let is_binary = response.status == status::BINARY_STREAM_FOLLOWS;
        let raw_stream = if is_binary { response.raw_stream } else { None };
        codec::write_frame(stream, &response.encode()).await?;

        if let Some(raw_stream) = raw_stream {
            raw_stream(stream).await?;
        }

        Ok(())
    }
}
