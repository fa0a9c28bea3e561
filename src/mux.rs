//! Stream multiplexer contract (spec §4.2).
//!
//! This project treats the multiplexer as an external collaborator: one
//! reliable, ordered byte stream goes in, many independent bidirectional
//! logical streams come out. [`Mux`] is the seam the rest of the crate
//! codes against; [`YamuxMux`] is the concrete binding onto the `yamux`
//! crate (the same multiplexer family `libp2p` uses), chosen because it
//! is a real, actively maintained Rust stream multiplexer with
//! version-2 framing and per-connection/per-stream window configuration,
//! matching spec §4.2's "Version 2 framing (supports fragmentation of
//! large frames)" requirement. Nothing elsewhere in this crate depends on
//! `yamux` directly — only on [`Mux`] — so swapping multiplexers later
//! is a one-module change.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use yamux::{Config, Connection, Mode};

use crate::error::ArpcError;

/// Required configuration values for the core (spec §4.2). Keepalive
/// interval/timeout live on [`crate::session::SessionConfig`] instead of
/// here: enforcement is an application-level `ping` round trip sent by
/// [`crate::session::Session::spawn_keepalive`], not a yamux-level knob
/// (spec §B "Keepalive enforcement").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxConfig {
    pub max_frame_size: usize,
    pub receive_buffer: usize,
    pub stream_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 256 * 1024,
            receive_buffer: 8 * 1024 * 1024,
            stream_buffer: 1024 * 1024,
        }
    }
}

impl MuxConfig {
    fn yamux_config(self) -> Config {
        let mut cfg = Config::default();
        cfg.set_max_num_streams(usize::MAX);
        cfg.set_split_send_size(self.max_frame_size);
        cfg.set_max_connection_receive_window(Some(self.receive_buffer));
        cfg.set_receive_window(self.stream_buffer as u32);
        cfg
    }
}

/// A single logical stream inside a [`Mux`] session (spec §3 "Stream").
pub trait MuxStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> MuxStream for T {}

/// The multiplexer contract a [`crate::session::Session`] is built on
/// (spec §4.2): open outbound streams, accept inbound ones.
#[async_trait]
pub trait Mux: Send + Sync {
    type Stream: MuxStream + 'static;

    async fn open_stream(&self) -> Result<Self::Stream, ArpcError>;
    async fn accept_stream(&self) -> Result<Self::Stream, ArpcError>;
}

/// A [`Mux`] backed by a single `yamux` connection over one underlying
/// transport `T` (a TLS connection, post-Upgrade — spec §4.10).
pub struct YamuxMux<T> {
    control: yamux::Control,
    _marker: std::marker::PhantomData<T>,
    driver: tokio::task::JoinHandle<()>,
    inbound: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Result<yamux::Stream, ArpcError>>>,
}

impl<T> YamuxMux<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Takes ownership of the raw post-Upgrade connection and starts
    /// driving the yamux connection on a background task. `mode`
    /// distinguishes the client and server roles (spec §4.10).
    pub fn new(socket: T, config: MuxConfig, mode: Mode) -> Self {
        let mut connection = Connection::new(socket, config.yamux_config(), mode);
        let control = connection.control();
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        let driver = tokio::spawn(async move {
            loop {
                match connection.next_stream().await {
                    Ok(Some(stream)) => {
                        if tx.send(Ok(stream)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Err(ArpcError::ConnectionLost)).await;
                        break;
                    }
                    Err(_) => {
                        let _ = tx.send(Err(ArpcError::ConnectionLost)).await;
                        break;
                    }
                }
            }
        });

        Self { control, _marker: std::marker::PhantomData, driver, inbound: tokio::sync::Mutex::new(rx) }
    }
}

impl<T> Drop for YamuxMux<T> {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl<T> Mux for YamuxMux<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Stream = yamux::Stream;

    async fn open_stream(&self) -> Result<Self::Stream, ArpcError> {
        let mut control = self.control.clone();
        control.open_stream().await.map_err(|_| ArpcError::ConnectionLost)
    }

    async fn accept_stream(&self) -> Result<Self::Stream, ArpcError> {
        let mut rx = self.inbound.lock().await;
        rx.recv().await.unwrap_or(Err(ArpcError::ConnectionLost))
    }
}
