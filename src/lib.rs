//! Core transport and filesystem bridge for a disk-to-disk backup agent.
//!
//! Three layers, bottom to top:
//!
//! - **ARPC** ([`codec`], [`rpc`], [`mux`], [`session`], [`session_manager`],
//!   [`bootstrap`]) — a reconnecting, multiplexed RPC transport over mutual
//!   TLS. [`session::Session`] is the unit callers hold; everything below it
//!   (framing, multiplexing, TLS bootstrap) is an implementation detail.
//! - **VSSFS** ([`vssfs`], [`backup_session`], [`control`]) — the server
//!   side: per-job handlers exposing a read-only snapshot over ARPC, plus
//!   the top-level `ping`/`backup`/`cleanup` control-plane methods.
//! - **ARPCFS** ([`arpcfs`], [`fuse_bridge`]) — the client side: a caching
//!   filesystem client and the `fuser` bridge that mounts it.
//!
//! [`config`] holds the serde-friendly tunables an embedding binary wires
//! into the layers above; this crate never reads a config file itself.

pub mod arpcfs;
pub mod backup_session;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod fuse_bridge;
pub mod mux;
pub mod rpc;
pub mod session;
pub mod session_manager;
pub mod vssfs;

pub use error::{ArpcError, ErrorKind};
pub use mux::{Mux, MuxConfig, YamuxMux};
pub use session::{Session, SessionConfig};
