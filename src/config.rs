//! Tunable configuration structs (ambient stack: the core takes these as
//! plain values; wiring them from a config file or CLI is outside this
//! crate's scope, spec §1 Non-goals). Every struct derives `Deserialize`
//! so an embedding binary can load them from TOML/JSON/env without this
//! crate caring which.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mux::MuxConfig as MuxTunables;
use crate::session::SessionConfig;

/// Paths to the certificate material used for mutual TLS bootstrap (spec
/// §4.10, §6 "TLS"): the agent presents a certificate issued by the
/// server's CA, the server presents its own certificate chained to the
/// same CA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

/// Client-side bootstrap parameters (spec §4.10, §6 "Transport
/// bootstrap").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientBootstrapConfig {
    pub endpoint: String,
    pub client_identity: String,
    #[serde(default = "default_upgrade_path")]
    pub upgrade_path: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

/// Server-side bootstrap parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerBootstrapConfig {
    pub bind_addr: String,
    #[serde(default = "default_upgrade_path")]
    pub upgrade_path: String,
}

fn default_upgrade_path() -> String {
    "/plus/arpc".to_string()
}

fn default_protocol_version() -> String {
    "1".to_string()
}

/// Root configuration an embedding binary builds and feeds into
/// [`crate::bootstrap`], [`crate::arpcfs`], and [`crate::fuse_bridge`].
/// `#[serde(default)]` on every tunable block means a near-empty config
/// file still produces the spec's documented defaults (spec §4.2, §4.3,
/// §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub tls: TlsConfig,
    #[serde(default)]
    pub mux: MuxConfigDef,
    #[serde(default)]
    pub session: SessionConfigDef,
    #[serde(default)]
    pub cache: CacheConfigDef,
    #[serde(default)]
    pub mount: MountConfigDef,
}

/// Serde-friendly mirror of [`MuxTunables`] (durations aren't `Deserialize`
/// without a wrapper, so the core reads milliseconds and converts).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfigDef {
    pub max_frame_size: usize,
    pub receive_buffer: usize,
    pub stream_buffer: usize,
}

impl Default for MuxConfigDef {
    fn default() -> Self {
        let d = MuxTunables::default();
        Self {
            max_frame_size: d.max_frame_size,
            receive_buffer: d.receive_buffer,
            stream_buffer: d.stream_buffer,
        }
    }
}

impl From<MuxConfigDef> for MuxTunables {
    fn from(v: MuxConfigDef) -> Self {
        MuxTunables {
            max_frame_size: v.max_frame_size,
            receive_buffer: v.receive_buffer,
            stream_buffer: v.stream_buffer,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfigDef {
    pub default_call_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_reconnect_attempts: u32,
    pub keepalive_interval_ms: u64,
    pub keepalive_timeout_ms: u64,
}

impl Default for SessionConfigDef {
    fn default() -> Self {
        let d = SessionConfig::default();
        Self {
            default_call_timeout_ms: d.default_call_timeout.as_millis() as u64,
            initial_backoff_ms: d.initial_backoff.as_millis() as u64,
            max_backoff_ms: d.max_backoff.as_millis() as u64,
            max_reconnect_attempts: d.max_reconnect_attempts,
            keepalive_interval_ms: d.keepalive_interval.as_millis() as u64,
            keepalive_timeout_ms: d.keepalive_timeout.as_millis() as u64,
        }
    }
}

impl From<SessionConfigDef> for SessionConfig {
    fn from(v: SessionConfigDef) -> Self {
        SessionConfig {
            default_call_timeout: Duration::from_millis(v.default_call_timeout_ms),
            initial_backoff: Duration::from_millis(v.initial_backoff_ms),
            max_backoff: Duration::from_millis(v.max_backoff_ms),
            max_reconnect_attempts: v.max_reconnect_attempts,
            keepalive_interval: Duration::from_millis(v.keepalive_interval_ms),
            keepalive_timeout: Duration::from_millis(v.keepalive_timeout_ms),
        }
    }
}

/// Client-side cache sizing (spec §4.8 "Bounded LRU maps").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfigDef {
    pub stat_entries: u64,
    pub readdir_entries: u64,
    pub shards: u8,
}

impl Default for CacheConfigDef {
    fn default() -> Self {
        Self { stat_entries: 1024, readdir_entries: 1024, shards: 16 }
    }
}

/// FUSE mount options (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfigDef {
    pub read_only: bool,
    pub allow_other: bool,
    pub noatime: bool,
    pub attr_timeout_secs: u64,
    pub entry_timeout_secs: u64,
}

impl Default for MountConfigDef {
    fn default() -> Self {
        Self {
            read_only: true,
            allow_other: false,
            noatime: true,
            attr_timeout_secs: 60,
            entry_timeout_secs: 60,
        }
    }
}
