//! ARPCFS client (spec §4.8): a filesystem-like API over one ARPC
//! [`Session`], consumed by [`crate::fuse_bridge`].

pub mod cache;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::codec::primitive::{self, Cursor};
use crate::error::ArpcError;
use crate::mux::Mux;
use crate::session::Session;
use crate::vssfs::types::{decode_file_info_list, StatFs, VssFileInfo, Whence};

use self::cache::ClientCaches;
use self::stats::AccessStats;

/// Minimum and maximum chunk size for a client-driven `ReadAt` (spec
/// §4.8: "chunks sized between 64 KiB and 1 MiB").
pub const READ_CHUNK_MIN: usize = 64 * 1024;
pub const READ_CHUNK_MAX: usize = 1024 * 1024;

/// Retry policy for transient `ReadAt` failures (spec §4.8, §7
/// propagation policy: "retries only transient network/stream errors up
/// to 3 times with exponential backoff").
const MAX_READ_RETRIES: u32 = 3;
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const RETRY_MAX_BACKOFF: Duration = Duration::from_millis(800);

/// Client binding to one job's remote [`crate::vssfs::VssFsServer`].
pub struct ArpcfsClient<M: Mux + 'static> {
    session: Arc<Session<M>>,
    job_id: Arc<str>,
    caches: ClientCaches,
    stats: Arc<AccessStats>,
}

impl<M: Mux + 'static> ArpcfsClient<M> {
    pub fn new(session: Arc<Session<M>>, job_id: impl Into<Arc<str>>) -> Self {
        Self { session, job_id: job_id.into(), caches: ClientCaches::default(), stats: Arc::new(AccessStats::new()) }
    }

    pub fn stats(&self) -> &Arc<AccessStats> {
        &self.stats
    }

    fn method(&self, name: &str) -> String {
        format!("{}/{name}", self.job_id)
    }

    #[instrument(skip(self))]
    pub async fn stat(&self, path: &str) -> Result<VssFileInfo, ArpcError> {
        if let Some(cached) = self.caches.get_stat(path) {
            return Ok((*cached).clone());
        }
        let mut payload = Vec::new();
        primitive::write_string(&mut payload, path);
        let data = self.session.call_msg(&self.method("Stat"), payload, None).await?;
        let info = VssFileInfo::decode_standalone(&data)?;
        self.caches.put_stat(path.to_string(), info.clone());
        self.stats.record_file_access(path);
        Ok(info)
    }

    #[instrument(skip(self))]
    pub async fn read_dir(&self, path: &str) -> Result<Arc<Vec<VssFileInfo>>, ArpcError> {
        if let Some(cached) = self.caches.get_read_dir(path) {
            return Ok(cached);
        }
        let mut payload = Vec::new();
        primitive::write_string(&mut payload, path);
        let data = self.session.call_msg(&self.method("ReadDir"), payload, None).await?;
        let entries = decode_file_info_list(&data)?;
        self.caches.put_read_dir(path.to_string(), entries.clone());
        self.stats.record_dir_access(path);
        Ok(Arc::new(entries))
    }

    #[instrument(skip(self))]
    pub async fn statfs(&self) -> Result<Arc<StatFs>, ArpcError> {
        if let Some(cached) = self.caches.get_statfs() {
            return Ok(cached);
        }
        let data = self.session.call_msg(&self.method("StatFS"), Vec::new(), None).await?;
        let statfs = StatFs::decode(&data)?;
        self.caches.put_statfs(statfs);
        Ok(Arc::new(statfs))
    }

    /// Opens `path` with `flags` and returns a handle usable for
    /// `ReadAt`/`Lseek`/`Close` (spec §4.8 "Open, OpenFile"). Flags
    /// carrying any write intent are rejected by the server with
    /// permission-denied before a handle is ever allocated.
    #[instrument(skip(self))]
    pub async fn open_file(&self, path: &str, flags: u32) -> Result<ArpcfsFileHandle<M>, ArpcError> {
        let mut payload = Vec::new();
        primitive::write_string(&mut payload, path);
        primitive::write_u32(&mut payload, flags);
        primitive::write_u32(&mut payload, 0);
        let data = self.session.call_msg(&self.method("OpenFile"), payload, None).await?;
        let mut cur = Cursor::new(&data);
        let handle_id = cur.read_u64().map_err(ArpcError::Protocol)?;
        self.stats.record_file_access(path);
        Ok(ArpcfsFileHandle {
            session: Arc::clone(&self.session),
            job_id: Arc::clone(&self.job_id),
            handle_id,
            stats: Arc::clone(&self.stats),
        })
    }
}

/// A remote open file handle (spec §3 "FileHandle"). `ReadAt` breaks a
/// logical read into 64 KiB–1 MiB chunks and retries only transient
/// failures, resetting the retry counter after every chunk that lands
/// (spec §4.8).
pub struct ArpcfsFileHandle<M: Mux + 'static> {
    session: Arc<Session<M>>,
    job_id: Arc<str>,
    handle_id: u64,
    stats: Arc<AccessStats>,
}

impl<M: Mux + 'static> ArpcfsFileHandle<M> {
    fn method(&self, name: &str) -> String {
        format!("{}/{name}", self.job_id)
    }

    #[instrument(skip(self, buf))]
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(usize, bool), ArpcError> {
        let mut total = 0usize;
        let mut cursor = offset;
        let mut eof = false;

        while total < buf.len() {
            let want = std::cmp::min(buf.len() - total, READ_CHUNK_MAX);
            let (n, chunk_eof) = self.read_chunk_with_retry(cursor, &mut buf[total..total + want]).await?;
            total += n;
            cursor += n as u64;
            self.stats.record_bytes_read(n as u64);
            if chunk_eof || n == 0 {
                eof = chunk_eof;
                break;
            }
        }
        Ok((total, eof))
    }

    async fn read_chunk_with_retry(
        &self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(usize, bool), ArpcError> {
        let mut attempt = 0u32;
        let mut delay = RETRY_INITIAL_BACKOFF;
        loop {
            attempt += 1;
            let mut payload = Vec::new();
            primitive::write_u64(&mut payload, self.handle_id);
            primitive::write_i64(&mut payload, offset as i64);
            primitive::write_u32(&mut payload, buf.len() as u32);

            match self.session.call_msg_with_buffer(&self.method("ReadAt"), payload, None, buf).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.kind().is_transient() && attempt < MAX_READ_RETRIES => {
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, RETRY_MAX_BACKOFF);
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn lseek(&self, offset: i64, whence: Whence) -> Result<i64, ArpcError> {
        let mut payload = Vec::new();
        primitive::write_u64(&mut payload, self.handle_id);
        primitive::write_i64(&mut payload, offset);
        primitive::write_u8(&mut payload, whence as u8);
        let data = self.session.call_msg(&self.method("Lseek"), payload, None).await?;
        let mut cur = Cursor::new(&data);
        cur.read_i64().map_err(ArpcError::Protocol)
    }

    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), ArpcError> {
        let mut payload = Vec::new();
        primitive::write_u64(&mut payload, self.handle_id);
        self.session.call_msg(&self.method("Close"), payload, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::router::Router;
    use crate::vssfs::snapshot::DirectorySnapshot;
    use crate::vssfs::VssFsServer;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex as AsyncMutex;

    struct PairedMux {
        outbound: AsyncMutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl Mux for PairedMux {
        type Stream = DuplexStream;

        async fn open_stream(&self) -> Result<Self::Stream, ArpcError> {
            self.outbound
                .lock()
                .await
                .pop()
                .ok_or(ArpcError::ConnectionLost)
        }

        async fn accept_stream(&self) -> Result<Self::Stream, ArpcError> {
            Err(ArpcError::ConnectionLost)
        }
    }

    /// Wires an `ArpcfsClient` directly to an in-process `Router` serving
    /// one VSSFS server, pre-seeding as many duplex stream pairs as the
    /// test will need (this fake mux hands out one pre-opened stream per
    /// `open_stream` call instead of multiplexing a single connection).
    fn client_against_local_server(
        root: &std::path::Path,
        job_id: &str,
        stream_pairs: usize,
    ) -> Arc<ArpcfsClient<PairedMux>> {
        let snap = Arc::new(DirectorySnapshot::new("snap-1", 'C', root));
        let server = VssFsServer::new(job_id, snap).unwrap();
        let router = Arc::new(Router::new());
        server.register(&router);

        let mut client_streams = Vec::new();
        for _ in 0..stream_pairs {
            let (client_side, mut server_side) = tokio::io::duplex(4 * 1024 * 1024);
            client_streams.push(client_side);
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                let _ = router.serve_stream(&mut server_side).await;
            });
        }

        let mux = PairedMux { outbound: AsyncMutex::new(client_streams) };
        let reconnect_fn: crate::session::ReconnectFn<PairedMux> =
            Arc::new(|| Box::pin(async { Err(ArpcError::ConnectionLost) }));
        let session = Session::new(mux, reconnect_fn, crate::session::SessionConfig::default());
        Arc::new(ArpcfsClient::new(session, job_id.to_string()))
    }

    #[tokio::test]
    async fn stat_is_cached_after_first_call() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let client = client_against_local_server(dir.path(), "job1", 4);

        let first = client.stat("a.txt").await.unwrap();
        assert_eq!(first.size, 5);
        // A second call must succeed whether served from cache or remote.
        let second = client.stat("a.txt").await.unwrap();
        assert_eq!(second.size, 5);
    }

    #[tokio::test]
    async fn open_file_read_at_and_close_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
        let client = client_against_local_server(dir.path(), "job1", 4);

        let handle = client.open_file("a.txt", 0).await.unwrap();
        let mut buf = vec![0u8; 10];
        let (n, _eof) = handle.read_at(0, &mut buf).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf[..n], b"0123456789");
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn open_file_with_write_flag_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        let client = client_against_local_server(dir.path(), "job1", 4);

        let result = client.open_file("a.txt", crate::vssfs::types::open_flags::WRONLY).await;
        assert!(matches!(result, Err(ArpcError::Remote(_))));
        let err = result.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn read_dir_caches_empty_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        let client = client_against_local_server(dir.path(), "job1", 4);

        let entries = client.read_dir("empty").await.unwrap();
        assert!(entries.is_empty());
        // Served from cache the second time; still empty, not an error.
        let entries = client.read_dir("empty").await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn access_stats_record_unique_paths_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let client = client_against_local_server(dir.path(), "job1", 4);

        client.stat("a.txt").await.unwrap();
        let handle = client.open_file("a.txt", 0).await.unwrap();
        let mut buf = vec![0u8; 5];
        handle.read_at(0, &mut buf).await.unwrap();

        let snap = client.stats().snapshot();
        assert_eq!(snap.unique_files, 1);
        assert_eq!(snap.bytes_read, 5);
    }
}
