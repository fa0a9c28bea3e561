//! Remote read-only snapshot filesystem server (spec §4.7).
//!
//! One [`VssFsServer`] exists per active backup session, bound to a
//! snapshot and a job id. Registering it installs `OpenFile`, `Stat`,
//! `ReadDir`, `ReadAt`, `Lseek`, `Close`, `StatFS` handlers on a
//! [`Router`] under the `{jobId}/` method prefix; deregistering removes
//! them and tears down the handle table (spec §4.7).

pub mod handle;
pub mod snapshot;
pub mod types;

use std::fs::File;
use std::future::Future;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::instrument;

use crate::error::{ArpcError, ErrorKind, WireError};
use crate::rpc::binary_stream::{self, CHUNK_POOL_BUFFER_SIZE};
use crate::rpc::router::{Handler, Router};
use crate::rpc::{DirectBufferMeta, Request, Response};

use self::handle::HandleTable;
use self::snapshot::Snapshot;
use self::types::{
    decode_file_info_list, encode_file_info_list, open_flags, StatFs, VssFileInfo,
    Whence, DEFAULT_BLOCK_SIZE, NOMINAL_FILE_COUNT,
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const METHOD_OPEN_FILE: &str = "OpenFile";
const METHOD_STAT: &str = "Stat";
const METHOD_READ_DIR: &str = "ReadDir";
const METHOD_READ_AT: &str = "ReadAt";
const METHOD_LSEEK: &str = "Lseek";
const METHOD_CLOSE: &str = "Close";
const METHOD_STATFS: &str = "StatFS";

/// Remote read-only filesystem rooted at one [`Snapshot`] (spec §4.7).
pub struct VssFsServer {
    job_id: String,
    snapshot: Arc<dyn Snapshot>,
    handles: HandleTable,
    statfs: StatFs,
}

impl VssFsServer {
    pub fn new(job_id: impl Into<String>, snapshot: Arc<dyn Snapshot>) -> Result<Arc<Self>, ArpcError> {
        let statfs = compute_statfs(snapshot.root())?;
        Ok(Arc::new(Self { job_id: job_id.into(), snapshot, handles: HandleTable::new(), statfs }))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn method(&self, name: &str) -> String {
        format!("{}/{name}", self.job_id)
    }

    /// Installs this server's handlers on `router` (spec §4.7).
    pub fn register(self: &Arc<Self>, router: &Router) {
        macro_rules! register {
            ($name:expr, $handler:ident) => {{
                let this = Arc::clone(self);
                let handler: Handler = Arc::new(move |req: Request| {
                    let this = Arc::clone(&this);
                    Box::pin(async move { this.$handler(req).await }) as BoxFuture<'static, _>
                });
                router.register(self.method($name), handler);
            }};
        }
        register!(METHOD_OPEN_FILE, handle_open_file);
        register!(METHOD_STAT, handle_stat);
        register!(METHOD_READ_DIR, handle_read_dir);
        register!(METHOD_READ_AT, handle_read_at);
        register!(METHOD_LSEEK, handle_lseek);
        register!(METHOD_CLOSE, handle_close);
        register!(METHOD_STATFS, handle_statfs);
    }

    /// Removes this server's handlers, clears the handle table (closing
    /// every native handle), and releases the snapshot (spec §4.7 "On
    /// shutdown").
    pub fn shutdown(&self, router: &Router) {
        router.deregister_prefix(&format!("{}/", self.job_id));
        self.handles.clear();
        self.snapshot.close();
    }

    /// Joins `rel` onto the snapshot root, rejecting anything that
    /// escapes it (spec §4.7 "Path resolution"). The empty string and
    /// `.` resolve to the root.
    fn resolve_path(&self, rel: &str) -> Result<PathBuf, ArpcError> {
        let rel_path = Path::new(rel);
        let mut resolved = self.snapshot.root().to_path_buf();
        for component in rel_path.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(not_found(format!("path escapes snapshot root: {rel}")));
                }
            }
        }
        if !resolved.starts_with(self.snapshot.root()) {
            return Err(not_found(format!("path escapes snapshot root: {rel}")));
        }
        Ok(resolved)
    }

    #[instrument(skip(self, req))]
    async fn handle_open_file(&self, req: Request) -> Result<Response, ArpcError> {
        let mut cur = crate::codec::primitive::Cursor::new(&req.payload);
        let path = crate::codec::primitive::read_string(&mut cur).map_err(ArpcError::Protocol)?;
        let flags = cur.read_u32().map_err(ArpcError::Protocol)?;
        let _mode = cur.read_u32().map_err(ArpcError::Protocol)?;

        if flags & open_flags::WRITE_IMPLYING != 0 {
            return Ok(error_response(permission_denied("write-implying flag on read-only snapshot")));
        }

        let resolved = match self.resolve_path(&path) {
            Ok(p) => p,
            Err(err) => return Ok(error_response(err)),
        };

        let job_id = self.job_id.clone();
        let opened = tokio::task::spawn_blocking(move || -> Result<(File, bool), std::io::Error> {
            let file = File::open(&resolved)?;
            let is_dir = file.metadata()?.is_dir();
            Ok((file, is_dir))
        })
        .await
        .map_err(|e| ArpcError::Protocol(format!("open task panicked: {e}")))?;

        match opened {
            Ok((file, is_dir)) => {
                let id = self.handles.insert(file, is_dir);
                tracing::debug!(job_id, handle = id, is_dir, "opened handle");
                let mut out = Vec::new();
                crate::codec::primitive::write_u64(&mut out, id);
                Ok(Response::ok(out))
            }
            Err(err) => Ok(error_response(map_io_not_found(err))),
        }
    }

    #[instrument(skip(self, req))]
    async fn handle_stat(&self, req: Request) -> Result<Response, ArpcError> {
        let mut cur = crate::codec::primitive::Cursor::new(&req.payload);
        let path = crate::codec::primitive::read_string(&mut cur).map_err(ArpcError::Protocol)?;
        let resolved = match self.resolve_path(&path) {
            Ok(p) => p,
            Err(err) => return Ok(error_response(err)),
        };
        let block_size = self.statfs.block_size;

        let name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let result = tokio::task::spawn_blocking(move || stat_path(&resolved, &name, block_size))
            .await
            .map_err(|e| ArpcError::Protocol(format!("stat task panicked: {e}")))?;

        match result {
            Ok(info) => Ok(Response::ok(info.encode())),
            Err(err) => Ok(error_response(err)),
        }
    }

    #[instrument(skip(self, req))]
    async fn handle_read_dir(&self, req: Request) -> Result<Response, ArpcError> {
        let mut cur = crate::codec::primitive::Cursor::new(&req.payload);
        let path = crate::codec::primitive::read_string(&mut cur).map_err(ArpcError::Protocol)?;
        let resolved = match self.resolve_path(&path) {
            Ok(p) => p,
            Err(err) => return Ok(error_response(err)),
        };
        let block_size = self.statfs.block_size;

        let result = tokio::task::spawn_blocking(move || read_dir_entries(&resolved, block_size))
            .await
            .map_err(|e| ArpcError::Protocol(format!("readdir task panicked: {e}")))?;

        match result {
            Ok(entries) => Ok(Response::ok(encode_file_info_list(&entries))),
            Err(err) => Ok(error_response(err)),
        }
    }

    #[instrument(skip(self, req))]
    async fn handle_read_at(&self, req: Request) -> Result<Response, ArpcError> {
        let mut cur = crate::codec::primitive::Cursor::new(&req.payload);
        let handle_id = cur.read_u64().map_err(ArpcError::Protocol)?;
        let offset = cur.read_i64().map_err(ArpcError::Protocol)?;
        let length = cur.read_u32().map_err(ArpcError::Protocol)?;

        if offset < 0 {
            return Ok(error_response(invalid_argument("negative offset")));
        }

        let handle = match self.handles.get(handle_id) {
            Ok(h) => h,
            Err(err) => return Ok(error_response(err)),
        };
        if handle.is_dir {
            return Ok(error_response(invalid_argument("read-at on a directory handle")));
        }

        let result = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, bool), std::io::Error> {
            let mut file = handle.file.lock().expect("handle mutex poisoned");
            let actual = file.seek(SeekFrom::Start(offset as u64))?;
            if actual != offset as u64 {
                return Err(std::io::Error::other("seek landed at unexpected position"));
            }
            if length == 0 {
                let size = file.metadata()?.len();
                return Ok((Vec::new(), actual >= size));
            }
            let mut buf = vec![0u8; length as usize];
            let mut filled = 0usize;
            let mut eof = false;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..])?;
                if n == 0 {
                    eof = true;
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok((buf, eof))
        })
        .await
        .map_err(|e| ArpcError::Protocol(format!("read-at task panicked: {e}")))?;

        let (data, eof) = match result {
            Ok(v) => v,
            Err(err) if err.to_string().contains("unexpected position") => {
                return Ok(error_response(invalid_argument("seek landed at unexpected position")))
            }
            Err(err) => return Ok(error_response(ArpcError::Io(err))),
        };

        let meta = DirectBufferMeta { available: data.len() as u32, eof };
        let raw_stream: crate::rpc::RawStreamWriter = Box::new(move |stream| {
            Box::pin(async move {
                for chunk in data.chunks(CHUNK_POOL_BUFFER_SIZE) {
                    binary_stream::write_chunk(stream, chunk).await?;
                }
                binary_stream::write_terminator(stream, data.len() as u64).await?;
                Ok(())
            })
        });
        Ok(Response::binary_stream_follows(meta.encode(), raw_stream))
    }

    #[instrument(skip(self, req))]
    async fn handle_lseek(&self, req: Request) -> Result<Response, ArpcError> {
        let mut cur = crate::codec::primitive::Cursor::new(&req.payload);
        let handle_id = cur.read_u64().map_err(ArpcError::Protocol)?;
        let offset = cur.read_i64().map_err(ArpcError::Protocol)?;
        let whence_byte = cur.read_u8().map_err(ArpcError::Protocol)?;
        let whence = match Whence::from_u8(whence_byte) {
            Ok(w) => w,
            Err(err) => return Ok(error_response(err)),
        };

        let handle = match self.handles.get(handle_id) {
            Ok(h) => h,
            Err(err) => return Ok(error_response(err)),
        };

        let result =
            tokio::task::spawn_blocking(move || lseek_handle(&handle, offset, whence))
                .await
                .map_err(|e| ArpcError::Protocol(format!("lseek task panicked: {e}")))?;

        match result {
            Ok(new_offset) => {
                let mut out = Vec::new();
                crate::codec::primitive::write_i64(&mut out, new_offset);
                Ok(Response::ok(out))
            }
            Err(err) => Ok(error_response(err)),
        }
    }

    #[instrument(skip(self, req))]
    async fn handle_close(&self, req: Request) -> Result<Response, ArpcError> {
        let mut cur = crate::codec::primitive::Cursor::new(&req.payload);
        let handle_id = cur.read_u64().map_err(ArpcError::Protocol)?;
        match self.handles.remove(handle_id) {
            Ok(()) => Ok(Response::ok(Vec::new())),
            Err(err) => Ok(error_response(err)),
        }
    }

    #[instrument(skip(self, _req))]
    async fn handle_statfs(&self, _req: Request) -> Result<Response, ArpcError> {
        Ok(Response::ok(self.statfs.encode()))
    }
}

fn compute_statfs(root: &Path) -> Result<StatFs, ArpcError> {
    let c_path = std::ffi::CString::new(root.as_os_str().as_encoded_bytes())
        .map_err(|e| ArpcError::Protocol(format!("snapshot root contains NUL: {e}")))?;
    let mut raw: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut raw) };
    if rc != 0 {
        return Err(ArpcError::Io(std::io::Error::last_os_error()));
    }

    let block_size = if raw.f_frsize > 0 { raw.f_frsize as u32 } else { DEFAULT_BLOCK_SIZE };
    Ok(StatFs {
        block_size,
        blocks_total: raw.f_blocks as u64,
        // The snapshot is immutable, so free/available are always 0
        // regardless of what the backing filesystem reports (spec §4.7).
        blocks_free: 0,
        blocks_available: 0,
        files_total: NOMINAL_FILE_COUNT,
        files_free: NOMINAL_FILE_COUNT,
        max_name_len: 255,
    })
}

fn stat_path(path: &Path, name: &str, block_size: u32) -> Result<VssFileInfo, ArpcError> {
    let metadata = std::fs::metadata(path).map_err(map_io_not_found)?;
    let is_dir = metadata.is_dir();
    let size = metadata.len();
    let blocks = if is_dir { 0 } else { size.div_ceil(block_size as u64) };
    let mod_time_unix = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    #[cfg(unix)]
    let mode = std::os::unix::fs::PermissionsExt::mode(&metadata.permissions());
    #[cfg(not(unix))]
    let mode = if is_dir { 0o755 } else { 0o644 };

    Ok(VssFileInfo { name: name.to_string(), size, mode, mod_time_unix, is_dir, blocks })
}

fn read_dir_entries(path: &Path, block_size: u32) -> Result<Vec<VssFileInfo>, ArpcError> {
    let dir = std::fs::read_dir(path).map_err(map_io_not_found)?;
    let mut out = Vec::new();
    for entry in dir {
        let entry = entry.map_err(ArpcError::Io)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "." || name == ".." {
            continue;
        }
        if is_hidden_entry(&entry)? {
            continue;
        }
        let info = stat_path(&entry.path(), &name, block_size)?;
        out.push(info);
    }
    Ok(out)
}

/// Approximates spec §4.7's Windows-attribute exclusion list on POSIX
/// hosts: symlinks stand in for reparse points, and non-regular,
/// non-directory entries (block/char devices, fifos, sockets) stand in
/// for "device". There is no POSIX analogue of offline/virtual/
/// recall-on-* attributes, so those are not filtered here.
fn is_hidden_entry(entry: &std::fs::DirEntry) -> Result<bool, ArpcError> {
    let file_type = entry.file_type().map_err(ArpcError::Io)?;
    if file_type.is_symlink() {
        // Stands in for the reparse-point bit (spec §4.7).
        return Ok(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_block_device()
            || file_type.is_char_device()
            || file_type.is_fifo()
            || file_type.is_socket()
        {
            // Stands in for the device bit (spec §4.7).
            return Ok(true);
        }
    }
    Ok(false)
}

fn lseek_handle(handle: &handle::OpenHandle, offset: i64, whence: Whence) -> Result<i64, ArpcError> {
    let mut file = handle.file.lock().expect("handle mutex poisoned");
    let file_size = file.metadata().map_err(ArpcError::Io)?.len() as i64;

    let new_offset = match whence {
        Whence::Start => offset,
        Whence::Current => {
            let current = file.stream_position().map_err(ArpcError::Io)? as i64;
            current + offset
        }
        Whence::End => file_size + offset,
        Whence::Data => seek_data_or_hole(&file, offset, file_size, true)?,
        Whence::Hole => seek_data_or_hole(&file, offset, file_size, false)?,
    };

    if new_offset < 0 {
        return Err(invalid_argument("seek before start of file"));
    }
    if new_offset > file_size {
        return Err(past_end_of_file("sparse seek past end of file"));
    }

    file.seek(SeekFrom::Start(new_offset as u64)).map_err(ArpcError::Io)?;
    Ok(new_offset)
}

/// Finds the next data or hole boundary at or after `offset` using
/// `SEEK_DATA`/`SEEK_HOLE` (Linux only). Falls back to treating the
/// whole file as data when the platform or filesystem doesn't support
/// allocated-range queries (spec §4.7 "Lseek contract").
#[cfg(target_os = "linux")]
fn seek_data_or_hole(file: &File, offset: i64, file_size: i64, want_data: bool) -> Result<i64, ArpcError> {
    use std::os::unix::io::AsRawFd;

    const SEEK_DATA: libc::c_int = 3;
    const SEEK_HOLE: libc::c_int = 4;

    let whence = if want_data { SEEK_DATA } else { SEEK_HOLE };
    let rc = unsafe { libc::lseek(file.as_raw_fd(), offset, whence) };
    if rc >= 0 {
        return Ok(rc);
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENXIO) => Ok(file_size),
        _ => Ok(if want_data { offset } else { file_size }),
    }
}

#[cfg(not(target_os = "linux"))]
fn seek_data_or_hole(_file: &File, offset: i64, file_size: i64, want_data: bool) -> Result<i64, ArpcError> {
    Ok(if want_data { offset } else { file_size })
}

fn error_response(err: ArpcError) -> Response {
    Response::error(&err)
}

fn not_found(message: impl Into<String>) -> ArpcError {
    ArpcError::Remote(WireError::new(ErrorKind::NotFound, message))
}

fn permission_denied(message: impl Into<String>) -> ArpcError {
    ArpcError::Remote(WireError::new(ErrorKind::PermissionDenied, message))
}

fn invalid_argument(message: impl Into<String>) -> ArpcError {
    ArpcError::Remote(WireError::new(ErrorKind::InvalidArgument, message))
}

fn past_end_of_file(message: impl Into<String>) -> ArpcError {
    ArpcError::Remote(WireError::new(ErrorKind::PastEndOfFile, message))
}

fn map_io_not_found(err: std::io::Error) -> ArpcError {
    if err.kind() == std::io::ErrorKind::NotFound {
        not_found(err.to_string())
    } else {
        ArpcError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, pool::BufferPool};
    use crate::error::status;
    use crate::vssfs::snapshot::DirectorySnapshot;
    use std::io::Write;

    fn make_server(root: &Path) -> Arc<VssFsServer> {
        let snap = Arc::new(DirectorySnapshot::new("snap-1", 'C', root));
        VssFsServer::new("job1", snap).unwrap()
    }

    async fn roundtrip(router: &Router, request: Request) -> Response {
        let (mut client, mut server) = tokio::io::duplex(4 * 1024 * 1024);
        let encoded = request.encode();
        let client_task = tokio::spawn(async move {
            codec::write_frame(&mut client, &encoded).await.unwrap();
            let resp_raw = codec::read_frame(&mut client, &BufferPool::new(4096, 2)).await.unwrap();
            let resp = Response::decode(&resp_raw).unwrap();
            let mut tail = vec![0u8; 0];
            if resp.status == status::BINARY_STREAM_FOLLOWS {
                let meta = DirectBufferMeta::decode(&resp.data).unwrap();
                tail = vec![0u8; meta.available as usize];
                let n = binary_stream::read_into(&mut client, &mut tail).await.unwrap();
                tail.truncate(n);
            }
            (resp, tail)
        });
        router.serve_stream(&mut server).await.unwrap();
        client_task.await.unwrap()
    }

    fn open_file_payload(path: &str, flags: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        crate::codec::primitive::write_string(&mut buf, path);
        crate::codec::primitive::write_u32(&mut buf, flags);
        crate::codec::primitive::write_u32(&mut buf, 0);
        buf
    }

    fn path_payload(path: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        crate::codec::primitive::write_string(&mut buf, path);
        buf
    }

    #[tokio::test]
    async fn open_file_then_read_at_returns_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
        let server = make_server(dir.path());
        let router = Router::new();
        server.register(&router);

        let (resp, _) =
            roundtrip(&router, Request::new("job1/OpenFile", open_file_payload("hello.txt", 0))).await;
        assert_eq!(resp.status, status::OK);
        let mut cur = crate::codec::primitive::Cursor::new(&resp.data);
        let handle_id = cur.read_u64().unwrap();

        let mut payload = Vec::new();
        crate::codec::primitive::write_u64(&mut payload, handle_id);
        crate::codec::primitive::write_i64(&mut payload, 0);
        crate::codec::primitive::write_u32(&mut payload, 5);
        let (resp, tail) = roundtrip(&router, Request::new("job1/ReadAt", payload)).await;
        assert_eq!(resp.status, status::BINARY_STREAM_FOLLOWS);
        assert_eq!(tail, b"hello");
    }

    #[tokio::test]
    async fn read_at_with_zero_length_reports_eof_against_file_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello").unwrap();
        let server = make_server(dir.path());
        let router = Router::new();
        server.register(&router);

        let (resp, _) =
            roundtrip(&router, Request::new("job1/OpenFile", open_file_payload("hello.txt", 0))).await;
        let mut cur = crate::codec::primitive::Cursor::new(&resp.data);
        let handle_id = cur.read_u64().unwrap();

        let read_at = |offset: i64| {
            let mut payload = Vec::new();
            crate::codec::primitive::write_u64(&mut payload, handle_id);
            crate::codec::primitive::write_i64(&mut payload, offset);
            crate::codec::primitive::write_u32(&mut payload, 0);
            payload
        };

        let (resp, tail) = roundtrip(&router, Request::new("job1/ReadAt", read_at(0))).await;
        assert_eq!(resp.status, status::BINARY_STREAM_FOLLOWS);
        let meta = DirectBufferMeta::decode(&resp.data).unwrap();
        assert_eq!(meta.available, 0);
        assert!(tail.is_empty());
        assert!(!meta.eof, "offset 0 on a non-empty file is not eof");

        let (resp, _) = roundtrip(&router, Request::new("job1/ReadAt", read_at(5))).await;
        let meta = DirectBufferMeta::decode(&resp.data).unwrap();
        assert!(meta.eof, "offset at file size is eof");
    }

    #[tokio::test]
    async fn open_file_with_write_flag_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello").unwrap();
        let server = make_server(dir.path());
        let router = Router::new();
        server.register(&router);

        let (resp, _) = roundtrip(
            &router,
            Request::new("job1/OpenFile", open_file_payload("hello.txt", open_flags::WRONLY)),
        )
        .await;
        assert_eq!(resp.status, status::FORBIDDEN);
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(dir.path());
        let router = Router::new();
        server.register(&router);

        let (resp, _) =
            roundtrip(&router, Request::new("job1/OpenFile", open_file_payload("../../etc/passwd", 0)))
                .await;
        assert_eq!(resp.status, status::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_handle_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(dir.path());
        let router = Router::new();
        server.register(&router);

        let mut payload = Vec::new();
        crate::codec::primitive::write_u64(&mut payload, 9999);
        crate::codec::primitive::write_i64(&mut payload, 0);
        crate::codec::primitive::write_u32(&mut payload, 1);
        let (resp, _) = roundtrip(&router, Request::new("job1/ReadAt", payload)).await;
        assert_eq!(resp.status, status::NOT_FOUND);
    }

    #[tokio::test]
    async fn close_then_use_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello").unwrap();
        let server = make_server(dir.path());
        let router = Router::new();
        server.register(&router);

        let (resp, _) =
            roundtrip(&router, Request::new("job1/OpenFile", open_file_payload("hello.txt", 0))).await;
        let mut cur = crate::codec::primitive::Cursor::new(&resp.data);
        let handle_id = cur.read_u64().unwrap();

        let mut payload = Vec::new();
        crate::codec::primitive::write_u64(&mut payload, handle_id);
        let (resp, _) = roundtrip(&router, Request::new("job1/Close", payload.clone())).await;
        assert_eq!(resp.status, status::OK);

        let (resp, _) = roundtrip(&router, Request::new("job1/Close", payload)).await;
        assert_eq!(resp.status, status::NOT_FOUND);
    }

    #[tokio::test]
    async fn read_dir_skips_dot_entries_and_reports_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        let server = make_server(dir.path());
        let router = Router::new();
        server.register(&router);

        let (resp, _) = roundtrip(&router, Request::new("job1/ReadDir", path_payload("empty"))).await;
        assert_eq!(resp.status, status::OK);
        let entries = decode_file_info_list(&resp.data).unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn stat_and_read_dir_agree_on_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("a.txt")).unwrap();
        f.write_all(b"0123456789").unwrap();
        drop(f);
        let server = make_server(dir.path());
        let router = Router::new();
        server.register(&router);

        let (resp, _) = roundtrip(&router, Request::new("job1/Stat", path_payload("a.txt"))).await;
        let stat_info = VssFileInfo::decode_standalone(&resp.data).unwrap();

        let (resp, _) = roundtrip(&router, Request::new("job1/ReadDir", path_payload("."))).await;
        let entries = decode_file_info_list(&resp.data).unwrap();
        let dir_entry = entries.into_iter().find(|e| e.name == "a.txt").unwrap();

        assert_eq!(stat_info.size, dir_entry.size);
        assert_eq!(stat_info.is_dir, dir_entry.is_dir);
        assert_eq!(stat_info.mode, dir_entry.mode);
    }

    #[tokio::test]
    async fn statfs_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(dir.path());
        let router = Router::new();
        server.register(&router);

        let (first, _) = roundtrip(&router, Request::new("job1/StatFS", vec![])).await;
        let (second, _) = roundtrip(&router, Request::new("job1/StatFS", vec![])).await;
        assert_eq!(first.data, second.data);
    }

    #[tokio::test]
    async fn shutdown_removes_handlers_and_clears_handles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello").unwrap();
        let server = make_server(dir.path());
        let router = Router::new();
        server.register(&router);

        let (resp, _) =
            roundtrip(&router, Request::new("job1/OpenFile", open_file_payload("hello.txt", 0))).await;
        assert_eq!(resp.status, status::OK);
        assert_eq!(server.handles.len(), 1);

        server.shutdown(&router);
        assert!(server.handles.is_empty());

        let (resp, _) =
            roundtrip(&router, Request::new("job1/OpenFile", open_file_payload("hello.txt", 0))).await;
        assert_eq!(resp.status, status::NOT_FOUND);
    }
}
