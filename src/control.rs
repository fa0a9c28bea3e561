//! Top-level control-plane handlers: `ping`, `backup`, `cleanup` (spec
//! §6 "Method namespace" — methods "exchanged on the agent control
//! session", registered without any `{jobId}/` prefix). Thin wrappers
//! around [`BackupSessionRegistry::start`]/[`BackupSessionRegistry::stop`]
//! and a trivial round trip, mirroring [`crate::vssfs::VssFsServer`]'s own
//! closure-over-`Arc`-state handler-registration shape.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use crate::backup_session::BackupSessionRegistry;
use crate::codec::primitive::{self, Cursor};
use crate::error::ArpcError;
use crate::rpc::router::{Handler, Router};
use crate::rpc::{Request, Response, BACKUP_METHOD, CLEANUP_METHOD, PING_METHOD};
use crate::vssfs::snapshot::DirectorySnapshot;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Registers `ping`, `backup`, and `cleanup` on `router`, the latter two
/// delegating to `registry`.
pub fn register(router: &Arc<Router>, registry: Arc<BackupSessionRegistry>) {
    router.register(PING_METHOD, ping_handler());
    router.register(BACKUP_METHOD, backup_handler(Arc::clone(&registry), Arc::clone(router)));
    router.register(CLEANUP_METHOD, cleanup_handler(registry, Arc::clone(router)));
}

/// A no-payload round trip (spec §B "`ping` method"): used by the
/// keepalive task in [`crate::session::Session`] and by callers that just
/// want to confirm a session is alive without touching VSSFS state.
fn ping_handler() -> Handler {
    Arc::new(|_req: Request| Box::pin(async move { Ok(Response::ok(Vec::new())) }) as BoxFuture<'static, _>)
}

/// Starts a backup session: decodes (job id, snapshot id, drive letter,
/// snapshot root path) and hands them to [`BackupSessionRegistry::start`]
/// as a [`DirectorySnapshot`]. Acquiring the actual platform snapshot
/// happens upstream of this call (spec §1 Non-goals); this method only
/// binds an already-prepared root path to a job id.
fn backup_handler(registry: Arc<BackupSessionRegistry>, router: Arc<Router>) -> Handler {
    Arc::new(move |req: Request| {
        let registry = Arc::clone(&registry);
        let router = Arc::clone(&router);
        Box::pin(async move {
            let mut cur = Cursor::new(&req.payload);
            let job_id = primitive::read_string(&mut cur).map_err(ArpcError::Protocol)?;
            let snapshot_id = primitive::read_string(&mut cur).map_err(ArpcError::Protocol)?;
            let drive_letter = cur.read_u8().map_err(ArpcError::Protocol)? as char;
            let root = primitive::read_string(&mut cur).map_err(ArpcError::Protocol)?;

            let snapshot = Arc::new(DirectorySnapshot::new(snapshot_id, drive_letter, Path::new(&root)));
            match registry.start(job_id, snapshot, &router) {
                Ok(_) => Ok(Response::ok(Vec::new())),
                Err(err) => Ok(Response::error(&err)),
            }
        }) as BoxFuture<'static, _>
    })
}

/// Stops the backup session for a job id, if one is live (spec §3
/// "Backup session"). A cleanup of a job id with no live session is a
/// harmless no-op, matching [`BackupSessionRegistry::stop`].
fn cleanup_handler(registry: Arc<BackupSessionRegistry>, router: Arc<Router>) -> Handler {
    Arc::new(move |req: Request| {
        let registry = Arc::clone(&registry);
        let router = Arc::clone(&router);
        Box::pin(async move {
            let mut cur = Cursor::new(&req.payload);
            let job_id = primitive::read_string(&mut cur).map_err(ArpcError::Protocol)?;
            registry.stop(&job_id, &router);
            Ok(Response::ok(Vec::new()))
        }) as BoxFuture<'static, _>
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, pool::BufferPool};
    use crate::error::status;

    async fn roundtrip(router: &Router, request: Request) -> Response {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let encoded = request.encode();
        let client_task = tokio::spawn(async move {
            codec::write_frame(&mut client, &encoded).await.unwrap();
            let resp_raw = codec::read_frame(&mut client, &BufferPool::new(4096, 2)).await.unwrap();
            Response::decode(&resp_raw).unwrap()
        });
        router.serve_stream(&mut server).await.unwrap();
        client_task.await.unwrap()
    }

    fn backup_payload(job_id: &str, snapshot_id: &str, drive_letter: char, root: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        primitive::write_string(&mut buf, job_id);
        primitive::write_string(&mut buf, snapshot_id);
        primitive::write_u8(&mut buf, drive_letter as u8);
        primitive::write_string(&mut buf, root);
        buf
    }

    fn cleanup_payload(job_id: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        primitive::write_string(&mut buf, job_id);
        buf
    }

    #[tokio::test]
    async fn ping_round_trips_with_no_payload() {
        let router = Arc::new(Router::new());
        register(&router, Arc::new(BackupSessionRegistry::new()));

        let resp = roundtrip(&router, Request::new(PING_METHOD, vec![])).await;
        assert_eq!(resp.status, status::OK);
        assert!(resp.data.is_empty());
    }

    #[tokio::test]
    async fn backup_then_cleanup_installs_and_removes_job_handlers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        let router = Arc::new(Router::new());
        let registry = Arc::new(BackupSessionRegistry::new());
        register(&router, Arc::clone(&registry));

        let payload = backup_payload("job1", "snap-1", 'C', dir.path().to_str().unwrap());
        let resp = roundtrip(&router, Request::new(BACKUP_METHOD, payload)).await;
        assert_eq!(resp.status, status::OK);
        assert!(registry.get("job1").is_some());

        let mut stat_payload = Vec::new();
        primitive::write_string(&mut stat_payload, "a.txt");
        let resp = roundtrip(&router, Request::new("job1/Stat", stat_payload)).await;
        assert_eq!(resp.status, status::OK);

        let resp = roundtrip(&router, Request::new(CLEANUP_METHOD, cleanup_payload("job1"))).await;
        assert_eq!(resp.status, status::OK);
        assert!(registry.get("job1").is_none());

        let mut stat_payload = Vec::new();
        primitive::write_string(&mut stat_payload, "a.txt");
        let resp = roundtrip(&router, Request::new("job1/Stat", stat_payload)).await;
        assert_eq!(resp.status, status::NOT_FOUND);
    }

    #[tokio::test]
    async fn backup_for_the_same_job_twice_stops_the_first_session() {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(Router::new());
        let registry = Arc::new(BackupSessionRegistry::new());
        register(&router, Arc::clone(&registry));

        let payload = backup_payload("job1", "snap-1", 'C', dir.path().to_str().unwrap());
        roundtrip(&router, Request::new(BACKUP_METHOD, payload)).await;
        let first = registry.get("job1").unwrap();

        let payload = backup_payload("job1", "snap-2", 'C', dir.path().to_str().unwrap());
        roundtrip(&router, Request::new(BACKUP_METHOD, payload)).await;

        assert!(first.is_cancelled());
        assert_eq!(registry.len(), 1);
    }
}
