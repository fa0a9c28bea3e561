//! Server-side aggregate binding a job id, its snapshot, and its VSSFS
//! server (spec §3 "Backup session").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::error::ArpcError;
use crate::rpc::router::Router;
use crate::vssfs::snapshot::Snapshot;
use crate::vssfs::VssFsServer;

/// One active backup job: a snapshot, the VSSFS server exposing it, and
/// a cancellation flag that tears both down together (spec §3 "Backup
/// session"; invariant: at most one live backup session per job id,
/// enforced by [`BackupSessionRegistry`]).
pub struct BackupSession {
    job_id: String,
    vssfs: Arc<VssFsServer>,
    cancelled: AtomicBool,
}

impl BackupSession {
    pub fn start(
        job_id: impl Into<String>,
        snapshot: Arc<dyn Snapshot>,
        router: &Router,
    ) -> Result<Arc<Self>, ArpcError> {
        let job_id = job_id.into();
        let vssfs = VssFsServer::new(job_id.clone(), snapshot)?;
        vssfs.register(router);
        info!(job_id, "backup session started");
        Ok(Arc::new(Self { job_id, vssfs, cancelled: AtomicBool::new(false) }))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn vssfs(&self) -> &Arc<VssFsServer> {
        &self.vssfs
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Tears the session down: deregisters its VSSFS handlers, clears its
    /// handle table, and releases its snapshot (spec §4.7 shutdown
    /// ordering — handlers first, so no new request can reach a handle
    /// table mid-teardown).
    pub fn stop(&self, router: &Router) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.vssfs.shutdown(router);
        info!(job_id = %self.job_id, "backup session stopped");
    }
}

/// Enforces "at most one live backup session per job id" (spec §3):
/// starting a second session for a job id that already has one live
/// stops the first.
#[derive(Default)]
pub struct BackupSessionRegistry {
    sessions: dashmap::DashMap<String, Arc<BackupSession>>,
}

impl BackupSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(
        &self,
        job_id: impl Into<String>,
        snapshot: Arc<dyn Snapshot>,
        router: &Router,
    ) -> Result<Arc<BackupSession>, ArpcError> {
        let job_id = job_id.into();
        if let Some((_, previous)) = self.sessions.remove(&job_id) {
            previous.stop(router);
        }
        let session = BackupSession::start(job_id.clone(), snapshot, router)?;
        self.sessions.insert(job_id, Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<BackupSession>> {
        self.sessions.get(job_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn stop(&self, job_id: &str, router: &Router) {
        if let Some((_, session)) = self.sessions.remove(job_id) {
            session.stop(router);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vssfs::snapshot::DirectorySnapshot;

    #[test]
    fn starting_a_second_session_for_the_same_job_stops_the_first() {
        let registry = BackupSessionRegistry::new();
        let router = Router::new();
        let dir = tempfile::tempdir().unwrap();
        let snap = Arc::new(DirectorySnapshot::new("snap-1", 'C', dir.path()));

        let first = registry.start("job1", snap.clone(), &router).unwrap();
        assert!(!first.is_cancelled());

        let second = registry.start("job1", snap, &router).unwrap();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stop_removes_handlers_from_the_router() {
        let registry = BackupSessionRegistry::new();
        let router = Router::new();
        let dir = tempfile::tempdir().unwrap();
        let snap = Arc::new(DirectorySnapshot::new("snap-1", 'C', dir.path()));

        registry.start("job1", snap, &router).unwrap();
        registry.stop("job1", &router);
        assert!(registry.get("job1").is_none());
    }
}
