//! Snapshot external-collaborator contract (spec §3 "Snapshot").
//!
//! A [`Snapshot`] is a read-only point-in-time view rooted at a
//! filesystem path, with a stable id and drive-letter origin. Taking and
//! releasing the actual VSS snapshot (or whatever mechanism a given
//! platform uses) is out of scope for this crate (spec §1 Non-goals);
//! the core only consumes the three things listed in the data model:
//! root path, drive letter, and a close operation. Its lifecycle is
//! owned by a [`crate::backup_session::BackupSession`], not by the
//! VSSFS server.

use std::path::{Path, PathBuf};

/// A read-only point-in-time view of part of a filesystem.
pub trait Snapshot: Send + Sync {
    fn id(&self) -> &str;
    fn drive_letter(&self) -> char;
    fn root(&self) -> &Path;

    /// Releases the underlying snapshot. Idempotent.
    fn close(&self);
}

/// A [`Snapshot`] rooted at an already-existing directory, for tests and
/// for any deployment that backs up a plain directory tree rather than a
/// true volume shadow copy.
pub struct DirectorySnapshot {
    id: String,
    drive_letter: char,
    root: PathBuf,
}

impl DirectorySnapshot {
    pub fn new(id: impl Into<String>, drive_letter: char, root: impl Into<PathBuf>) -> Self {
        Self { id: id.into(), drive_letter, root: root.into() }
    }
}

impl Snapshot for DirectorySnapshot {
    fn id(&self) -> &str {
        &self.id
    }

    fn drive_letter(&self) -> char {
        self.drive_letter
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_snapshot_exposes_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let snap = DirectorySnapshot::new("snap-1", 'C', dir.path());
        assert_eq!(snap.id(), "snap-1");
        assert_eq!(snap.drive_letter(), 'C');
        assert_eq!(snap.root(), dir.path());
        snap.close();
    }
}
