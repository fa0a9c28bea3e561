//! Kernel-facing FUSE bridge (spec §4.9): translates `fuser` callbacks
//! into [`ArpcfsClient`] RPCs and mounts the result read-only.
//!
//! `fuser`'s `Filesystem` trait is synchronous (the kernel driver thread
//! calls each method and blocks on the `reply` it's handed), while
//! [`ArpcfsClient`] is async. Every handler below bridges the two with a
//! stored [`tokio::runtime::Handle::block_on`], the same pattern the
//! rest of this crate uses at its sync/async seams.
//!
//! Targets the published `fuser 0.14` API (plain `u64` inode/file-handle
//! numbers, `i32` flags, `&Request<'_>`) rather than any newer or forked
//! API shape — there is no guarantee the pinned crate version matches
//! every example lying around, so this module is written against the
//! well-known public surface rather than copied from one.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use tracing::{debug, warn};

use crate::arpcfs::{ArpcfsClient, ArpcfsFileHandle};
use crate::config::MountConfigDef;
use crate::error::ArpcError;
use crate::mux::Mux;
use crate::vssfs::types::{open_flags, VssFileInfo, Whence};

const ROOT_INO: u64 = 1;

/// Maps inode numbers the kernel knows about onto remote relative paths,
/// allocating a fresh inode the first time a path is looked up and
/// reusing it afterwards so repeated lookups don't inflate the table
/// (spec §4.9 "getattr, lookup ... readdir").
struct InodeTable {
    next_ino: AtomicU64,
    path_of: DashMap<u64, String>,
    ino_of: DashMap<String, u64>,
    parent_of: DashMap<u64, u64>,
}

impl InodeTable {
    fn new() -> Self {
        let path_of = DashMap::new();
        let ino_of = DashMap::new();
        path_of.insert(ROOT_INO, String::new());
        ino_of.insert(String::new(), ROOT_INO);
        Self { next_ino: AtomicU64::new(ROOT_INO + 1), path_of, ino_of, parent_of: DashMap::new() }
    }

    fn path(&self, ino: u64) -> Option<String> {
        self.path_of.get(&ino).map(|e| e.clone())
    }

    fn parent(&self, ino: u64) -> Option<u64> {
        self.parent_of.get(&ino).map(|e| *e)
    }

    /// Returns the inode for `path`, allocating one under `parent_ino` if
    /// this is the first time it has been seen.
    fn ino_for(&self, parent_ino: u64, path: String) -> u64 {
        if let Some(existing) = self.ino_of.get(&path) {
            return *existing;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        self.ino_of.insert(path.clone(), ino);
        self.path_of.insert(ino, path);
        self.parent_of.insert(ino, parent_ino);
        ino
    }
}

fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn file_type_of(info: &VssFileInfo) -> FileType {
    if info.is_dir {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

fn attr_of(ino: u64, info: &VssFileInfo) -> FileAttr {
    let mtime = UNIX_EPOCH + Duration::from_secs(info.mod_time_unix.max(0) as u64);
    FileAttr {
        ino,
        size: info.size,
        blocks: info.blocks,
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: file_type_of(info),
        perm: (info.mode & 0o7777) as u16,
        nlink: if info.is_dir { 2 } else { 1 },
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn map_err(err: &ArpcError) -> i32 {
    use crate::error::ErrorKind::*;
    match err.kind() {
        NotFound => libc::ENOENT,
        PermissionDenied => libc::EACCES,
        InvalidArgument => libc::EINVAL,
        PastEndOfFile => libc::ENXIO,
        Protocol | Io => libc::EIO,
        Timeout | ConnectionLost => libc::EIO,
    }
}

/// One open kernel file handle: the remote handle it forwards
/// `read`/`lseek`/`release` calls onto.
struct OpenFuseHandle<M: Mux + 'static> {
    remote: ArpcfsFileHandle<M>,
}

/// `fuser::Filesystem` implementation bridging kernel FUSE calls onto one
/// [`ArpcfsClient`] (spec §4.9).
pub struct FuseBridge<M: Mux + 'static> {
    client: std::sync::Arc<ArpcfsClient<M>>,
    rt: tokio::runtime::Handle,
    inodes: InodeTable,
    handles: DashMap<u64, OpenFuseHandle<M>>,
    next_fh: AtomicU64,
    attr_timeout: Duration,
    entry_timeout: Duration,
}

impl<M: Mux + 'static> FuseBridge<M> {
    pub fn new(client: std::sync::Arc<ArpcfsClient<M>>, rt: tokio::runtime::Handle, mount: &MountConfigDef) -> Self {
        Self {
            client,
            rt,
            inodes: InodeTable::new(),
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
            attr_timeout: Duration::from_secs(mount.attr_timeout_secs),
            entry_timeout: Duration::from_secs(mount.entry_timeout_secs),
        }
    }

    fn stat_ino(&self, ino: u64) -> Result<(String, VssFileInfo), ArpcError> {
        let path = self.inodes.path(ino).ok_or(ArpcError::Protocol("unknown inode".into()))?;
        let client = std::sync::Arc::clone(&self.client);
        let info = self.rt.block_on(async { client.stat(&path).await })?;
        Ok((path, info))
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }
}

impl<M: Mux + 'static> Filesystem for FuseBridge<M> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.inodes.path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let child_path = join_relative(&parent_path, name);
        let client = std::sync::Arc::clone(&self.client);
        let lookup = self.rt.block_on(async move { client.stat(&child_path).await });
        match lookup {
            Ok(info) => {
                let ino = self.inodes.ino_for(parent, child_path);
                reply.entry(&self.entry_timeout, &attr_of(ino, &info), 0);
            }
            Err(err) => reply.error(map_err(&err)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.stat_ino(ino) {
            Ok((_, info)) => reply.attr(&self.attr_timeout, &attr_of(ino, &info)),
            Err(err) => reply.error(map_err(&err)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if self.inodes.path(ino).is_none() {
            reply.error(libc::ENOENT);
            return;
        }
        reply.opened(self.alloc_fh(), 0);
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let client = std::sync::Arc::clone(&self.client);
        let path_for_call = path.clone();
        let listing = self.rt.block_on(async move { client.read_dir(&path_for_call).await });
        let entries = match listing {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(map_err(&err));
                return;
            }
        };

        let parent_ino = self.inodes.parent(ino).unwrap_or(ROOT_INO);
        let mut synthetic = vec![(ino, FileType::Directory, ".".to_string()), (parent_ino, FileType::Directory, "..".to_string())];
        for entry in entries.iter() {
            let child_path = join_relative(&path, &entry.name);
            let child_ino = self.inodes.ino_for(ino, child_path);
            synthetic.push((child_ino, file_type_of(entry), entry.name.clone()));
        }

        for (i, (child_ino, kind, name)) in synthetic.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let client = std::sync::Arc::clone(&self.client);
        let remote_flags = if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 { open_flags::WRONLY } else { open_flags::RDONLY };
        let opened = self.rt.block_on(async move { client.open_file(&path, remote_flags).await });
        match opened {
            Ok(remote) => {
                let fh = self.alloc_fh();
                self.handles.insert(fh, OpenFuseHandle { remote });
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(map_err(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        let result = self.rt.block_on(async { handle.remote.read_at(offset as u64, &mut buf).await });
        match result {
            Ok((n, _eof)) => reply.data(&buf[..n]),
            Err(err) => reply.error(map_err(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some((_, handle)) = self.handles.remove(&fh) {
            let _ = self.rt.block_on(async move { handle.remote.close().await });
        }
        reply.ok();
    }

    fn lseek(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, offset: i64, whence: i32, reply: ReplyLseek) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let Ok(whence) = Whence::from_u8(whence as u8) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.rt.block_on(async { handle.remote.lseek(offset, whence).await }) {
            Ok(new_offset) => reply.offset(new_offset),
            Err(err) => reply.error(map_err(&err)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        if mask & libc::W_OK != 0 {
            reply.error(libc::EROFS);
            return;
        }
        if self.inodes.path(ino).is_none() {
            reply.error(libc::ENOENT);
            return;
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let client = std::sync::Arc::clone(&self.client);
        match self.rt.block_on(async move { client.statfs().await }) {
            Ok(statfs) => reply.statfs(
                statfs.blocks_total,
                statfs.blocks_free,
                statfs.blocks_available,
                statfs.files_total,
                statfs.files_free,
                statfs.block_size,
                statfs.max_name_len,
                0,
            ),
            Err(err) => reply.error(map_err(&err)),
        }
    }

    /// The remote never reports extended attributes today (spec §4.9's
    /// attribute vocabulary is aspirational — `VssFileInfo` carries no
    /// xattr payload), so every lookup answers "no such attribute".
    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, _name: &OsStr, _size: u32, reply: ReplyXattr) {
        if self.inodes.path(ino).is_none() {
            reply.error(libc::ENOENT);
            return;
        }
        reply.error(libc::ENODATA);
    }
}

/// Mount options derived from [`MountConfigDef`] (spec §4.9).
fn mount_options(mount: &MountConfigDef) -> Vec<MountOption> {
    let mut opts = vec![MountOption::FSName("arpcfs".to_string())];
    if mount.read_only {
        opts.push(MountOption::RO);
    }
    if mount.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if mount.noatime {
        opts.push(MountOption::NoAtime);
    }
    opts
}

/// Best-effort lazy unmount of any stale mount left behind at
/// `mountpoint` by a previous crashed process, before attempting a fresh
/// mount there. A crashed bridge has no chance to unmount cleanly, which
/// leaves the kernel believing the mountpoint still belongs to a dead
/// process; `fusermount -u -q` clears that without failing loudly if
/// nothing was actually mounted.
fn lazy_unmount_stale(mountpoint: &std::path::Path) {
    let status = std::process::Command::new("fusermount")
        .arg("-u")
        .arg("-q")
        .arg(mountpoint)
        .status();
    match status {
        Ok(status) if !status.success() => {
            debug!(?mountpoint, "fusermount -u -q found nothing to unmount");
        }
        Ok(_) => {}
        Err(err) => warn!(?mountpoint, %err, "failed to invoke fusermount for stale-mount cleanup"),
    }
}

/// Mounts `bridge` at `mountpoint`, first clearing any stale mount left
/// behind by a crashed prior instance (spec §4.9). Runs the kernel event
/// loop on the calling thread; returns once the filesystem is unmounted.
pub fn mount<M: Mux + 'static>(
    bridge: FuseBridge<M>,
    mountpoint: impl Into<PathBuf>,
    mount_cfg: &MountConfigDef,
) -> Result<(), ArpcError> {
    let mountpoint = mountpoint.into();
    lazy_unmount_stale(&mountpoint);
    fuser::mount2(bridge, &mountpoint, &mount_options(mount_cfg)).map_err(ArpcError::Io)
}

/// Spawns the mount on a background OS thread, returning a session guard
/// that unmounts when dropped. Used by embedders that need to keep
/// driving an async runtime on the calling thread while the mount runs.
pub fn spawn_mount<M: Mux + 'static>(
    bridge: FuseBridge<M>,
    mountpoint: impl Into<PathBuf>,
    mount_cfg: &MountConfigDef,
) -> Result<fuser::BackgroundSession, ArpcError> {
    let mountpoint = mountpoint.into();
    lazy_unmount_stale(&mountpoint);
    fuser::spawn_mount2(bridge, &mountpoint, &mount_options(mount_cfg)).map_err(ArpcError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_table_reuses_ids_for_repeated_paths() {
        let table = InodeTable::new();
        let a = table.ino_for(ROOT_INO, "dir/a.txt".to_string());
        let b = table.ino_for(ROOT_INO, "dir/a.txt".to_string());
        assert_eq!(a, b);
        assert_eq!(table.path(a).as_deref(), Some("dir/a.txt"));
    }

    #[test]
    fn inode_table_tracks_parent_for_dotdot_entries() {
        let table = InodeTable::new();
        let dir_ino = table.ino_for(ROOT_INO, "dir".to_string());
        let file_ino = table.ino_for(dir_ino, "dir/a.txt".to_string());
        assert_eq!(table.parent(file_ino), Some(dir_ino));
        assert_eq!(table.parent(dir_ino), Some(ROOT_INO));
    }

    #[test]
    fn join_relative_handles_root_and_nested_paths() {
        assert_eq!(join_relative("", "a.txt"), "a.txt");
        assert_eq!(join_relative("dir", "a.txt"), "dir/a.txt");
    }

    #[test]
    fn mount_options_reflect_read_only_and_allow_other() {
        let mount = MountConfigDef { read_only: true, allow_other: true, ..MountConfigDef::default() };
        let opts = mount_options(&mount);
        assert!(opts.iter().any(|o| matches!(o, MountOption::RO)));
        assert!(opts.iter().any(|o| matches!(o, MountOption::AllowOther)));
    }

    #[test]
    fn map_err_maps_past_end_of_file_to_enxio() {
        use crate::error::{ErrorKind, WireError};
        let err = ArpcError::Remote(WireError::new(ErrorKind::PastEndOfFile, "past eof"));
        assert_eq!(map_err(&err), libc::ENXIO);
    }
}
