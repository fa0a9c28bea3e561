//! Client-side read-through caches (spec §4.8 "Caches").
//!
//! Because the remote filesystem is an immutable snapshot, cache entries
//! never need a TTL or an invalidation path — they are only ever evicted
//! by capacity. `moka::sync::Cache` already gives sharded, bounded,
//! thread-safe LRU-ish eviction, so this module is a thin typed wrapper
//! rather than a hand-rolled map, matching how the rest of the core
//! reaches for a crate instead of reimplementing the same primitive.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::vssfs::types::{StatFs, VssFileInfo};

/// Default entry counts and shard count (spec §4.8: "default 1024
/// entries each, 16 shards each").
pub const DEFAULT_CACHE_ENTRIES: u64 = 1024;
pub const DEFAULT_CACHE_SHARDS: u8 = 16;

fn build_cache<K, V>(max_entries: u64, shards: u8) -> Cache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(max_entries)
        .initial_capacity(shards as usize)
        .build()
}

/// Path-keyed caches for `Stat` and `ReadDir`, plus a single-entry cache
/// for `StatFS` (spec §4.8).
pub struct ClientCaches {
    stat: Cache<String, Arc<VssFileInfo>>,
    read_dir: Cache<String, Arc<Vec<VssFileInfo>>>,
    statfs: Cache<(), Arc<StatFs>>,
}

impl ClientCaches {
    pub fn new(stat_entries: u64, read_dir_entries: u64, shards: u8) -> Self {
        Self {
            stat: build_cache(stat_entries, shards),
            read_dir: build_cache(read_dir_entries, shards),
            statfs: Cache::builder().max_capacity(1).build(),
        }
    }

    pub fn get_stat(&self, path: &str) -> Option<Arc<VssFileInfo>> {
        self.stat.get(path)
    }

    pub fn put_stat(&self, path: String, info: VssFileInfo) {
        self.stat.insert(path, Arc::new(info));
    }

    pub fn get_read_dir(&self, path: &str) -> Option<Arc<Vec<VssFileInfo>>> {
        self.read_dir.get(path)
    }

    pub fn put_read_dir(&self, path: String, entries: Vec<VssFileInfo>) {
        self.read_dir.insert(path, Arc::new(entries));
    }

    pub fn get_statfs(&self) -> Option<Arc<StatFs>> {
        self.statfs.get(&())
    }

    pub fn put_statfs(&self, statfs: StatFs) {
        self.statfs.insert((), Arc::new(statfs));
    }

    pub fn stat_entry_count(&self) -> u64 {
        self.stat.entry_count()
    }

    pub fn read_dir_entry_count(&self) -> u64 {
        self.read_dir.entry_count()
    }
}

impl Default for ClientCaches {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_ENTRIES, DEFAULT_CACHE_ENTRIES, DEFAULT_CACHE_SHARDS)
    }
}

/// Synchronous settle of pending moka housekeeping, used only by tests
/// that assert on `entry_count` immediately after an insert.
#[cfg(test)]
fn settle(cache_run_pending: impl Fn()) {
    cache_run_pending();
    std::thread::sleep(Duration::from_millis(10));
    cache_run_pending();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_cache_round_trips() {
        let caches = ClientCaches::default();
        assert!(caches.get_stat("a.txt").is_none());
        caches.put_stat(
            "a.txt".into(),
            VssFileInfo { name: "a.txt".into(), size: 1, mode: 0o644, mod_time_unix: 0, is_dir: false, blocks: 1 },
        );
        settle(|| caches.stat.run_pending_tasks());
        assert_eq!(caches.get_stat("a.txt").unwrap().name, "a.txt");
    }

    #[test]
    fn readdir_cache_round_trips_empty_listing() {
        let caches = ClientCaches::default();
        caches.put_read_dir("empty".into(), vec![]);
        settle(|| caches.read_dir.run_pending_tasks());
        assert_eq!(caches.get_read_dir("empty").unwrap().len(), 0);
    }

    #[test]
    fn statfs_cache_is_a_single_entry() {
        let caches = ClientCaches::default();
        assert!(caches.get_statfs().is_none());
        let statfs = StatFs {
            block_size: 4096,
            blocks_total: 1,
            blocks_free: 0,
            blocks_available: 0,
            files_total: 1,
            files_free: 1,
            max_name_len: 255,
        };
        caches.put_statfs(statfs);
        settle(|| caches.statfs.run_pending_tasks());
        assert_eq!(caches.get_statfs().unwrap().block_size, 4096);
    }
}
