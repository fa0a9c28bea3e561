//! Access-stats accumulators (spec §3 "Access-stats accumulators", §4.8
//! "Access stats").

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A point-in-time view of the accumulated counters, suitable for
/// computing deltas between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub unique_files: u64,
    pub unique_dirs: u64,
    pub bytes_read: u64,
}

/// Derived rates between two [`StatsSnapshot`]s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSnapshot {
    pub accesses_per_sec: f64,
    pub bytes_per_sec: f64,
}

struct Sets {
    files: HashSet<String>,
    dirs: HashSet<String>,
}

/// Tracks unique files/directories accessed and total bytes read for one
/// ARPCFS mount. Every successful `Stat`, `ReadDir`, or file `Open`
/// records the path; every `ReadAt` adds the bytes actually delivered.
pub struct AccessStats {
    sets: Mutex<Sets>,
    bytes_read: AtomicU64,
    last_snapshot: Mutex<(Instant, StatsSnapshot)>,
}

impl Default for AccessStats {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessStats {
    pub fn new() -> Self {
        let initial = StatsSnapshot { unique_files: 0, unique_dirs: 0, bytes_read: 0 };
        Self {
            sets: Mutex::new(Sets { files: HashSet::new(), dirs: HashSet::new() }),
            bytes_read: AtomicU64::new(0),
            last_snapshot: Mutex::new((Instant::now(), initial)),
        }
    }

    pub fn record_file_access(&self, path: &str) {
        self.sets.lock().expect("stats mutex poisoned").files.insert(path.to_string());
    }

    pub fn record_dir_access(&self, path: &str) {
        self.sets.lock().expect("stats mutex poisoned").dirs.insert(path.to_string());
    }

    pub fn record_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let sets = self.sets.lock().expect("stats mutex poisoned");
        StatsSnapshot {
            unique_files: sets.files.len() as u64,
            unique_dirs: sets.dirs.len() as u64,
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }

    /// Computes access and byte rates since the previous call to this
    /// method, then stores the new snapshot as the baseline for the
    /// next call (spec §3: "computed by snapshotting counters plus
    /// timestamps atomically and dividing by elapsed time").
    pub fn speed_since_last(&self) -> SpeedSnapshot {
        let now = Instant::now();
        let current = self.snapshot();
        let mut last = self.last_snapshot.lock().expect("stats mutex poisoned");
        let (last_at, last_snapshot) = *last;
        let elapsed = now.saturating_duration_since(last_at);
        *last = (now, current);

        if elapsed <= Duration::ZERO {
            return SpeedSnapshot { accesses_per_sec: 0.0, bytes_per_sec: 0.0 };
        }
        let secs = elapsed.as_secs_f64();
        let access_delta = (current.unique_files + current.unique_dirs)
            .saturating_sub(last_snapshot.unique_files + last_snapshot.unique_dirs);
        let byte_delta = current.bytes_read.saturating_sub(last_snapshot.bytes_read);

        SpeedSnapshot {
            accesses_per_sec: access_delta as f64 / secs,
            bytes_per_sec: byte_delta as f64 / secs,
        }
    }
}
