use crate::event::EventKind;
use crate::path_stat::FileSnapshot;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single differing metadata field between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataChange {
    /// `rwx` bits for user, group and other.
    Permissions { old: u32, new: u32 },
    Size { old: u64, new: u64 },
    Mtime { old: (i64, i64), new: (i64, i64) },
    /// `(uid, gid)` pairs.
    Owner { old: (u32, u32), new: (u32, u32) },
}

impl fmt::Display for MetadataChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataChange::Permissions { old, new } => write!(f, "perms {old:03o}->{new:03o}"),
            MetadataChange::Size { old, new } => write!(f, "size {old}->{new}"),
            MetadataChange::Mtime { old, new } => write!(
                f,
                "mtime {}.{:09}->{}.{:09}",
                old.0, old.1, new.0, new.1
            ),
            MetadataChange::Owner { old, new } => {
                write!(f, "owner {}:{}->{}:{}", old.0, old.1, new.0, new.1)
            }
        }
    }
}

/// Every field that differs between `old` and `new`, in a fixed order:
/// permissions, size, mtime, owner.
pub fn diff_snapshots(old: &FileSnapshot, new: &FileSnapshot) -> Vec<MetadataChange> {
    let mut changes = Vec::new();
    if old.mode & 0o777 != new.mode & 0o777 {
        changes.push(MetadataChange::Permissions {
            old: old.mode & 0o777,
            new: new.mode & 0o777,
        });
    }
    if old.size != new.size {
        changes.push(MetadataChange::Size {
            old: old.size,
            new: new.size,
        });
    }
    if (old.mtime, old.mtime_nsec) != (new.mtime, new.mtime_nsec) {
        changes.push(MetadataChange::Mtime {
            old: (old.mtime, old.mtime_nsec),
            new: (new.mtime, new.mtime_nsec),
        });
    }
    if (old.uid, old.gid) != (new.uid, new.gid) {
        changes.push(MetadataChange::Owner {
            old: (old.uid, old.gid),
            new: (new.uid, new.gid),
        });
    }
    changes
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    FileModification {
        seq: u64,
        path: PathBuf,
        kind: EventKind,
        pid: i32,
        snapshot: FileSnapshot,
        /// Hex SHA-256 of the content, for regular files that could be read.
        digest: Option<String>,
    },
    FileDeletion {
        seq: u64,
        path: PathBuf,
        pid: i32,
    },
    Suspicious {
        seq: u64,
        pid: i32,
        exe: PathBuf,
        path: PathBuf,
        bad_hash: bool,
        bad_process: bool,
    },
    MetadataChange {
        seq: u64,
        path: PathBuf,
        pid: i32,
        change: MetadataChange,
    },
    MountsChanged {
        mounts: Vec<PathBuf>,
    },
}

impl Report {
    /// Ingestion sequence number of the event behind this report.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Report::FileModification { seq, .. }
            | Report::FileDeletion { seq, .. }
            | Report::Suspicious { seq, .. }
            | Report::MetadataChange { seq, .. } => Some(*seq),
            Report::MountsChanged { .. } => None,
        }
    }

    pub fn is_suspicious(&self) -> bool {
        matches!(self, Report::Suspicious { .. })
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::FileModification {
                path,
                kind,
                pid,
                snapshot,
                digest,
                ..
            } => {
                write!(
                    f,
                    "File change: {} (pid={pid}) cause={kind}\n    inode={} size={} bytes uid={} gid={} perms={:04o} mtime={}",
                    path.display(),
                    snapshot.inode,
                    snapshot.size,
                    snapshot.uid,
                    snapshot.gid,
                    snapshot.permissions(),
                    snapshot.mtime,
                )?;
                if let Some(digest) = digest {
                    write!(f, " sha256={digest}")?;
                }
                Ok(())
            }
            Report::FileDeletion { path, pid, .. } => {
                write!(f, "File deleted: {} (pid={pid})", path.display())
            }
            Report::Suspicious {
                pid,
                exe,
                path,
                bad_hash,
                bad_process,
                ..
            } => {
                write!(
                    f,
                    "Suspicious process: pid={pid} exe={} file={}",
                    exe.display(),
                    path.display()
                )?;
                match (bad_hash, bad_process) {
                    (true, true) => f.write_str(" reason=malware,untrusted"),
                    (true, false) => f.write_str(" reason=malware"),
                    (false, true) => f.write_str(" reason=untrusted"),
                    (false, false) => Ok(()),
                }
            }
            Report::MetadataChange {
                path, pid, change, ..
            } => write!(f, "[METADATA] {} {change} pid={pid}", path.display()),
            Report::MountsChanged { mounts } => {
                let n = mounts.len();
                write!(f, "USB mounts (live): {n} mount{}", if n == 1 { "" } else { "s" })?;
                for mount in mounts {
                    write!(f, "\n  * {}", mount.display())?;
                }
                Ok(())
            }
        }
    }
}

/// A report stamped with the time it was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub at: SystemTime,
    pub report: Report,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let since = self.at.duration_since(UNIX_EPOCH).unwrap_or_default();
        write!(
            f,
            "[{}.{:03}] {}",
            since.as_secs(),
            since.subsec_millis(),
            self.report
        )
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    total: AtomicU64,
    suspicious: AtomicU64,
}

impl Counters {
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn suspicious(&self) -> u64 {
        self.suspicious.load(Ordering::Relaxed)
    }

    /// Share of suspicious reports among file-event reports, `0.0` before
    /// the first.
    pub fn suspicious_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.suspicious() as f64 * 100.0 / total as f64
    }
}

/// Sending half of the report stream. Cheap to clone; one per worker.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: flume::Sender<Record>,
    counters: Arc<Counters>,
}

impl Reporter {
    /// Send `report`. Only reports about file events are counted.
    pub fn emit(&self, report: Report) {
        if report.seq().is_some() {
            self.counters.total.fetch_add(1, Ordering::Relaxed);
        }
        if report.is_suspicious() {
            self.counters.suspicious.fetch_add(1, Ordering::Relaxed);
        }
        let record = Record {
            at: SystemTime::now(),
            report,
        };
        // The receiver goes away only at shutdown.
        let _ = self.tx.send(record);
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }
}

#[derive(Debug)]
pub struct ReportReceiver {
    rx: flume::Receiver<Record>,
    counters: Arc<Counters>,
}

impl ReportReceiver {
    /// Everything produced since the last drain. Never blocks.
    pub fn drain(&self) -> Vec<Record> {
        self.rx.try_iter().collect()
    }

    /// Wait for the next record; `None` once every [`Reporter`] is gone.
    pub async fn recv_async(&self) -> Option<Record> {
        self.rx.recv_async().await.ok()
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }
}

pub fn channel() -> (Reporter, ReportReceiver) {
    let (tx, rx) = flume::unbounded();
    let counters = Arc::new(Counters::default());
    (
        Reporter {
            tx,
            counters: Arc::clone(&counters),
        },
        ReportReceiver { rx, counters },
    )
}
