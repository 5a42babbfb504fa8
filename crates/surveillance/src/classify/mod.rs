//! Worker-side verdicts: who did it, what the file now is, and whether that
//! is suspicious.

mod digest;
mod identity;
mod legitimacy;

pub use digest::{MalwareSignatures, Sha256Digest, sha256_file};
pub use identity::{ProcessIdentity, ProcessInspector, ProcfsInspector};
pub use legitimacy::TrustPolicy;

use crate::devices::MountTracker;
use crate::event::{EventKind, FilesystemEvent};
use crate::path_stat::{FileSnapshot, PathStatTable};
use crate::queue::EventQueue;
use crate::report::{Report, Reporter, diff_snapshots};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Why an event produced no report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dropped {
    /// Its filesystem is no longer a watched mount.
    StaleMount,
    ProcessGone,
    FileGone,
    Uninteresting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Reported { suspicious: bool },
    Dropped(Dropped),
}

pub struct Classifier {
    inspector: Arc<dyn ProcessInspector>,
    trust: TrustPolicy,
    signatures: MalwareSignatures,
    table: Arc<PathStatTable>,
    tracker: Arc<MountTracker>,
    reporter: Reporter,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("trust", &self.trust)
            .field("signatures", &self.signatures.len())
            .finish()
    }
}

impl Classifier {
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        trust: TrustPolicy,
        signatures: MalwareSignatures,
        table: Arc<PathStatTable>,
        tracker: Arc<MountTracker>,
        reporter: Reporter,
    ) -> Self {
        Self {
            inspector,
            trust,
            signatures,
            table,
            tracker,
            reporter,
        }
    }

    /// Worker loop: classify events until the queue is closed.
    pub fn run(&self, queue: &EventQueue<FilesystemEvent>) {
        while let Some(event) = queue.pop() {
            let outcome = self.handle(&event);
            trace!(seq = event.seq, ?outcome, "event classified");
        }
    }

    pub fn handle(&self, event: &FilesystemEvent) -> Outcome {
        let live = match event.fsid {
            Some(fsid) => self.tracker.is_live(fsid),
            None => self.tracker.covers(&event.path),
        };
        if !live {
            debug!(path = %event.path.display(), "event from a detached mount");
            return Outcome::Dropped(Dropped::StaleMount);
        }

        let identity = match self.inspector.inspect(event.pid) {
            Ok(identity) => identity,
            Err(err) => {
                debug!(pid = event.pid, %err, "process gone before it could be identified");
                return Outcome::Dropped(Dropped::ProcessGone);
            }
        };
        let bad_process = !self.trust.is_trusted(&identity.exe);

        if event.kind.intersects(EventKind::REMOVAL) {
            self.reporter.emit(Report::FileDeletion {
                seq: event.seq,
                path: event.path.clone(),
                pid: event.pid,
            });
            if bad_process {
                self.suspicious(event, &identity, false, true);
            }
            return Outcome::Reported {
                suspicious: bad_process,
            };
        }

        if !event.kind.intersects(EventKind::CHANGE) {
            return Outcome::Dropped(Dropped::Uninteresting);
        }

        let snapshot = match FileSnapshot::capture(&event.path) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                trace!(path = %event.path.display(), %err, "file gone before stat");
                return Outcome::Dropped(Dropped::FileGone);
            }
        };

        let digest = if snapshot.is_regular() {
            match sha256_file(&event.path) {
                Ok(digest) => Some(digest),
                Err(err) => {
                    warn!(path = %event.path.display(), %err, "cannot hash file");
                    None
                }
            }
        } else {
            None
        };
        let bad_hash = digest.is_some_and(|digest| self.signatures.contains(&digest));

        self.reporter.emit(Report::FileModification {
            seq: event.seq,
            path: event.path.clone(),
            kind: event.kind,
            pid: event.pid,
            snapshot,
            digest: digest.map(hex::encode),
        });
        if bad_hash || bad_process {
            self.suspicious(event, &identity, bad_hash, bad_process);
        }

        if event.kind.intersects(EventKind::DIFFED) {
            if let Some(old) = self.table.lookup(&event.path) {
                for change in diff_snapshots(&old, &snapshot) {
                    self.reporter.emit(Report::MetadataChange {
                        seq: event.seq,
                        path: event.path.clone(),
                        pid: event.pid,
                        change,
                    });
                }
            }
            if let Err(err) = self.table.update(&event.path, snapshot) {
                debug!(path = %event.path.display(), %err, "not tracking file");
            }
        }

        Outcome::Reported {
            suspicious: bad_hash || bad_process,
        }
    }

    fn suspicious(
        &self,
        event: &FilesystemEvent,
        identity: &ProcessIdentity,
        bad_hash: bool,
        bad_process: bool,
    ) {
        warn!(
            pid = identity.pid,
            exe = %identity.exe.display(),
            path = %event.path.display(),
            bad_hash,
            bad_process,
            "suspicious activity"
        );
        self.reporter.emit(Report::Suspicious {
            seq: event.seq,
            pid: identity.pid,
            exe: identity.exe.clone(),
            path: event.path.clone(),
            bad_hash,
            bad_process,
        });
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FixedInspector;
    use super::*;
    use crate::devices::MountEntry;
    use crate::event::{Channel, Fsid};
    use crate::report::{MetadataChange, ReportReceiver};
    use crate::sys;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const EICAR: &[u8] = br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

    struct Fixture {
        mount: TempDir,
        fsid: Fsid,
        table: Arc<PathStatTable>,
        tracker: Arc<MountTracker>,
        reports: ReportReceiver,
    }

    impl Fixture {
        fn new() -> Self {
            let mount = tempfile::tempdir().unwrap();
            let fsid = sys::fsid_of(mount.path()).unwrap();
            let tracker = Arc::new(MountTracker::new());
            tracker.insert(MountEntry {
                device_node: "/dev/sdb1".to_owned(),
                mount_dir: mount.path().to_path_buf(),
                fsid,
            });
            let (_, reports) = crate::report::channel();
            Self {
                mount,
                fsid,
                table: Arc::new(PathStatTable::new(16)),
                tracker,
                reports,
            }
        }

        fn classifier(&mut self, exe: &str) -> Classifier {
            let (reporter, reports) = crate::report::channel();
            self.reports = reports;
            Classifier::new(
                Arc::new(FixedInspector {
                    exe: PathBuf::from(exe),
                }),
                TrustPolicy::new(&config::Classifier::default().trusted_prefixes),
                MalwareSignatures::from_hex(&config::Classifier::default().malware_digests),
                self.table.clone(),
                self.tracker.clone(),
                reporter,
            )
        }

        fn event(&self, seq: u64, kind: EventKind, path: &Path) -> FilesystemEvent {
            FilesystemEvent {
                seq,
                kind,
                pid: 4242,
                path: path.to_path_buf(),
                fsid: Some(self.fsid),
                origin: Channel::Notification,
            }
        }

        fn reports(&self) -> Vec<Report> {
            self.reports.drain().into_iter().map(|r| r.report).collect()
        }
    }

    #[test]
    fn trusted_write_is_reported_once() {
        let mut f = Fixture::new();
        let classifier = f.classifier("/usr/bin/cp");
        let path = f.mount.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();

        let outcome = classifier.handle(&f.event(1, EventKind::CREATE | EventKind::CLOSE_WRITE, &path));
        assert_eq!(outcome, Outcome::Reported { suspicious: false });

        let reports = f.reports();
        assert_eq!(reports.len(), 1);
        let Report::FileModification {
            snapshot, digest, ..
        } = &reports[0]
        else {
            panic!("unexpected report {:?}", reports[0]);
        };
        assert_eq!(snapshot.size, 5);
        assert_eq!(
            digest.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }

    #[test]
    fn malware_content_is_suspicious_from_any_process() {
        let mut f = Fixture::new();
        let classifier = f.classifier("/usr/bin/cp");
        let path = f.mount.path().join("eicar.com");
        fs::write(&path, EICAR).unwrap();

        let outcome = classifier.handle(&f.event(1, EventKind::MODIFY | EventKind::CLOSE_WRITE, &path));
        assert_eq!(outcome, Outcome::Reported { suspicious: true });
        let reports = f.reports();
        assert!(reports.contains(&Report::Suspicious {
            seq: 1,
            pid: 4242,
            exe: PathBuf::from("/usr/bin/cp"),
            path: path.clone(),
            bad_hash: true,
            bad_process: false,
        }));
        assert_eq!(f.reports.counters().suspicious(), 1);
    }

    #[test]
    fn untrusted_deletion_is_suspicious() {
        let mut f = Fixture::new();
        let classifier = f.classifier("/tmp/wiper");
        let path = f.mount.path().join("gone.txt");

        classifier.handle(&f.event(3, EventKind::DELETE, &path));
        assert_eq!(
            f.reports(),
            vec![
                Report::FileDeletion {
                    seq: 3,
                    path: path.clone(),
                    pid: 4242
                },
                Report::Suspicious {
                    seq: 3,
                    pid: 4242,
                    exe: PathBuf::from("/tmp/wiper"),
                    path,
                    bad_hash: false,
                    bad_process: true,
                },
            ]
        );
    }

    #[test]
    fn chmod_is_diffed_and_refreshed() {
        let mut f = Fixture::new();
        let classifier = f.classifier("/usr/bin/chmod");
        let path = f.mount.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        f.table.update(&path, FileSnapshot::capture(&path).unwrap()).unwrap();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o777)).unwrap();
        classifier.handle(&f.event(2, EventKind::ATTRIB, &path));

        let changes: Vec<MetadataChange> = f
            .reports()
            .into_iter()
            .filter_map(|report| match report {
                Report::MetadataChange { change, .. } => Some(change),
                _ => None,
            })
            .collect();
        assert_eq!(
            changes,
            vec![MetadataChange::Permissions {
                old: 0o644,
                new: 0o777
            }]
        );
        assert_eq!(f.table.lookup(&path).unwrap().permissions(), 0o777);

        // the next diff starts from the refreshed state
        classifier.handle(&f.event(3, EventKind::ATTRIB, &path));
        assert!(
            f.reports()
                .iter()
                .all(|report| !matches!(report, Report::MetadataChange { .. }))
        );
    }

    #[test]
    fn detached_mount_events_are_dropped() {
        let mut f = Fixture::new();
        let classifier = f.classifier("/usr/bin/cp");
        let path = f.mount.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();
        f.tracker.remove_device("/dev/sdb1");

        assert_eq!(
            classifier.handle(&f.event(1, EventKind::MODIFY, &path)),
            Outcome::Dropped(Dropped::StaleMount)
        );
        assert!(f.reports().is_empty());
    }

    #[test]
    fn transient_failures_drop_the_event() {
        let mut f = Fixture::new();
        let classifier = f.classifier("/usr/bin/cp");
        let path = f.mount.path().join("ephemeral");

        assert_eq!(
            classifier.handle(&f.event(1, EventKind::CREATE, &path)),
            Outcome::Dropped(Dropped::FileGone)
        );

        fs::write(&path, b"x").unwrap();
        let mut event = f.event(2, EventKind::CREATE, &path);
        event.pid = FixedInspector::GONE;
        assert_eq!(classifier.handle(&event), Outcome::Dropped(Dropped::ProcessGone));
        assert!(f.reports().is_empty());
    }

    #[test]
    fn workers_stop_when_the_queue_closes() {
        let mut f = Fixture::new();
        let classifier = Arc::new(f.classifier("/usr/bin/cp"));
        let queue = Arc::new(EventQueue::new(4));
        let path = f.mount.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();
        queue.push(f.event(1, EventKind::CREATE, &path));

        let worker = {
            let classifier = classifier.clone();
            let queue = queue.clone();
            std::thread::spawn(move || classifier.run(&queue))
        };
        while !queue.is_empty() {
            std::thread::yield_now();
        }
        queue.close();
        worker.join().unwrap();
        assert!(f.reports.counters().total() >= 1);
    }
}
