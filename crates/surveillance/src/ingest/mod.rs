//! The ingestion thread: kernel records in, normalized events out.

mod coalesce;

pub use coalesce::WriteCoalescer;

use crate::devices::MountTracker;
use crate::error::{Error, ResolutionError};
use crate::event::{Channel, EventKind, FilesystemEvent, Fsid};
use crate::fanotify::{KernelEventSource, RawRecord, decode_batch, resolve_fd, resolve_handle};
use crate::path_stat::{FileSnapshot, PathStatTable};
use crate::queue::EventQueue;
use crate::shutdown::Shutdown;
use crate::sys;
use crate::watch::WatchInstaller;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::stat::fstat;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Per-record processing: resolve, update the path-stat table, coalesce.
#[derive(Debug)]
pub struct Intake {
    tracker: Arc<MountTracker>,
    table: Arc<PathStatTable>,
    installer: WatchInstaller,
    coalescer: WriteCoalescer,
    next_seq: u64,
    own_pid: i32,
}

impl Intake {
    pub fn new(
        tracker: Arc<MountTracker>,
        table: Arc<PathStatTable>,
        installer: WatchInstaller,
        create_settle: Duration,
    ) -> Self {
        Self {
            tracker,
            table,
            installer,
            coalescer: WriteCoalescer::new(create_settle),
            next_seq: 0,
            own_pid: std::process::id() as i32,
        }
    }

    /// Turn one decoded record into the events that should be queued now.
    pub fn apply(&mut self, channel: Channel, record: RawRecord, now: Instant) -> Vec<FilesystemEvent> {
        // Owned from here on, so every early return closes it.
        #[allow(unsafe_code)]
        let fd: Option<OwnedFd> = record.fd.map(|raw| unsafe { sys::adopt_fd(raw) });

        if record.is_overflow() {
            warn!(%channel, "kernel event queue overflowed, events were lost");
            return Vec::new();
        }
        if record.pid == self.own_pid {
            return Vec::new();
        }

        let kind = EventKind::from_raw_mask(record.mask);
        let interest = match channel {
            Channel::Content => EventKind::CONTENT_INTEREST,
            Channel::Notification => EventKind::NOTIFY_INTEREST,
        };
        if !kind.intersects(interest) {
            return Vec::new();
        }

        let resolved = match channel {
            Channel::Content => Self::resolve_content(fd.as_ref()),
            Channel::Notification => self.resolve_notification(&record),
        };
        drop(fd);
        let (path, fsid) = match resolved {
            Ok(resolved) => resolved,
            Err(ResolutionError::Stale) => {
                debug!(pid = record.pid, %kind, "file vanished before it could be resolved");
                return Vec::new();
            }
            Err(err) => {
                warn!(pid = record.pid, %kind, %err, "dropping unresolvable event");
                return Vec::new();
            }
        };

        self.update_table(kind, &path);

        let event = FilesystemEvent {
            seq: self.next_seq,
            kind,
            pid: record.pid,
            path,
            fsid,
            origin: channel,
        };
        self.next_seq += 1;
        trace!(seq = event.seq, path = %event.path.display(), %kind, %channel, "ingested");

        let released = self.coalescer.offer(event, now);
        for event in &released {
            if event.kind.contains(EventKind::CREATE | EventKind::CLOSE_WRITE) {
                self.remember(&event.path);
            }
        }
        released
    }

    fn resolve_content(fd: Option<&OwnedFd>) -> Result<(PathBuf, Option<Fsid>), ResolutionError> {
        let fd = fd.ok_or(ResolutionError::NoHandle)?;
        // unlinked since the event: /proc would name it "<path> (deleted)"
        if fstat(fd).map_err(std::io::Error::from)?.st_nlink == 0 {
            return Err(ResolutionError::Stale);
        }
        let path = resolve_fd(AsFd::as_fd(fd))?;
        let fsid = match sys::fsid_of_fd(fd) {
            Ok(fsid) => Some(fsid),
            Err(err) => {
                trace!(path = %path.display(), %err, "fstatfs failed");
                None
            }
        };
        Ok((path, fsid))
    }

    fn resolve_notification(
        &self,
        record: &RawRecord,
    ) -> Result<(PathBuf, Option<Fsid>), ResolutionError> {
        if let Err(err) = &record.fids {
            warn!(pid = record.pid, %err, "malformed info record");
            return Err(ResolutionError::NoHandle);
        }
        let fid = record.primary_fid().ok_or(ResolutionError::NoHandle)?;
        let mount = self
            .tracker
            .mount_for_fsid(fid.fsid)
            .ok_or(ResolutionError::NoMount(fid.fsid))?;
        let path = resolve_handle(fid, &mount)?;
        Ok((path, Some(fid.fsid)))
    }

    fn update_table(&self, kind: EventKind, path: &Path) {
        if kind.intersects(EventKind::ARRIVAL) {
            if kind.contains(EventKind::ON_DIR) {
                self.installer.directory_created(path);
            } else {
                self.remember(path);
            }
        }
        if kind.intersects(EventKind::REMOVAL) {
            self.table.remove(path);
        }
    }

    fn remember(&self, path: &Path) {
        let snapshot = match FileSnapshot::capture(path) {
            Ok(snapshot) if snapshot.is_regular() => snapshot,
            Ok(_) => return,
            Err(err) => {
                trace!(path = %path.display(), %err, "stat failed");
                return;
            }
        };
        if let Err(err) = self.table.update(path, snapshot) {
            debug!(path = %path.display(), %err, "not tracking file");
        }
    }

    /// Creates that never saw a close-write and are now due.
    pub fn expire(&mut self, now: Instant) -> Vec<FilesystemEvent> {
        self.coalescer.expire(now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.coalescer.next_deadline()
    }
}

/// Owns both kernel feeds and drives [`Intake`] from a single `poll(2)` loop.
pub struct Ingestor {
    notification: Arc<dyn KernelEventSource>,
    content: Arc<dyn KernelEventSource>,
    intake: Intake,
    queue: Arc<EventQueue<FilesystemEvent>>,
    buf: Vec<u8>,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("intake", &self.intake)
            .field("buffer", &self.buf.len())
            .finish()
    }
}

impl Ingestor {
    pub fn new(
        notification: Arc<dyn KernelEventSource>,
        content: Arc<dyn KernelEventSource>,
        intake: Intake,
        queue: Arc<EventQueue<FilesystemEvent>>,
        read_buffer: usize,
    ) -> Self {
        Self {
            notification,
            content,
            intake,
            queue,
            buf: vec![0; read_buffer.max(crate::fanotify::METADATA_LEN)],
        }
    }

    /// Run until shutdown. A hard `poll`/`read` failure ends the loop with an
    /// error; nothing else does.
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<(), Error> {
        debug!("ingestion started");
        while !shutdown.is_raised() {
            let timeout = match self.intake.next_deadline() {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    PollTimeout::try_from(left).unwrap_or(PollTimeout::MAX)
                }
                None => PollTimeout::NONE,
            };

            let (notification_ready, content_ready) = {
                let mut fds = [
                    PollFd::new(self.notification.as_fd(), PollFlags::POLLIN),
                    PollFd::new(self.content.as_fd(), PollFlags::POLLIN),
                    PollFd::new(shutdown.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, timeout) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(err) => {
                        warn!(%err, "poll failed, ingestion stops");
                        return Err(err.into());
                    }
                }
                (readable(&fds[0]), readable(&fds[1]))
            };
            if shutdown.is_raised() {
                break;
            }

            // names before contents, so creates precede their writes
            if notification_ready {
                let source = Arc::clone(&self.notification);
                self.drain(source.as_ref())?;
            }
            if content_ready {
                let source = Arc::clone(&self.content);
                self.drain(source.as_ref())?;
            }

            for event in self.intake.expire(Instant::now()) {
                self.queue.push(event);
            }
        }
        debug!("ingestion stopped");
        Ok(())
    }

    fn drain(&mut self, source: &dyn KernelEventSource) -> Result<(), Error> {
        let channel = source.channel();
        loop {
            let len = match source.read_batch(&mut self.buf) {
                Ok(0) | Err(Errno::EAGAIN) => return Ok(()),
                Ok(len) => len,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!(%channel, %err, "read failed, ingestion stops");
                    return Err(err.into());
                }
            };

            let now = Instant::now();
            for record in decode_batch(&self.buf[..len]) {
                match record {
                    Ok(record) => {
                        for event in self.intake.apply(channel, record, now) {
                            self.queue.push(event);
                        }
                    }
                    Err(malformed) => {
                        warn!(%channel, err = %malformed, "skipping malformed batch tail");
                        #[allow(unsafe_code)]
                        // SAFETY: the kernel opened it for this record and nothing else owns it.
                        drop(malformed.fd.map(|raw| unsafe { sys::adopt_fd(raw) }));
                    }
                }
            }
        }
    }
}

fn readable(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|events| events.intersects(PollFlags::POLLIN | PollFlags::POLLERR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanotify::testing::{event, fid_info};
    use crate::watch::testing::RecordingMarker;
    use config::WatchMode;
    use nix::fcntl::OFlag;
    use nix::sys::fanotify::MaskFlags;
    use nix::unistd::{pipe2, write};
    use pretty_assertions::assert_eq;
    use std::fs::{self, File};
    use std::os::fd::{AsFd, BorrowedFd, IntoRawFd};

    const MODIFY: u64 = MaskFlags::FAN_MODIFY.bits();
    const CLOSE_WRITE: u64 = MaskFlags::FAN_CLOSE_WRITE.bits();
    const CREATE: u64 = MaskFlags::FAN_CREATE.bits();
    const OPEN: u64 = MaskFlags::FAN_OPEN.bits();
    const OTHER_PID: i32 = 1;

    fn intake(table: Arc<PathStatTable>, mode: WatchMode) -> (Intake, Arc<RecordingMarker>) {
        let marker = Arc::new(RecordingMarker::default());
        let installer = WatchInstaller::new(marker.clone(), table.clone(), mode);
        let intake = Intake::new(
            Arc::new(MountTracker::new()),
            table,
            installer,
            Duration::from_secs(2),
        );
        (intake, marker)
    }

    fn record(mask: u64, fd: Option<i32>, pid: i32) -> RawRecord {
        RawRecord {
            mask,
            fd,
            pid,
            fids: Ok(Vec::new()),
        }
    }

    fn open_fd(path: &Path) -> i32 {
        File::open(path).unwrap().into_raw_fd()
    }

    #[test]
    fn content_write_becomes_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();
        let table = Arc::new(PathStatTable::new(8));
        let (mut intake, _) = intake(table, WatchMode::MountWide);
        let now = Instant::now();

        let first = intake.apply(Channel::Content, record(MODIFY, Some(open_fd(&file)), OTHER_PID), now);
        assert!(first.is_empty());
        let out = intake.apply(
            Channel::Content,
            record(CLOSE_WRITE, Some(open_fd(&file)), OTHER_PID),
            now,
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, file.canonicalize().unwrap());
        assert_eq!(out[0].kind, EventKind::MODIFY | EventKind::CLOSE_WRITE);
        assert_eq!(out[0].fsid, Some(sys::fsid_of(dir.path()).unwrap()));
        assert_eq!(out[0].seq, 1);
    }

    #[test]
    fn writes_to_unlinked_files_leave_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"old").unwrap();
        let (mut intake, _) = intake(Arc::new(PathStatTable::new(8)), WatchMode::MountWide);
        let now = Instant::now();

        // both records are only read after the unlink
        let (modified, closed) = (open_fd(&file), open_fd(&file));
        fs::remove_file(&file).unwrap();
        assert!(intake.apply(Channel::Content, record(MODIFY, Some(modified), OTHER_PID), now).is_empty());
        assert!(intake.apply(Channel::Content, record(CLOSE_WRITE, Some(closed), OTHER_PID), now).is_empty());

        // an untouched file that reuses the name is not reported as modified
        fs::write(&file, b"new").unwrap();
        let out = intake.apply(
            Channel::Content,
            record(CLOSE_WRITE, Some(open_fd(&file)), OTHER_PID),
            now,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn descriptors_are_closed_even_when_skipped() {
        let (mut intake, _) = intake(Arc::new(PathStatTable::new(8)), WatchMode::MountWide);

        // uninteresting mask and own pid are both dropped early
        let own = std::process::id() as i32;
        for (mask, pid) in [(OPEN, OTHER_PID), (MODIFY, own)] {
            let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).unwrap();
            let raw = write_end.into_raw_fd();
            assert!(intake.apply(Channel::Content, record(mask, Some(raw), pid), Instant::now()).is_empty());
            // end of file only once the last write end is gone
            let mut buf = [0u8; 1];
            assert_eq!(nix::unistd::read(&read_end, &mut buf), Ok(0));
        }
    }

    #[test]
    fn descriptor_of_a_cut_off_record_is_closed() {
        let notification = Arc::new(PipeSource::new(Channel::Notification));
        let content = Arc::new(PipeSource::new(Channel::Content));
        let (intake, _) = intake(Arc::new(PathStatTable::new(8)), WatchMode::MountWide);
        let mut ingestor = Ingestor::new(
            notification,
            content.clone(),
            intake,
            Arc::new(EventQueue::new(4)),
            4096,
        );

        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).unwrap();
        let mut bytes = event(MODIFY, write_end.into_raw_fd(), OTHER_PID, &[]);
        // the header promises more bytes than were read
        bytes[0..4].copy_from_slice(&64u32.to_ne_bytes());
        content.feed(&bytes);

        ingestor.drain(content.as_ref()).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(nix::unistd::read(&read_end, &mut buf), Ok(0));
    }

    #[test]
    fn notification_for_unknown_filesystem_is_dropped() {
        let (mut intake, _) = intake(Arc::new(PathStatTable::new(8)), WatchMode::MountWide);
        let bytes = event(
            CREATE,
            libc::FAN_NOFD,
            OTHER_PID,
            &[fid_info(libc::FAN_EVENT_INFO_TYPE_DFID_NAME, [7, 7], &[1, 2, 3, 4], Some("a.txt"))],
        );
        let record = decode_batch(&bytes).remove(0).unwrap();
        assert!(intake.apply(Channel::Notification, record, Instant::now()).is_empty());
    }

    #[test]
    fn overflow_is_not_an_event() {
        let (mut intake, _) = intake(Arc::new(PathStatTable::new(8)), WatchMode::MountWide);
        let overflow = record(libc::FAN_Q_OVERFLOW, None, OTHER_PID);
        assert!(intake.apply(Channel::Notification, overflow, Instant::now()).is_empty());
    }

    #[test]
    fn arrivals_and_removals_maintain_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();
        let sub = dir.path().join("docs");
        fs::create_dir(&sub).unwrap();
        let table = Arc::new(PathStatTable::new(8));
        let (intake, marker) = intake(table.clone(), WatchMode::Recursive);

        intake.update_table(EventKind::MOVED_TO, &file);
        assert_eq!(table.lookup(&file).unwrap().size, 5);

        intake.update_table(EventKind::CREATE | EventKind::ON_DIR, &sub);
        assert_eq!(marker.marks.lock().unwrap().len(), 2);
        // directories are marked, not tracked
        assert_eq!(table.len(), 1);

        intake.update_table(EventKind::DELETE, &file);
        assert!(table.is_empty());
    }

    /// A [`KernelEventSource`] fed through a pipe.
    struct PipeSource {
        channel: Channel,
        read_end: OwnedFd,
        write_end: OwnedFd,
    }

    impl PipeSource {
        fn new(channel: Channel) -> Self {
            let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).unwrap();
            Self {
                channel,
                read_end,
                write_end,
            }
        }

        fn feed(&self, bytes: &[u8]) {
            assert_eq!(write(&self.write_end, bytes).unwrap(), bytes.len());
        }
    }

    impl KernelEventSource for PipeSource {
        fn channel(&self) -> Channel {
            self.channel
        }

        fn as_fd(&self) -> BorrowedFd<'_> {
            self.read_end.as_fd()
        }

        fn read_batch(&self, buf: &mut [u8]) -> nix::Result<usize> {
            nix::unistd::read(&self.read_end, buf)
        }
    }

    #[test]
    fn loop_queues_events_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();

        let notification = Arc::new(PipeSource::new(Channel::Notification));
        let content = Arc::new(PipeSource::new(Channel::Content));
        let queue = Arc::new(EventQueue::new(16));
        let (intake, _) = intake(Arc::new(PathStatTable::new(8)), WatchMode::MountWide);
        let mut ingestor = Ingestor::new(
            notification.clone(),
            content.clone(),
            intake,
            queue.clone(),
            4096,
        );
        let shutdown = Shutdown::new().unwrap();

        let mut batch = event(MODIFY, open_fd(&file), OTHER_PID, &[]);
        batch.extend(event(CLOSE_WRITE, open_fd(&file), OTHER_PID, &[]));
        content.feed(&batch);

        let handle = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || ingestor.run(&shutdown))
        };
        let queued = queue.pop().unwrap();
        assert_eq!(queued.kind, EventKind::MODIFY | EventKind::CLOSE_WRITE);
        assert_eq!(queued.origin, Channel::Content);

        shutdown.raise();
        assert!(handle.join().unwrap().is_ok());
        assert!(queue.is_empty());
    }
}
