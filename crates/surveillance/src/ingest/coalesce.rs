//! Folding of the raw kernel stream into one event per logical write.
//!
//! A single `write` of a new file shows up as a notification-channel create,
//! any number of content-channel modifies, and one content-channel
//! close-write. Only one of them is worth a report, and it is worth it once
//! the content is final.

use crate::event::{Channel, EventKind, FilesystemEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug)]
struct PendingCreate {
    event: FilesystemEvent,
    since: Instant,
}

#[derive(Debug)]
pub struct WriteCoalescer {
    /// Paths modified since their last close-write.
    dirty: FxHashSet<PathBuf>,
    /// Regular-file creates waiting for their first close-write.
    pending: FxHashMap<PathBuf, PendingCreate>,
    settle: Duration,
}

impl WriteCoalescer {
    pub fn new(settle: Duration) -> Self {
        Self {
            dirty: FxHashSet::default(),
            pending: FxHashMap::default(),
            settle,
        }
    }

    /// Feed one event; returns what should be queued, in order.
    pub fn offer(&mut self, event: FilesystemEvent, now: Instant) -> Vec<FilesystemEvent> {
        match event.origin {
            Channel::Content => self.offer_content(event),
            Channel::Notification => self.offer_notification(event, now),
        }
    }

    fn offer_content(&mut self, mut event: FilesystemEvent) -> Vec<FilesystemEvent> {
        if !event.kind.contains(EventKind::CLOSE_WRITE) {
            if event.kind.contains(EventKind::MODIFY) {
                self.dirty.insert(event.path);
            }
            return Vec::new();
        }

        // the kernel merges queued events, so MODIFY may ride along here
        let modified = self.dirty.remove(&event.path) || event.kind.contains(EventKind::MODIFY);
        if let Some(pending) = self.pending.remove(&event.path) {
            let mut create = pending.event;
            create.kind |= EventKind::CLOSE_WRITE;
            create.pid = event.pid;
            return vec![create];
        }
        if !modified {
            trace!(path = %event.path.display(), "close-write without modify");
            return Vec::new();
        }
        event.kind = EventKind::MODIFY | EventKind::CLOSE_WRITE;
        vec![event]
    }

    fn offer_notification(&mut self, event: FilesystemEvent, now: Instant) -> Vec<FilesystemEvent> {
        let mut out = Vec::with_capacity(2);
        // anything else happening to a pending path must come after its create
        if let Some(pending) = self.pending.remove(&event.path) {
            out.push(pending.event);
        }
        if event.kind.intersects(EventKind::REMOVAL) {
            self.dirty.remove(&event.path);
        }

        // merged records like CREATE|DELETE describe a file that is already gone
        let parkable = event.kind.contains(EventKind::CREATE)
            && !event.kind.contains(EventKind::ON_DIR)
            && !event.kind.intersects(EventKind::REMOVAL);
        if parkable {
            self.pending.insert(
                event.path.clone(),
                PendingCreate {
                    event,
                    since: now,
                },
            );
        } else {
            out.push(event);
        }
        out
    }

    /// Creates that waited longer than the settle time, oldest first.
    pub fn expire(&mut self, now: Instant) -> Vec<FilesystemEvent> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.since) >= self.settle)
            .map(|(path, _)| path.clone())
            .collect();
        let mut expired: Vec<FilesystemEvent> = due
            .iter()
            .filter_map(|path| self.pending.remove(path))
            .map(|pending| pending.event)
            .collect();
        expired.sort_by_key(|event| event.seq);
        expired
    }

    /// When the oldest pending create falls due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|pending| pending.since + self.settle)
            .min()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
