use bitflags::bitflags;
use nix::sys::fanotify::MaskFlags;
use std::fmt;
use std::path::PathBuf;

/// Longest path an event may carry, in bytes.
pub const PATH_MAX: usize = 4096;

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq)]
    pub struct EventKind: u32 {
        const CREATE = 1 << 0;
        const DELETE = 1 << 1;
        const MODIFY = 1 << 2;
        const MOVED_FROM = 1 << 3;
        const MOVED_TO = 1 << 4;
        const ATTRIB = 1 << 5;
        const CLOSE_WRITE = 1 << 6;
        const ON_DIR = 1 << 7;
    }
}

impl EventKind {
    /// Directory-entry and attribute changes the notification channel cares about.
    pub const NOTIFY_INTEREST: Self = Self::CREATE
        .union(Self::DELETE)
        .union(Self::MOVED_FROM)
        .union(Self::MOVED_TO)
        .union(Self::ATTRIB);

    /// Content changes the content channel cares about.
    pub const CONTENT_INTEREST: Self = Self::MODIFY.union(Self::CLOSE_WRITE);

    pub const REMOVAL: Self = Self::DELETE.union(Self::MOVED_FROM);

    pub const ARRIVAL: Self = Self::CREATE.union(Self::MOVED_TO);

    /// Kinds that get the full stat / digest / verdict treatment.
    pub const CHANGE: Self = Self::CREATE
        .union(Self::MODIFY)
        .union(Self::MOVED_TO)
        .union(Self::ATTRIB);

    /// Kinds whose metadata is diffed against the last snapshot.
    pub const DIFFED: Self = Self::ATTRIB.union(Self::MODIFY).union(Self::MOVED_TO);

    pub fn from_mask(mask: MaskFlags) -> Self {
        const TABLE: [(MaskFlags, EventKind); 8] = [
            (MaskFlags::FAN_CREATE, EventKind::CREATE),
            (MaskFlags::FAN_DELETE, EventKind::DELETE),
            (MaskFlags::FAN_MODIFY, EventKind::MODIFY),
            (MaskFlags::FAN_MOVED_FROM, EventKind::MOVED_FROM),
            (MaskFlags::FAN_MOVED_TO, EventKind::MOVED_TO),
            (MaskFlags::FAN_ATTRIB, EventKind::ATTRIB),
            (MaskFlags::FAN_CLOSE_WRITE, EventKind::CLOSE_WRITE),
            (MaskFlags::FAN_ONDIR, EventKind::ON_DIR),
        ];
        TABLE
            .iter()
            .filter(|(flag, _)| mask.contains(*flag))
            .fold(EventKind::empty(), |acc, (_, kind)| acc | *kind)
    }

    pub fn from_raw_mask(mask: u64) -> Self {
        Self::from_mask(MaskFlags::from_bits_truncate(mask))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventKind, &str); 7] = [
            (EventKind::CREATE, "create"),
            (EventKind::DELETE, "delete"),
            (EventKind::MOVED_FROM, "move-from"),
            (EventKind::MOVED_TO, "move-to"),
            (EventKind::MODIFY, "modify"),
            (EventKind::ATTRIB, "attrib"),
            (EventKind::CLOSE_WRITE, "close-write"),
        ];
        let mut first = true;
        for (kind, name) in NAMES {
            if self.contains(kind) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("unknown")?;
        }
        Ok(())
    }
}

/// Which kernel subscription an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Fd-bearing events: modify, close-write.
    Content,
    /// Handle-bearing events: create, delete, move, attrib.
    Notification,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Content => f.write_str("content"),
            Channel::Notification => f.write_str("notification"),
        }
    }
}

/// Filesystem id as reported by `statfs(2)` and fanotify fid records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Fsid(pub [i32; 2]);

impl fmt::Display for Fsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.0[0] as u32, self.0[1] as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemEvent {
    /// Ingestion order. Reports carry it so per-path order survives the
    /// worker pool.
    pub seq: u64,
    pub kind: EventKind,
    pub pid: i32,
    pub path: PathBuf,
    pub fsid: Option<Fsid>,
    pub origin: Channel,
}
