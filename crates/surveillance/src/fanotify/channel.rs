use crate::error::Error;
use crate::event::Channel;
use nix::sys::fanotify::{EventFFlags, Fanotify, InitFlags, MarkFlags, MaskFlags};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use tracing::debug;

/// A readable stream of raw kernel filesystem events.
pub trait KernelEventSource: Send + Sync {
    fn channel(&self) -> Channel;

    /// Descriptor that becomes readable when events are pending.
    fn as_fd(&self) -> BorrowedFd<'_>;

    /// Fill `buf` with whole event records; returns the byte count.
    fn read_batch(&self, buf: &mut [u8]) -> nix::Result<usize>;
}

/// One fanotify group.
#[derive(Debug)]
pub struct FanotifyChannel {
    channel: Channel,
    fan: Fanotify,
}

impl FanotifyChannel {
    /// Content-class group whose events carry an open descriptor of the
    /// modified file.
    pub fn open_content() -> Result<Self, Error> {
        Self::open(
            Channel::Content,
            InitFlags::FAN_CLOEXEC | InitFlags::FAN_NONBLOCK | InitFlags::FAN_CLASS_CONTENT,
        )
    }

    /// Notification-class group reporting directory handles and entry names,
    /// which is what directory-entry events (create, delete, move) need.
    pub fn open_notification() -> Result<Self, Error> {
        let report_fid =
            InitFlags::from_bits_retain(libc::FAN_REPORT_DFID_NAME | libc::FAN_REPORT_FID);
        Self::open(
            Channel::Notification,
            InitFlags::FAN_CLOEXEC
                | InitFlags::FAN_NONBLOCK
                | InitFlags::FAN_CLASS_NOTIF
                | report_fid,
        )
    }

    fn open(channel: Channel, flags: InitFlags) -> Result<Self, Error> {
        let fan = Fanotify::init(
            flags,
            EventFFlags::O_RDONLY | EventFFlags::O_CLOEXEC | EventFFlags::O_LARGEFILE,
        )
        .map_err(|source| Error::FanotifyInit { channel, source })?;
        debug!(%channel, "fanotify group initialized");
        Ok(Self { channel, fan })
    }

    pub fn mark(&self, path: &Path, flags: MarkFlags, mask: MaskFlags) -> Result<(), Error> {
        // An absolute path makes the dirfd irrelevant.
        self.fan
            .mark(MarkFlags::FAN_MARK_ADD | flags, mask, self.fan.as_fd(), Some(path))
            .map_err(|source| Error::Mark {
                channel: self.channel,
                path: path.to_path_buf(),
                source,
            })
    }
}

impl KernelEventSource for FanotifyChannel {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fan.as_fd()
    }

    fn read_batch(&self, buf: &mut [u8]) -> nix::Result<usize> {
        nix::unistd::read(&self.fan, buf)
    }
}
