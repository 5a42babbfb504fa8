//! Arming kernel watches on mounted devices.
//!
//! Two strategies are available. `MountWide` places one mount mark for
//! content events and one filesystem mark for directory-entry events; new
//! subdirectories are covered automatically. `Recursive` marks every
//! directory and file found by a walk and must be extended as directories
//! appear.

use crate::error::Error;
use crate::event::Channel;
use crate::fanotify::FanotifyChannel;
use crate::path_stat::{FileSnapshot, PathStatTable};
use config::WatchMode;
use nix::errno::Errno;
use nix::sys::fanotify::{MarkFlags, MaskFlags};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// What a single mark covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    /// One inode. Directory marks also report events on their children.
    Inode { is_dir: bool },
    /// Every object reachable through the mount.
    Mount,
    /// Every object of the filesystem, whichever mount it is accessed through.
    Filesystem,
}

/// Mark flags and event mask for one channel and scope.
pub fn mark_request(channel: Channel, scope: WatchScope) -> (MarkFlags, MaskFlags) {
    let flags = match scope {
        WatchScope::Inode { .. } => MarkFlags::FAN_MARK_INODE,
        WatchScope::Mount => MarkFlags::FAN_MARK_MOUNT,
        WatchScope::Filesystem => MarkFlags::FAN_MARK_FILESYSTEM,
    };
    let mut mask = match channel {
        Channel::Content => MaskFlags::FAN_MODIFY | MaskFlags::FAN_CLOSE_WRITE,
        // directory-entry events can only be requested on directories
        Channel::Notification if scope == (WatchScope::Inode { is_dir: false }) => {
            MaskFlags::FAN_ATTRIB
        }
        Channel::Notification => {
            MaskFlags::FAN_CREATE
                | MaskFlags::FAN_DELETE
                | MaskFlags::FAN_MOVED_FROM
                | MaskFlags::FAN_MOVED_TO
                | MaskFlags::FAN_ATTRIB
                | MaskFlags::FAN_ONDIR
        }
    };
    if let WatchScope::Inode { is_dir: true } = scope {
        mask |= MaskFlags::FAN_EVENT_ON_CHILD;
    }
    (flags, mask)
}

/// Places marks on the kernel side.
pub trait Marker: Send + Sync {
    fn mark(&self, channel: Channel, path: &Path, scope: WatchScope) -> Result<(), Error>;
}

/// [`Marker`] backed by the two fanotify groups.
#[derive(Debug)]
pub struct FanotifyMarker {
    content: Arc<FanotifyChannel>,
    notification: Arc<FanotifyChannel>,
}

impl FanotifyMarker {
    pub fn new(content: Arc<FanotifyChannel>, notification: Arc<FanotifyChannel>) -> Self {
        Self {
            content,
            notification,
        }
    }
}

impl Marker for FanotifyMarker {
    fn mark(&self, channel: Channel, path: &Path, scope: WatchScope) -> Result<(), Error> {
        let (flags, mask) = mark_request(channel, scope);
        let group = match channel {
            Channel::Content => &self.content,
            Channel::Notification => &self.notification,
        };
        match group.mark(path, flags, mask) {
            // already armed
            Err(Error::Mark {
                source: Errno::EEXIST,
                ..
            }) => Ok(()),
            other => other,
        }
    }
}

#[derive(Clone)]
pub struct WatchInstaller {
    marker: Arc<dyn Marker>,
    table: Arc<PathStatTable>,
    mode: WatchMode,
}

impl std::fmt::Debug for WatchInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchInstaller")
            .field("mode", &self.mode)
            .field("tracked", &self.table.len())
            .finish()
    }
}

impl WatchInstaller {
    pub fn new(marker: Arc<dyn Marker>, table: Arc<PathStatTable>, mode: WatchMode) -> Self {
        Self {
            marker,
            table,
            mode,
        }
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    /// Arm both channels on one path. Failures are logged.
    pub fn install(&self, path: &Path, is_dir: bool) {
        let scope = WatchScope::Inode { is_dir };
        for channel in [Channel::Content, Channel::Notification] {
            if let Err(err) = self.marker.mark(channel, path, scope) {
                warn!(%err, "failed to arm watch");
            }
        }
    }

    /// Arm every directory and file under `root` and remember the metadata of
    /// every regular file. Returns the number of marked entries.
    pub fn install_recursive(&self, root: &Path) -> usize {
        let mut marked = 0;
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(root = %root.display(), %err, "cannot descend while arming watches");
                    continue;
                }
            };
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                continue;
            }
            self.install(entry.path(), file_type.is_dir());
            marked += 1;

            if file_type.is_file() {
                self.remember(entry.path());
            }
        }
        debug!(root = %root.display(), marked, "recursive watches armed");
        marked
    }

    /// One mount mark for content and one filesystem mark for names; then
    /// snapshot existing regular files so later changes can be diffed.
    pub fn install_mount_wide(&self, root: &Path) -> Result<(), Error> {
        self.marker
            .mark(Channel::Content, root, WatchScope::Mount)?;
        self.marker
            .mark(Channel::Notification, root, WatchScope::Filesystem)?;

        let mut seeded = 0;
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
        {
            self.remember(entry.path());
            seeded += 1;
        }
        debug!(root = %root.display(), seeded, "mount-wide watches armed");
        Ok(())
    }

    /// Arm a freshly discovered mount according to the configured mode.
    pub fn install_for_mount(&self, root: &Path) -> Result<(), Error> {
        match self.mode {
            WatchMode::MountWide => self.install_mount_wide(root),
            WatchMode::Recursive => {
                self.install_recursive(root);
                Ok(())
            }
        }
    }

    /// Called for directories that appear under a watched mount.
    pub fn directory_created(&self, path: &Path) {
        if self.mode == WatchMode::Recursive {
            self.install_recursive(path);
        }
    }

    /// Forget everything remembered beneath `root`. Kernel marks go away
    /// with the mount itself.
    pub fn uninstall_recursive(&self, root: &Path) -> usize {
        let removed = self.table.remove_under(root);
        debug!(root = %root.display(), removed, "path-stat entries dropped");
        removed
    }

    fn remember(&self, path: &Path) {
        match FileSnapshot::capture(path) {
            Ok(snapshot) => {
                if let Err(err) = self.table.update(path, snapshot) {
                    trace!(path = %path.display(), %err, "not tracking file");
                }
            }
            Err(err) => trace!(path = %path.display(), %err, "stat failed while seeding"),
        }
    }
}
