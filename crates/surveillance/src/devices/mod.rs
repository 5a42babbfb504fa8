//! Removable storage discovery: initial enumeration, hotplug, and the table
//! of live USB mounts.

pub mod mountinfo;
pub mod sysfs;
mod tracker;
pub mod uevent;

pub use tracker::{Insertion, MAX_USBS, MountEntry, MountTracker};
pub use uevent::{Uevent, UeventAction, UeventSocket, parse_uevent};

use crate::error::Error;
use crate::report::{Report, Reporter};
use crate::shutdown::Shutdown;
use crate::sys;
use crate::watch::WatchInstaller;
use config::Devices;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Largest uevent datagram the kernel sends.
const UEVENT_BUFFER: usize = 8192;

#[derive(Debug)]
pub struct Discovery {
    settings: Devices,
    tracker: Arc<MountTracker>,
    installer: WatchInstaller,
    reporter: Reporter,
}

impl Discovery {
    pub fn new(
        settings: Devices,
        tracker: Arc<MountTracker>,
        installer: WatchInstaller,
        reporter: Reporter,
    ) -> Self {
        Self {
            settings,
            tracker,
            installer,
            reporter,
        }
    }

    /// `(device_node, mount_dir)` for every mounted block device on the USB
    /// bus. Any failure is logged and yields an empty list.
    pub fn enumerate_usb_mounts(&self) -> Vec<(String, PathBuf)> {
        let devices = match sysfs::usb_block_devices(&self.settings.sysfs_root) {
            Ok(devices) => devices,
            Err(err) => {
                warn!(root = %self.settings.sysfs_root.display(), %err, "cannot enumerate block devices");
                return Vec::new();
            }
        };
        let mounts = match mountinfo::read(&self.settings.mount_table) {
            Ok(mounts) => mounts,
            Err(err) => {
                warn!(table = %self.settings.mount_table.display(), %err, "cannot read mount table");
                return Vec::new();
            }
        };

        devices
            .into_iter()
            .filter_map(|device| {
                let dir = mountinfo::mount_point_of(&mounts, &device.device_node)?;
                Some((device.device_node, dir.to_path_buf()))
            })
            .collect()
    }

    /// Start watching a mounted device. Returns `false` if it was already
    /// tracked or the tracker is full.
    pub fn attach(&self, device_node: &str, mount_dir: &Path) -> Result<bool, Error> {
        let fsid = sys::fsid_of(mount_dir)?;
        let entry = MountEntry {
            device_node: device_node.to_owned(),
            mount_dir: mount_dir.to_path_buf(),
            fsid,
        };

        // Insert first so that events arriving while marks are placed can
        // already be resolved against this mount.
        match self.tracker.insert(entry) {
            Insertion::Inserted => {}
            Insertion::Duplicate => {
                debug!(device_node, "device already tracked");
                return Ok(false);
            }
            Insertion::Full => {
                warn!(device_node, max = MAX_USBS, "too many devices, not watching");
                return Ok(false);
            }
        }

        if let Err(err) = self.installer.install_for_mount(mount_dir) {
            self.tracker.remove_device(device_node);
            self.installer.uninstall_recursive(mount_dir);
            return Err(err);
        }

        info!(device_node, mount_dir = %mount_dir.display(), %fsid, "watching device");
        self.report_mounts();
        Ok(true)
    }

    /// Stop watching a device and forget everything known beneath it.
    pub fn detach(&self, device_node: &str) -> Option<MountEntry> {
        let entry = self.tracker.get(device_node)?;
        self.installer.uninstall_recursive(&entry.mount_dir);
        let entry = self.tracker.remove_device(device_node)?;
        info!(device_node, mount_dir = %entry.mount_dir.display(), "device detached");
        self.report_mounts();
        Some(entry)
    }

    /// Attach every USB mount present right now. Returns how many were
    /// attached.
    pub fn run_initial(&self) -> usize {
        let mut attached = 0;
        for (device_node, mount_dir) in self.enumerate_usb_mounts() {
            match self.attach(&device_node, &mount_dir) {
                Ok(true) => attached += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(device_node, mount_dir = %mount_dir.display(), %err, "failed to watch device")
                }
            }
        }
        info!(attached, "initial device enumeration done");
        attached
    }

    /// React to one kernel device notification.
    pub fn handle_uevent(&self, event: &Uevent, shutdown: &Shutdown) {
        if !event.is_block_device() {
            return;
        }
        let Some(devname) = event.devname() else {
            return;
        };
        let device_node = sysfs::device_node(devname);

        match event.action {
            UeventAction::Add => {
                let sys_path = self
                    .settings
                    .sysfs_root
                    .join(event.devpath.trim_start_matches('/'));
                if !sysfs::is_on_usb(&self.settings.sysfs_root, &sys_path) {
                    trace!(device_node, "ignoring non-USB block device");
                    return;
                }
                let Some(mount_dir) = self.wait_for_mount(&device_node, shutdown) else {
                    debug!(device_node, "device never showed up in the mount table");
                    return;
                };
                if let Err(err) = self.attach(&device_node, &mount_dir) {
                    warn!(device_node, mount_dir = %mount_dir.display(), %err, "failed to watch device");
                }
            }
            UeventAction::Remove => {
                self.detach(&device_node);
            }
            UeventAction::Change | UeventAction::Other(_) => {}
        }
    }

    /// Mounting races the attach notification; give the automounter a few
    /// chances before giving up.
    fn wait_for_mount(&self, device_node: &str, shutdown: &Shutdown) -> Option<PathBuf> {
        for attempt in 0..self.settings.mount_retries.max(1) {
            if shutdown.wait(self.settings.mount_settle) {
                return None;
            }
            match mountinfo::read(&self.settings.mount_table) {
                Ok(mounts) => {
                    if let Some(dir) = mountinfo::mount_point_of(&mounts, device_node) {
                        return Some(dir.to_path_buf());
                    }
                }
                Err(err) => warn!(%err, "cannot read mount table"),
            }
            trace!(device_node, attempt, "not mounted yet");
        }
        None
    }

    /// Follow attach and detach notifications until shutdown. A failure to
    /// subscribe or to receive ends only this loop.
    pub fn watch_hotplug(&self, shutdown: &Shutdown) -> Result<(), Error> {
        let socket = UeventSocket::open()?;
        let mut buf = vec![0u8; UEVENT_BUFFER];
        debug!("listening for device hotplug");

        while !shutdown.is_raised() {
            let mut fds = [
                PollFd::new(socket.as_fd(), PollFlags::POLLIN),
                PollFd::new(shutdown.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
            if shutdown.is_raised() {
                break;
            }

            loop {
                let len = match socket.recv(&mut buf) {
                    Ok(len) => len,
                    Err(Errno::EAGAIN) => break,
                    Err(Errno::EINTR) | Err(Errno::ENOBUFS) => continue,
                    Err(err) => return Err(err.into()),
                };
                if let Some(event) = parse_uevent(&buf[..len]) {
                    trace!(action = ?event.action, devpath = %event.devpath, "uevent");
                    self.handle_uevent(&event, shutdown);
                }
            }
        }
        debug!("hotplug watcher stopped");
        Ok(())
    }

    pub fn tracker(&self) -> &Arc<MountTracker> {
        &self.tracker
    }

    fn report_mounts(&self) {
        self.reporter.emit(Report::MountsChanged {
            mounts: self.tracker.current_mounts(),
        });
    }
}
