#![allow(dead_code)]

use nix::fcntl::OFlag;
use nix::unistd::{pipe2, write};
use std::fs;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use surveillance::error::Error;
use surveillance::{Channel, KernelEventSource, Marker, ProcessIdentity, ProcessInspector, WatchScope};

/// Kernel event stream fed by the test through a pipe.
pub struct PipeSource {
    channel: Channel,
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl PipeSource {
    pub fn new(channel: Channel) -> Self {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).unwrap();
        Self {
            channel,
            read_end,
            write_end,
        }
    }

    pub fn feed(&self, bytes: &[u8]) {
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

/// One fd-bearing fanotify record without info records.
pub fn content_record(mask: u64, fd: i32, pid: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&24u32.to_ne_bytes());
    out.push(libc::FANOTIFY_METADATA_VERSION);
    out.push(0);
    out.extend_from_slice(&24u16.to_ne_bytes());
    out.extend_from_slice(&mask.to_ne_bytes());
    out.extend_from_slice(&fd.to_ne_bytes());
    out.extend_from_slice(&pid.to_ne_bytes());
    out
}

#[derive(Debug, Default)]
pub struct RecordingMarker {
    pub marks: Mutex<Vec<(Channel, PathBuf, WatchScope)>>,
}

impl Marker for RecordingMarker {
    fn mark(&self, channel: Channel, path: &Path, scope: WatchScope) -> Result<(), Error> {
        self.marks
            .lock()
            .unwrap()
            .push((channel, path.to_path_buf(), scope));
        Ok(())
    }
}

/// Every pid runs `exe`.
#[derive(Debug)]
pub struct FixedInspector {
    pub exe: PathBuf,
}

impl ProcessInspector for FixedInspector {
    fn inspect(&self, pid: i32) -> Result<ProcessIdentity, Error> {
        Ok(ProcessIdentity {
            pid,
            uid: 1000,
            gid: 1000,
            ppid: 1,
            exe: self.exe.clone(),
            cmdline: Vec::new(),
        })
    }
}

/// A sysfs tree holding a single USB stick `sdb` and a mount table that
/// shows `/dev/sdb` mounted on `mount`.
pub struct FakeMachine {
    pub sysfs: PathBuf,
    pub mount_table: PathBuf,
    pub mount: PathBuf,
}

impl FakeMachine {
    pub fn new(root: &Path) -> Self {
        let sysfs = root.join("sys");
        let usb = sysfs.join("devices/pci0000:00/usb1/1-1");
        let disk = usb.join("1-1:1.0/host6/target6:0:0/6:0:0:0/block/sdb");
        fs::create_dir_all(&disk).unwrap();
        fs::create_dir_all(sysfs.join("bus/usb")).unwrap();
        fs::create_dir_all(sysfs.join("bus/block")).unwrap();
        fs::create_dir_all(sysfs.join("class/block")).unwrap();
        fs::write(usb.join("uevent"), "DEVTYPE=usb_device\n").unwrap();
        symlink(sysfs.join("bus/usb"), usb.join("subsystem")).unwrap();
        fs::write(disk.join("uevent"), "DEVNAME=sdb\nDEVTYPE=disk\n").unwrap();
        symlink(sysfs.join("bus/block"), disk.join("subsystem")).unwrap();
        symlink(&disk, sysfs.join("class/block/sdb")).unwrap();

        let mount = root.join("media/usb0");
        fs::create_dir_all(&mount).unwrap();
        let mount = mount.canonicalize().unwrap();
        let mount_table = root.join("mountinfo");
        fs::write(
            &mount_table,
            format!("90 31 8:16 / {} rw,nosuid - vfat /dev/sdb rw\n", mount.display()),
        )
        .unwrap();

        Self {
            sysfs,
            mount_table,
            mount,
        }
    }

    pub fn devices(&self) -> config::Devices {
        config::Devices {
            sysfs_root: self.sysfs.clone(),
            mount_table: self.mount_table.clone(),
            hotplug: false,
            mount_settle: Duration::from_millis(1),
            mount_retries: 1,
        }
    }
}

/// Poll `probe` until it yields a value or ten seconds pass.
pub fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting");
        std::thread::sleep(Duration::from_millis(10));
    }
}
