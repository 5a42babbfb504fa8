use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Devices {
    /// Root of the sysfs tree used to find block devices on the USB bus.
    pub sysfs_root: PathBuf,

    /// Mount table consulted to map device nodes to mount directories.
    pub mount_table: PathBuf,

    /// Whether to follow device attach/detach after the initial
    /// enumeration. With this off only devices present at startup are
    /// watched.
    pub hotplug: bool,

    /// Delay between a device attach and the first mount table lookup.
    /// The automounter usually needs a moment. **Measured in
    /// milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub mount_settle: Duration,

    /// How many times the mount table is consulted (one `mount_settle`
    /// apart) before giving up on an attached device.
    pub mount_retries: u32,
}

impl Default for Devices {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            mount_table: PathBuf::from("/proc/self/mountinfo"),
            hotplug: true,
            mount_settle: Duration::from_millis(1000),
            mount_retries: 5,
        }
    }
}
