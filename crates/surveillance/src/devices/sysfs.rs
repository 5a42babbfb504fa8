//! Finding block devices that sit on the USB bus by walking sysfs.

use rustc_hash::FxHashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Canonical sysfs directory of the block device.
    pub sys_path: PathBuf,
    /// Device node, e.g. `/dev/sdb1`.
    pub device_node: String,
}

/// `KEY=VALUE` lines of a sysfs `uevent` file.
pub fn read_uevent_file(dir: &Path) -> io::Result<FxHashMap<String, String>> {
    let text = std::fs::read_to_string(dir.join("uevent"))?;
    Ok(text
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect())
}

/// Whether a sysfs device directory has a USB device among its ancestors.
pub fn is_on_usb(sysfs_root: &Path, device_dir: &Path) -> bool {
    let Ok(root) = sysfs_root.canonicalize() else {
        return false;
    };
    let Ok(device_dir) = device_dir.canonicalize() else {
        return false;
    };
    device_dir
        .ancestors()
        .take_while(|ancestor| ancestor.starts_with(&root) && *ancestor != root)
        .any(is_usb_device)
}

fn is_usb_device(dir: &Path) -> bool {
    let subsystem = match std::fs::read_link(dir.join("subsystem")) {
        Ok(target) => target,
        Err(_) => return false,
    };
    if subsystem.file_name().is_none_or(|name| name != "usb") {
        return false;
    }
    read_uevent_file(dir)
        .map(|env| env.get("DEVTYPE").is_some_and(|t| t == "usb_device"))
        .unwrap_or(false)
}

/// Every block device (disks and partitions) whose ancestry includes a USB
/// device.
pub fn usb_block_devices(sysfs_root: &Path) -> io::Result<Vec<BlockDevice>> {
    let mut devices = Vec::new();
    for entry in std::fs::read_dir(sysfs_root.join("class/block"))? {
        let entry = entry?;
        let sys_path = match entry.path().canonicalize() {
            Ok(path) => path,
            Err(err) => {
                trace!(path = %entry.path().display(), %err, "dangling block device link");
                continue;
            }
        };
        if !is_on_usb(sysfs_root, &sys_path) {
            continue;
        }
        let devname = read_uevent_file(&sys_path)
            .ok()
            .and_then(|mut env| env.remove("DEVNAME"))
            .unwrap_or_else(|| entry.file_name().to_string_lossy().into_owned());
        devices.push(BlockDevice {
            sys_path,
            device_node: device_node(&devname),
        });
    }
    devices.sort_by(|a, b| a.device_node.cmp(&b.device_node));
    Ok(devices)
}

/// `/dev/<name>` unless the name is already absolute.
pub fn device_node(devname: &str) -> String {
    if devname.starts_with('/') {
        devname.to_owned()
    } else {
        format!("/dev/{devname}")
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeSysfs;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_usb_backed_devices_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs = FakeSysfs::new(dir.path());
        let usb_disk = sysfs.add_usb_disk("1-1", "sdb");
        sysfs.add_partition(&usb_disk, "sdb1");
        let ata_disk = sysfs.add_ata_disk("sda");
        sysfs.add_partition(&ata_disk, "sda1");

        let nodes: Vec<String> = usb_block_devices(dir.path())
            .unwrap()
            .into_iter()
            .map(|device| device.device_node)
            .collect();
        assert_eq!(nodes, vec!["/dev/sdb".to_owned(), "/dev/sdb1".to_owned()]);
    }

    #[test]
    fn ancestry_decides_usb_membership() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs = FakeSysfs::new(dir.path());
        let disk = sysfs.add_usb_disk("2-1", "sdc");
        assert!(is_on_usb(dir.path(), &disk));
        assert!(is_on_usb(dir.path(), disk.parent().unwrap()));
        assert!(!is_on_usb(dir.path(), &dir.path().join("devices/pci0000:00")));
    }

    #[test]
    fn missing_class_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(usb_block_devices(dir.path()).is_err());
    }

    #[test]
    fn device_node_names() {
        assert_eq!(device_node("sdb1"), "/dev/sdb1");
        assert_eq!(device_node("/dev/sdb1"), "/dev/sdb1");
    }
}
