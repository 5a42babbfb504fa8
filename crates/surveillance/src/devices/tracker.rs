use crate::event::Fsid;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Most devices tracked at once.
pub const MAX_USBS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device_node: String,
    pub mount_dir: PathBuf,
    pub fsid: Fsid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Inserted,
    /// The device node is already tracked; the old entry is kept.
    Duplicate,
    Full,
}

/// Live USB mounts. Entries are complete before they are inserted, so
/// readers never observe a partially built one.
#[derive(Debug, Default)]
pub struct MountTracker {
    entries: Mutex<Vec<MountEntry>>,
}

impl MountTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MountEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, entry: MountEntry) -> Insertion {
        let mut entries = self.lock();
        if entries.iter().any(|e| e.device_node == entry.device_node) {
            return Insertion::Duplicate;
        }
        if entries.len() >= MAX_USBS {
            return Insertion::Full;
        }
        entries.push(entry);
        Insertion::Inserted
    }

    pub fn remove_device(&self, device_node: &str) -> Option<MountEntry> {
        let mut entries = self.lock();
        let idx = entries.iter().position(|e| e.device_node == device_node)?;
        Some(entries.remove(idx))
    }

    pub fn get(&self, device_node: &str) -> Option<MountEntry> {
        self.lock()
            .iter()
            .find(|e| e.device_node == device_node)
            .cloned()
    }

    /// Mount directories of every live entry, in attach order.
    pub fn current_mounts(&self) -> Vec<PathBuf> {
        self.lock().iter().map(|e| e.mount_dir.clone()).collect()
    }

    pub fn mount_for_fsid(&self, fsid: Fsid) -> Option<PathBuf> {
        self.lock()
            .iter()
            .find(|e| e.fsid == fsid)
            .map(|e| e.mount_dir.clone())
    }

    pub fn is_live(&self, fsid: Fsid) -> bool {
        self.lock().iter().any(|e| e.fsid == fsid)
    }

    /// Whether `path` lies under any live mount.
    pub fn covers(&self, path: &Path) -> bool {
        self.lock().iter().any(|e| path.starts_with(&e.mount_dir))
    }

    pub fn entries(&self) -> Vec<MountEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
