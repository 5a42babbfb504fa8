//! Fixed-capacity table of last-known file metadata, used to diff a file's
//! state before and after an event.
//!
//! Slots keep the "claim the first free slot" semantics of a fixed array; a
//! hash index makes every lookup O(1). One mutex guards the whole table and
//! no I/O ever happens while it is held.

use crate::error::TableFull;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileSnapshot {
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub uid: u32,
    pub gid: u32,
    pub inode: u64,
    pub dev: u64,
}

impl FileSnapshot {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            mode: meta.mode(),
            size: meta.size(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            uid: meta.uid(),
            gid: meta.gid(),
            inode: meta.ino(),
            dev: meta.dev(),
        }
    }

    /// `stat(2)` the path, following symlinks.
    pub fn capture(path: &Path) -> std::io::Result<Self> {
        std::fs::metadata(path).map(|meta| Self::from_metadata(&meta))
    }

    /// Permission bits including setuid/setgid/sticky.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStatEntry {
    pub path: PathBuf,
    pub snapshot: FileSnapshot,
}

#[derive(Debug)]
struct Slots {
    entries: Vec<Option<PathStatEntry>>,
    index: FxHashMap<PathBuf, usize>,
    free: BTreeSet<usize>,
}

#[derive(Debug)]
pub struct PathStatTable {
    capacity: usize,
    slots: Mutex<Slots>,
}

impl PathStatTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(Slots {
                entries: vec![None; capacity],
                index: FxHashMap::default(),
                free: (0..capacity).collect(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot index currently holding `path`.
    pub fn find_index(&self, path: &Path) -> Option<usize> {
        self.lock().index.get(path).copied()
    }

    /// Insert or overwrite the snapshot for `path`.
    ///
    /// An existing path keeps its slot and only has its metadata replaced. A
    /// new path claims the lowest free slot, or fails with [`TableFull`].
    pub fn update(&self, path: &Path, snapshot: FileSnapshot) -> Result<(), TableFull> {
        let mut slots = self.lock();
        if let Some(&idx) = slots.index.get(path) {
            if let Some(entry) = slots.entries[idx].as_mut() {
                entry.snapshot = snapshot;
            }
            return Ok(());
        }

        let Some(idx) = slots.free.pop_first() else {
            return Err(TableFull {
                capacity: self.capacity,
            });
        };
        slots.entries[idx] = Some(PathStatEntry {
            path: path.to_path_buf(),
            snapshot,
        });
        slots.index.insert(path.to_path_buf(), idx);
        Ok(())
    }

    /// Forget `path`. Returns whether it was tracked.
    pub fn remove(&self, path: &Path) -> bool {
        let mut slots = self.lock();
        match slots.index.remove(path) {
            Some(idx) => {
                slots.entries[idx] = None;
                slots.free.insert(idx);
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, path: &Path) -> Option<FileSnapshot> {
        let slots = self.lock();
        let idx = *slots.index.get(path)?;
        slots.entries[idx].as_ref().map(|entry| entry.snapshot)
    }

    /// Forget every path at or beneath `root` (component-wise, so
    /// `/media/usb0` does not cover `/media/usb01`). Returns how many were
    /// removed.
    pub fn remove_under(&self, root: &Path) -> usize {
        let mut slots = self.lock();
        let doomed: Vec<(PathBuf, usize)> = slots
            .index
            .iter()
            .filter(|(path, _)| path.starts_with(root))
            .map(|(path, idx)| (path.clone(), *idx))
            .collect();
        for (path, idx) in &doomed {
            slots.index.remove(path);
            slots.entries[*idx] = None;
            slots.free.insert(*idx);
        }
        doomed.len()
    }

    /// Copy of all live entries in slot order.
    pub fn entries(&self) -> Vec<PathStatEntry> {
        self.lock().entries.iter().flatten().cloned().collect()
    }
}
