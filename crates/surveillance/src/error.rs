use crate::event::{Channel, Fsid};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to initialize the {channel} fanotify channel: {source}")]
    FanotifyInit {
        channel: Channel,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to mark {path:?} on the {channel} channel: {source}")]
    Mark {
        channel: Channel,
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read procfs info: {0}")]
    Procfs(#[from] procfs::ProcError),

    #[error("Failed to resolve event path: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Failed to decode kernel event: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    TableFull(#[from] TableFull),

    #[error("System call failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),
}

/// The path-stat table has no free slot for a new path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("path-stat table is full ({capacity} entries)")]
pub struct TableFull {
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("record at offset {offset} needs {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unsupported fanotify metadata version {0}")]
    Version(u8),

    #[error("info record at offset {offset} declares length {len}")]
    InfoLength { offset: usize, len: usize },

    #[error("file handle of {handle_bytes} bytes overruns its {available}-byte info record")]
    HandleOverrun {
        handle_bytes: usize,
        available: usize,
    },

    #[error("entry name is not NUL-terminated inside its info record")]
    UnterminatedName,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("no watched mount has filesystem id {0}")]
    NoMount(Fsid),

    #[error("file handle is stale (file deleted before it could be resolved)")]
    Stale,

    #[error("event carries neither a file handle nor a file descriptor")]
    NoHandle,

    #[error("resolved path is {0} bytes long")]
    TooLong(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
