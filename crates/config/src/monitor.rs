use crate::watch_mode::WatchMode;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Monitor {
    /// Number of classifier worker threads draining the event queue.
    ///
    /// ## Note
    ///
    /// Workers spend most of their time hashing file contents, so more
    /// workers help when large files are copied onto a device in bulk.
    pub workers: usize,

    /// Capacity of the event queue between ingestion and the workers. When
    /// the queue is full the oldest queued event is discarded so ingestion
    /// never stalls behind slow workers.
    pub queue_capacity: usize,

    /// Maximum number of files whose last-known metadata is remembered for
    /// before/after diffing. Files beyond this limit are simply not tracked.
    pub path_table_capacity: usize,

    /// How watches are armed on each mount.
    ///
    /// See [`WatchMode`] for possible values.
    pub watch_mode: WatchMode,

    /// Size of the buffer each kernel read fills. **Measured in bytes**.
    pub read_buffer: usize,

    /// How long a freshly created file may stay without its first
    /// close-after-write before its create event is released on its own.
    /// **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub create_settle: Duration,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 1024,
            path_table_capacity: 128,
            watch_mode: WatchMode::MountWide,
            read_buffer: 8192,
            create_settle: Duration::from_millis(2000),
        }
    }
}
