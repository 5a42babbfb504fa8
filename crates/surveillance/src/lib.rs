#![deny(unsafe_code)]

pub mod agent;
pub mod classify;
pub mod devices;
pub mod error;
pub mod event;
pub mod fanotify;
pub mod ingest;
pub mod path_stat;
pub mod queue;
pub mod report;
pub mod shutdown;
pub mod sys;
pub mod watch;

pub use agent::{Agent, Services, Shared, StatusSnapshot};
pub use classify::{
    Classifier, Dropped, MalwareSignatures, Outcome, ProcessIdentity, ProcessInspector,
    ProcfsInspector, TrustPolicy, sha256_file,
};
pub use devices::{Discovery, MountEntry, MountTracker};
pub use error::{DecodeError, Error, ResolutionError, TableFull};
pub use event::{Channel, EventKind, FilesystemEvent, Fsid, PATH_MAX};
pub use fanotify::{FanotifyChannel, KernelEventSource, MalformedRecord};
pub use ingest::{Ingestor, Intake, WriteCoalescer};
pub use path_stat::{FileSnapshot, PathStatEntry, PathStatTable};
pub use queue::EventQueue;
pub use report::{Counters, MetadataChange, Record, Report, ReportReceiver, Reporter};
pub use shutdown::Shutdown;
pub use watch::{FanotifyMarker, Marker, WatchInstaller, WatchScope};
