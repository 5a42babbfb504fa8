use crate::classify::{Classifier, MalwareSignatures, ProcessInspector, ProcfsInspector, TrustPolicy};
use crate::devices::{Discovery, MountTracker};
use crate::error::Error;
use crate::event::FilesystemEvent;
use crate::fanotify::{FanotifyChannel, KernelEventSource};
use crate::ingest::{Ingestor, Intake};
use crate::path_stat::PathStatTable;
use crate::queue::EventQueue;
use crate::report::{self, ReportReceiver, Reporter};
use crate::shutdown::Shutdown;
use crate::watch::{FanotifyMarker, Marker, WatchInstaller};
use config::Config;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// The kernel-facing collaborators of an [`Agent`].
pub struct Services {
    pub notification: Arc<dyn KernelEventSource>,
    pub content: Arc<dyn KernelEventSource>,
    pub marker: Arc<dyn Marker>,
    pub inspector: Arc<dyn ProcessInspector>,
}

impl Services {
    /// Both fanotify groups plus procfs. Needs `CAP_SYS_ADMIN`.
    pub fn fanotify() -> Result<Self, Error> {
        let content = Arc::new(FanotifyChannel::open_content()?);
        let notification = Arc::new(FanotifyChannel::open_notification()?);
        Ok(Self {
            marker: Arc::new(FanotifyMarker::new(
                Arc::clone(&content),
                Arc::clone(&notification),
            )),
            notification,
            content,
            inspector: Arc::new(ProcfsInspector),
        })
    }
}

/// Process-wide state, built once per agent and handed to every thread.
#[derive(Debug, Clone)]
pub struct Shared {
    pub table: Arc<PathStatTable>,
    pub queue: Arc<EventQueue<FilesystemEvent>>,
    pub tracker: Arc<MountTracker>,
    pub reporter: Reporter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub mounts: Vec<PathBuf>,
    pub tracked_paths: usize,
    pub table_capacity: usize,
    pub queue_depth: usize,
    pub dropped_events: u64,
    pub reports: u64,
    pub suspicious: u64,
    pub suspicious_percentage: f64,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mounts={} tracked={}/{} queued={} dropped={} reports={} suspicious={} ({:.1}%)",
            self.mounts.len(),
            self.tracked_paths,
            self.table_capacity,
            self.queue_depth,
            self.dropped_events,
            self.reports,
            self.suspicious,
            self.suspicious_percentage,
        )
    }
}

pub struct Agent {
    shared: Shared,
    shutdown: Shutdown,
    /// Discovery and ingestion; they wake on the shutdown pipe.
    pollers: Vec<JoinHandle<()>>,
    /// Workers; they wake when the queue closes.
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("threads", &(self.pollers.len() + self.workers.len()))
            .field("stopping", &self.shutdown.is_raised())
            .finish()
    }
}

impl Agent {
    /// Open both fanotify groups and start every thread.
    pub fn start(config: &Config) -> Result<(Self, ReportReceiver), Error> {
        Self::launch(config, Services::fanotify()?)
    }

    /// Start every thread on top of the given services. A failure to spawn
    /// stops whatever was already running.
    pub fn launch(config: &Config, services: Services) -> Result<(Self, ReportReceiver), Error> {
        let (reporter, receiver) = report::channel();
        let shared = Shared {
            table: Arc::new(PathStatTable::new(config.monitor.path_table_capacity)),
            queue: Arc::new(EventQueue::new(config.monitor.queue_capacity)),
            tracker: Arc::new(MountTracker::new()),
            reporter,
        };
        let mut agent = Agent {
            shared: shared.clone(),
            shutdown: Shutdown::new()?,
            pollers: Vec::new(),
            workers: Vec::new(),
        };

        let installer = WatchInstaller::new(
            Arc::clone(&services.marker),
            Arc::clone(&shared.table),
            config.monitor.watch_mode,
        );

        let discovery = Discovery::new(
            config.devices.clone(),
            Arc::clone(&shared.tracker),
            installer.clone(),
            shared.reporter.clone(),
        );
        let hotplug = config.devices.hotplug;
        let shutdown = agent.shutdown.clone();
        agent.pollers.push(spawn("fsentinel-discovery", move || {
            discovery.run_initial();
            if !hotplug {
                return;
            }
            if let Err(err) = discovery.watch_hotplug(&shutdown) {
                warn!(%err, "hotplug monitoring stopped, attached devices stay watched");
            }
        })?);

        let intake = Intake::new(
            Arc::clone(&shared.tracker),
            Arc::clone(&shared.table),
            installer,
            config.monitor.create_settle,
        );
        let mut ingestor = Ingestor::new(
            services.notification,
            services.content,
            intake,
            Arc::clone(&shared.queue),
            config.monitor.read_buffer,
        );
        let shutdown = agent.shutdown.clone();
        agent.pollers.push(spawn("fsentinel-ingest", move || {
            if let Err(err) = ingestor.run(&shutdown) {
                warn!(%err, "ingestion stopped, no further events will be queued");
            }
        })?);

        let classifier = Arc::new(Classifier::new(
            services.inspector,
            TrustPolicy::new(&config.classifier.trusted_prefixes),
            MalwareSignatures::from_hex(&config.classifier.malware_digests),
            Arc::clone(&shared.table),
            Arc::clone(&shared.tracker),
            shared.reporter.clone(),
        ));
        for id in 0..config.monitor.workers.max(1) {
            let classifier = Arc::clone(&classifier);
            let queue = Arc::clone(&shared.queue);
            agent.workers.push(spawn(&format!("fsentinel-worker-{id}"), move || {
                classifier.run(&queue);
            })?);
        }

        info!(
            workers = agent.workers.len(),
            mode = ?config.monitor.watch_mode,
            "surveillance started"
        );
        Ok((agent, receiver))
    }

    pub fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn status(&self) -> StatusSnapshot {
        let counters = self.shared.reporter.counters();
        StatusSnapshot {
            mounts: self.shared.tracker.current_mounts(),
            tracked_paths: self.shared.table.len(),
            table_capacity: self.shared.table.capacity(),
            queue_depth: self.shared.queue.len(),
            dropped_events: self.shared.queue.dropped(),
            reports: counters.total(),
            suspicious: counters.suspicious(),
            suspicious_percentage: counters.suspicious_percentage(),
        }
    }

    /// Stop and join every thread. The fanotify groups close once the last
    /// thread holding them is gone. Calling it twice is harmless.
    pub fn stop(&mut self) {
        if self.pollers.is_empty() && self.workers.is_empty() {
            return;
        }
        self.shutdown.raise();
        for handle in self.pollers.drain(..) {
            join(handle);
        }
        let discarded = self.shared.queue.close();
        for handle in self.workers.drain(..) {
            join(handle);
        }
        info!(discarded, "surveillance stopped");
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn<F>(name: &str, body: F) -> Result<JoinHandle<()>, Error>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(body)
        .map_err(|source| Error::Spawn {
            name: name.to_owned(),
            source,
        })
}

fn join(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("unnamed").to_owned();
    match handle.join() {
        Ok(()) => debug!(thread = name, "thread joined"),
        Err(_) => warn!(thread = name, "thread panicked"),
    }
}
