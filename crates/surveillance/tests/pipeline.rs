mod common;

use common::{FakeMachine, FixedInspector, PipeSource, RecordingMarker, content_record, wait_for};
use config::{Config, WatchMode};
use nix::sys::fanotify::MaskFlags;
use pretty_assertions::assert_eq;
use std::fs::{self, File};
use std::os::fd::IntoRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use surveillance::{Agent, Channel, Report, Services};

const WRITER_PID: i32 = 1;

fn launch(machine: &FakeMachine, exe: &str) -> (Agent, surveillance::ReportReceiver, Arc<PipeSource>) {
    let mut config = Config::default();
    config.devices = machine.devices();
    config.monitor.workers = 2;
    config.monitor.watch_mode = WatchMode::MountWide;

    let content = Arc::new(PipeSource::new(Channel::Content));
    let services = Services {
        notification: Arc::new(PipeSource::new(Channel::Notification)),
        content: content.clone(),
        marker: Arc::new(RecordingMarker::default()),
        inspector: Arc::new(FixedInspector {
            exe: PathBuf::from(exe),
        }),
    };
    let (agent, reports) = Agent::launch(&config, services).unwrap();
    (agent, reports, content)
}

#[test]
fn write_to_usb_stick_is_reported_and_tracked() {
    let root = tempfile::tempdir().unwrap();
    let machine = FakeMachine::new(root.path());
    let (mut agent, reports, content) = launch(&machine, "/usr/bin/cp");

    wait_for(|| (agent.status().mounts == vec![machine.mount.clone()]).then_some(()));

    let file = machine.mount.join("a.txt");
    fs::write(&file, b"hello").unwrap();
    let mut batch = content_record(
        MaskFlags::FAN_MODIFY.bits(),
        File::open(&file).unwrap().into_raw_fd(),
        WRITER_PID,
    );
    batch.extend(content_record(
        MaskFlags::FAN_CLOSE_WRITE.bits(),
        File::open(&file).unwrap().into_raw_fd(),
        WRITER_PID,
    ));
    content.feed(&batch);

    let mut seen = Vec::new();
    let modification = wait_for(|| {
        seen.extend(reports.drain().into_iter().map(|record| record.report));
        seen.iter()
            .find(|report| matches!(report, Report::FileModification { .. }))
            .cloned()
    });
    let Report::FileModification { path, snapshot, .. } = modification else {
        unreachable!()
    };
    assert_eq!(path, file);
    assert_eq!(snapshot.size, 5);

    wait_for(|| agent.shared().table.lookup(&file));
    assert_eq!(agent.shared().table.lookup(&file).unwrap().size, 5);

    agent.stop();
    seen.extend(reports.drain().into_iter().map(|record| record.report));
    assert!(seen.iter().all(|report| !report.is_suspicious()));
    let modifications = seen
        .iter()
        .filter(|report| matches!(report, Report::FileModification { .. }))
        .count();
    assert_eq!(modifications, 1);
}

#[test]
fn stop_is_idempotent_and_status_survives_it() {
    let root = tempfile::tempdir().unwrap();
    let machine = FakeMachine::new(root.path());
    let (mut agent, _reports, _content) = launch(&machine, "/usr/bin/cp");

    wait_for(|| (!agent.status().mounts.is_empty()).then_some(()));
    agent.stop();
    agent.stop();

    let status = agent.status();
    assert_eq!(status.table_capacity, 128);
    assert_eq!(status.queue_depth, 0);
    assert_eq!(status.mounts.len(), 1);
    // the mount report is not a file event
    assert_eq!(status.reports, 0);
}
