use std::time::Duration;
use surveillance::{Record, ReportReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Periodically drains the report stream into the log.
#[derive(Debug)]
pub struct Presenter {
    receiver: ReportReceiver,
}

impl Presenter {
    pub fn new(receiver: ReportReceiver) -> Self {
        Self { receiver }
    }

    /// Log everything produced since the last flush. Returns how many
    /// records were logged.
    pub fn flush(&self) -> usize {
        let records = self.receiver.drain();
        let percentage = self.receiver.counters().suspicious_percentage();
        for record in &records {
            present(record, percentage);
        }
        records.len()
    }

    /// Flush every `period` until cancelled, then once more.
    pub async fn run(self, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush();
                }
                _ = token.cancelled() => break,
            }
        }
        self.flush();
    }
}

fn present(record: &Record, suspicious_percentage: f64) {
    let suspicious = format!("{suspicious_percentage:.1}%");
    if record.report.is_suspicious() {
        warn!(suspicious, "{record}");
    } else {
        info!(suspicious, "{record}");
    }
}
