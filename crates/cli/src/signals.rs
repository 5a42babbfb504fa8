use flume::Sender;
use tokio::signal::unix::{SignalKind, signal};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGINT or SIGTERM.
    Shutdown,
    /// SIGUSR1.
    DumpStatus,
}

/// Forward process signals as [`SignalEvent`]s until the receiver is gone.
pub async fn wait_for_signal(tx: Sender<SignalEvent>) -> anyhow::Result<()> {
    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_usr1 = signal(SignalKind::user_defined1())?;

    loop {
        let event = tokio::select! {
            _ = sig_int.recv() => SignalEvent::Shutdown,
            _ = sig_term.recv() => SignalEvent::Shutdown,
            _ = sig_usr1.recv() => SignalEvent::DumpStatus,
        };
        trace!(?event, "signal received");
        if tx.send_async(event).await.is_err() {
            return Ok(());
        }
    }
}
