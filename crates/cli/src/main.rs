use anyhow::Context;
use clap::Parser;
use config::Config;
use flume::bounded;
use fsentinel::{
    cli::Cli,
    presenter::Presenter,
    signals::{SignalEvent, wait_for_signal},
};
use std::io::Write;
use std::time::Duration;
use surveillance::Agent;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// How often buffered reports are written to the log.
const PRESENT_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. `FSENTINEL_LOG` can only set the level per crate, eg.
    // `FSENTINEL_LOG=surveillance=debug fsentinel -v`.
    let env_filter = EnvFilter::builder()
        .with_env_var("FSENTINEL_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    // load config
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        _ => {
            let mut candidates = glob::glob("/etc/fsentinel/config.d/*.toml")?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            candidates.insert(0, "/etc/fsentinel/config.toml".into());
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    cli.apply(&mut config);
    debug!(?config, ?cli);

    if cli.check_config {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", config.to_toml()?)?;
        return Ok(());
    }

    let (mut agent, receiver) =
        Agent::start(&config).context("failed to start surveillance (is CAP_SYS_ADMIN held?)")?;

    // install signal handlers
    let (signals_tx, signals_rx) = bounded(8);
    let mut signal_handle = tokio::spawn(async move { wait_for_signal(signals_tx).await });

    let token = CancellationToken::new();
    let presenter_handle = tokio::spawn(Presenter::new(receiver).run(PRESENT_PERIOD, token.clone()));

    let outcome: anyhow::Result<()> = loop {
        tokio::select! {
            // bubble up any errors from the signal handlers
            res = &mut signal_handle => {
                let res = res.map_err(anyhow::Error::from).and_then(|res| res);
                if let Err(err) = &res {
                    error!("error happened during handling signals: {}", err);
                }
                break res;
            }

            event_res = signals_rx.recv_async() => {
                let event = match event_res {
                    Ok(event) => event,
                    Err(err) => break Err(err.into()),
                };
                debug!(?event, "Received signal event");

                match event {
                    SignalEvent::Shutdown => {
                        info!("shutting down");
                        break Ok(());
                    }
                    SignalEvent::DumpStatus => {
                        info!(status = %agent.status(), "status");
                    }
                }
            }
        }
    };

    token.cancel();
    let agent = tokio::task::spawn_blocking(move || {
        agent.stop();
        agent
    })
    .await?;
    presenter_handle.await?;
    info!(status = %agent.status(), "final status");
    outcome
}
