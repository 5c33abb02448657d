use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use utils::logging;
use utils::version;

use rsrc_mon::config::Cli;
use rsrc_mon::device::block::BlockDeviceApi;
use rsrc_mon::error::PoolError;
use rsrc_mon::monitor::Monitor;
use rsrc_mon::monitor::MonitorConfig;
use rsrc_mon::pool::discovery::SysfsDiscovery;
use rsrc_mon::pool::PoolConfig;
use rsrc_mon::pool::ResourcePool;
use rsrc_mon::report::encoder_for;
use rsrc_mon::report::ReportSink;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

/// Cancels `token` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
            }
            token.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                token.cancel();
            }
        });
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init(cli.log_level.map(Into::into), cli.log_file.as_deref())?;

    tracing::info!("Starting resource monitor {}", &**version::VERSION);

    let cancellation_token = CancellationToken::new();
    spawn_signal_handler(cancellation_token.clone())?;

    let discovery = SysfsDiscovery::new(&cli.sysfs_root, &cli.dev_root, cli.model_tag.as_str());
    let mut pool = match ResourcePool::initialize(
        &PoolConfig::from(&cli),
        Box::new(discovery),
        &cancellation_token,
    )
    .await
    {
        Ok(pool) => pool,
        Err(report) if matches!(report.current_context(), PoolError::Cancelled) => {
            return Ok(());
        }
        Err(report) => {
            tracing::error!(error = ?report, "Failed to access resource pool");
            return Err(anyhow::anyhow!("failed to access resource pool: {report:?}"));
        }
    };

    let sink = ReportSink::new(encoder_for(cli.output), std::io::stdout());
    let mut monitor = Monitor::new(MonitorConfig::from(&cli), &pool, BlockDeviceApi::new(), sink);
    let result = monitor.run(&cancellation_token).await;
    drop(monitor);

    pool.release();

    let exit = result?;
    tracing::info!(?exit, "Resource monitor stopped");
    Ok(())
}
