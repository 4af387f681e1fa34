//! fleet-worker: claims queued playbook runs and executes them, and keeps
//! schedules, secret rotation, leases and dynamic groups moving.

use anyhow::{Context, Result};
use fleet_core::config::Config;
use fleet_daemon::daemon::Daemon;
use fleet_harness::shutdown::ShutdownSignal;
use fleet_telemetry::logging::{self, LogFormat};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = Config::load().context("failed to load worker configuration")?;
    logging::init(
        "fleet-worker",
        &config.logging.level,
        LogFormat::from_json_flag(config.logging.json),
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %config.control_plane.base_url,
        runs_dir = %config.execution.runs_dir.display(),
        "fleet worker starting"
    );

    let daemon = Daemon::from_config(config).await?;
    tokio::spawn(wait_for_signal(daemon.shutdown_handle()));

    if let Err(e) = daemon.run().await {
        error!(error = format!("{e:#}"), "worker execution failed");
        return Err(e);
    }
    Ok(())
}

/// Trigger shutdown on ctrl-c or SIGTERM.
async fn wait_for_signal(shutdown: ShutdownSignal) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                return;
            }
        };
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(error = %e, "failed to listen for ctrl-c");
                    return;
                }
                info!("ctrl-c received, initiating shutdown");
            }
            _ = term.recv() => info!("SIGTERM received, initiating shutdown"),
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
    }
    shutdown.trigger();
}
