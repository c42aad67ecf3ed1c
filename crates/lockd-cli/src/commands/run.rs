//! `lockd run` command: the enforcement daemon.

use anyhow::{Context, Result};
use lockd_host::{ControlServer, LockDaemon, RequestEnvelope};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use crate::opts::DeviceOpts;
use crate::output::print_success;

use super::{open_offline, try_control_client};

pub async fn cmd_run(opts: &DeviceOpts) -> Result<()> {
    let config = opts.host_config()?;
    let control_path = opts.control_socket(&config);

    if control_path.exists() {
        if let Some(mut client) = try_control_client(opts, &config).await {
            let ping = RequestEnvelope::new("ping", "status", json!({}));
            if client.request(&ping).await.is_ok_and(|resp| resp.ok) {
                return print_success(
                    opts,
                    json!({ "daemon": "running", "socket": control_path }),
                    vec![],
                );
            }
            anyhow::bail!(
                "Control socket {} exists but is unhealthy. \
                 If the daemon is not running, delete the socket and retry.",
                control_path.display()
            );
        }
        // Nothing listening: a stale socket from an unclean exit.
    }

    setup_logging();

    let host = open_offline(config)?;
    let config = host.config().clone();
    tracing::info!(
        device_id = %config.device_id,
        data_dir = %config.data_dir.display(),
        backend = %config.backend_url,
        "starting lock daemon"
    );

    let (control_tx, control_rx) = mpsc::channel(128);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Ctrl-C and SIGTERM both shut down gracefully.
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl-C received, shutting down"),
            _ = async {
                match term.as_mut() {
                    Some(t) => { t.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => tracing::info!("SIGTERM received, shutting down"),
        }
        let _ = signal_tx.send(());
    });

    let server = ControlServer::new(control_path.clone(), control_tx, shutdown_tx);
    let listener = server.bind().context("bind control socket")?;
    tracing::info!(socket = %control_path.display(), "control socket listening");
    let server_handle = tokio::spawn(server.serve(listener));

    let mut daemon = LockDaemon::new(
        host.kernel().clone(),
        config.intervals,
        config.backoff,
        control_rx,
        shutdown_rx,
        Some(server_handle),
    );
    daemon.run().await?;
    Ok(())
}

/// Daemon logging. `RUST_LOG` overrides the default `info` filter; kernel
/// `log` records are bridged in by the subscriber.
fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}
