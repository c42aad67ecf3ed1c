//! CLI command handlers.

pub mod heartbeat;
pub mod incidents;
pub mod locks;
pub mod queue;
pub mod run;
pub mod self_check;
pub mod status;
pub mod stop;
pub mod unlock;

use anyhow::{Context, Result};
use lockd_host::{ControlClient, DeviceHost, HostConfig};
use serde_json::Value;

use crate::opts::{DeviceOpts, Mode};

/// Where a command is served from.
pub enum Target {
    Daemon(ControlClient),
    /// The store opened in-process. Only safe while no daemon holds it.
    Offline(DeviceHost),
}

impl Target {
    /// Call the daemon, or run `offline` against the in-process host.
    pub async fn call<F, Fut>(self, cmd: &str, payload: Value, offline: F) -> Result<Value>
    where
        F: FnOnce(DeviceHost) -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        match self {
            Target::Daemon(mut client) => Ok(client.call(cmd, payload).await?),
            Target::Offline(host) => offline(host).await,
        }
    }
}

/// Try to connect to a running daemon via the control socket.
pub async fn try_control_client(opts: &DeviceOpts, config: &HostConfig) -> Option<ControlClient> {
    let socket = opts.control_socket(config);
    if socket.exists() {
        ControlClient::connect(&socket).await.ok()
    } else {
        None
    }
}

pub fn open_offline(config: HostConfig) -> Result<DeviceHost> {
    let data_dir = config.data_dir.clone();
    DeviceHost::open(config).with_context(|| format!("open device store at {}", data_dir.display()))
}

/// Resolve the target per `--mode`. Auto falls back to offline when no
/// daemon answers.
pub async fn resolve_target(opts: &DeviceOpts) -> Result<(Target, Vec<String>)> {
    let config = opts.host_config()?;
    let mut warnings = Vec::new();
    if matches!(opts.mode, Mode::Auto | Mode::Daemon) {
        if let Some(client) = try_control_client(opts, &config).await {
            return Ok((Target::Daemon(client), warnings));
        }
        if opts.mode == Mode::Daemon {
            anyhow::bail!(
                "no daemon reachable at {}; start one with `lockd run` or pass --mode offline",
                opts.control_socket(&config).display()
            );
        }
        warnings.push("daemon not running; using the local store".into());
    }
    Ok((Target::Offline(open_offline(config)?), warnings))
}

pub fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("encode output")
}
