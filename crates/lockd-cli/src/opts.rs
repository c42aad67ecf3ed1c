//! Global CLI options and host config resolution.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use lockd_host::HostConfig;

/// Global options for CLI commands.
///
/// Each falls back to the matching `LOCKD_*` variable; anything not covered
/// here is read by [`HostConfig::from_env`].
#[derive(Args, Debug, Clone)]
pub struct DeviceOpts {
    /// Data directory (env: LOCKD_DATA_DIR)
    #[arg(short = 'd', long, global = true, env = "LOCKD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Device id (env: LOCKD_DEVICE_ID)
    #[arg(long, global = true, env = "LOCKD_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Backend base URL (env: LOCKD_BACKEND_URL)
    #[arg(long, global = true, env = "LOCKD_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Hex Ed25519 key the backend signs commands with (env: LOCKD_BACKEND_PUBLIC_KEY)
    #[arg(long, global = true, env = "LOCKD_BACKEND_PUBLIC_KEY", hide_env_values = true)]
    pub backend_public_key: Option<String>,

    /// Mode selection: auto prefers the daemon when it is reachable
    #[arg(long, value_enum, default_value_t = Mode::Auto, global = true, env = "LOCKD_MODE")]
    pub mode: Mode,

    /// Control socket override (env: LOCKD_CONTROL)
    #[arg(long, global = true, env = "LOCKD_CONTROL")]
    pub control: Option<PathBuf>,

    /// JSON output envelope
    #[arg(long, global = true)]
    pub json: bool,

    /// Pretty-print JSON output (implies --json)
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Suppress notices
    #[arg(long, global = true)]
    pub quiet: bool,
}

/// Where a command runs.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Auto,
    Daemon,
    Offline,
}

impl DeviceOpts {
    pub fn host_config(&self) -> Result<HostConfig> {
        let mut config = HostConfig::from_env().context("read LOCKD_* environment")?;
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(id) = &self.device_id {
            config.device_id = id.clone();
        }
        if let Some(url) = &self.backend_url {
            config.backend_url = url.clone();
        }
        if let Some(key) = &self.backend_public_key {
            config.backend_public_key = Some(key.clone());
        }
        Ok(config)
    }

    pub fn control_socket(&self, config: &HostConfig) -> PathBuf {
        self.control.clone().unwrap_or_else(|| config.control_socket())
    }
}
