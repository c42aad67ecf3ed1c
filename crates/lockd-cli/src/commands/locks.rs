//! `lockd locks` commands.

use anyhow::Result;
use clap::Subcommand;
use serde_json::{Value, json};

use crate::opts::DeviceOpts;
use crate::output::print_success;

use super::{Target, resolve_target, to_value};

#[derive(Subcommand, Debug)]
pub enum LocksCommand {
    /// Active locks, keyed by id
    List,
}

pub async fn cmd_locks(opts: &DeviceOpts, cmd: &LocksCommand) -> Result<()> {
    match cmd {
        LocksCommand::List => list(opts).await,
    }
}

async fn list(opts: &DeviceOpts) -> Result<()> {
    let (target, warnings) = resolve_target(opts).await?;
    let data = match target {
        Target::Daemon(mut client) => {
            let status = client.call("status", json!({})).await?;
            status.get("locks").cloned().unwrap_or(Value::Array(Vec::new()))
        }
        Target::Offline(host) => to_value(&host.kernel().authority().locks())?,
    };
    print_success(opts, data, warnings)
}
