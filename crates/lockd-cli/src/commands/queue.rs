//! `lockd queue` commands: inspect the offline command queue and feed it
//! commands that arrived out of band (SMS, QR code, sideloaded file).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use lockd_types::WireCommand;
use serde_json::{Value, json};

use crate::opts::DeviceOpts;
use crate::output::print_success;

use super::{Target, resolve_target, to_value};

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Commands waiting to run
    List,
    /// Finished commands, newest last
    History,
    /// Verify and enqueue signed commands from a JSON file
    Import(ImportArgs),
    /// Run every pending command now
    Drain,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// File holding one command object or an array of them
    pub file: PathBuf,
}

pub async fn cmd_queue(opts: &DeviceOpts, cmd: &QueueCommand) -> Result<()> {
    match cmd {
        QueueCommand::List => list(opts, false).await,
        QueueCommand::History => list(opts, true).await,
        QueueCommand::Import(args) => import(opts, args).await,
        QueueCommand::Drain => drain(opts).await,
    }
}

async fn list(opts: &DeviceOpts, history: bool) -> Result<()> {
    let (target, warnings) = resolve_target(opts).await?;
    let data = target
        .call("queue", json!({ "history": history }), |host| async move {
            let queue = host.kernel().queue();
            to_value(&if history { queue.history() } else { queue.pending() })
        })
        .await?;
    print_success(opts, data, warnings)
}

async fn drain(opts: &DeviceOpts) -> Result<()> {
    let (target, warnings) = resolve_target(opts).await?;
    let data = target
        .call("drain", json!({}), |host| async move {
            host.kernel().start()?;
            to_value(&host.kernel().executor().drain_all().await?)
        })
        .await?;
    print_success(opts, data, warnings)
}

pub fn read_commands(path: &Path) -> Result<Vec<WireCommand>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    let commands = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<WireCommand>, _>>(),
        single => serde_json::from_value(single).map(|c| vec![c]),
    };
    let commands = commands
        .with_context(|| format!("{} does not hold signed commands", path.display()))?;
    // Every field defaults on the wire, so any object parses.
    if commands.iter().any(|c| c.id.trim().is_empty() || c.kind.trim().is_empty()) {
        anyhow::bail!("{} does not hold signed commands (missing id or type)", path.display());
    }
    Ok(commands)
}

async fn import(opts: &DeviceOpts, args: &ImportArgs) -> Result<()> {
    let commands = read_commands(&args.file)?;
    let (target, mut warnings) = resolve_target(opts).await?;
    let mut results = Vec::with_capacity(commands.len());
    match target {
        Target::Daemon(mut client) => {
            for command in commands {
                let id = command.id.clone();
                match client.call("submit", to_value(&command)?).await {
                    Ok(processed) => results.push(json!({ "id": id, "processed": processed })),
                    Err(err) => {
                        warnings.push(format!("{id}: {err}"));
                        results.push(json!({ "id": id, "error": err.to_string() }));
                    }
                }
            }
        }
        Target::Offline(host) => {
            let kernel = host.kernel();
            kernel.start()?;
            for command in commands {
                let id = command.id.clone();
                match kernel.receive_command(command).await {
                    Ok((_, processed)) => results.push(json!({ "id": id, "processed": processed })),
                    Err(err) => {
                        warnings.push(format!("{id}: {err}"));
                        results.push(json!({ "id": id, "error": err.to_string() }));
                    }
                }
            }
        }
    }
    print_success(opts, Value::Array(results), warnings)
}
