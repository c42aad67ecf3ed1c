mod commands;
mod opts;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::incidents::IncidentsArgs;
use commands::locks::LocksCommand;
use commands::queue::QueueCommand;
use commands::unlock::UnlockArgs;
use opts::DeviceOpts;

#[derive(Parser, Debug)]
#[command(name = "lockd", version, about = "Device lock enforcement agent")]
struct Cli {
    #[command(flatten)]
    opts: DeviceOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the enforcement daemon
    Run,

    /// Stop a running daemon
    Stop,

    /// Show lock state, queue depth and heartbeat health
    Status,

    /// Active locks
    #[command(subcommand)]
    Locks(LocksCommand),

    /// Clear a lock with its PIN
    Unlock(UnlockArgs),

    /// Offline command queue
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Run one heartbeat now
    Heartbeat,

    /// Check the management capability and recover it if degraded
    SelfCheck,

    /// Show the audit trail
    Incidents(IncidentsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let opts = &cli.opts;

    match &cli.command {
        Command::Run => commands::run::cmd_run(opts).await,
        Command::Stop => commands::stop::cmd_stop(opts).await,
        Command::Status => commands::status::cmd_status(opts).await,
        Command::Locks(cmd) => commands::locks::cmd_locks(opts, cmd).await,
        Command::Unlock(args) => commands::unlock::cmd_unlock(opts, args).await,
        Command::Queue(cmd) => commands::queue::cmd_queue(opts, cmd).await,
        Command::Heartbeat => commands::heartbeat::cmd_heartbeat(opts).await,
        Command::SelfCheck => commands::self_check::cmd_self_check(opts).await,
        Command::Incidents(args) => commands::incidents::cmd_incidents(opts, args).await,
    }
}
