//! `lockd unlock` command: PIN unlock of a single lock.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use crate::opts::DeviceOpts;
use crate::output::print_success;

use super::{resolve_target, to_value};

#[derive(Args, Debug)]
pub struct UnlockArgs {
    /// Lock to clear
    #[arg(long)]
    pub lock_id: String,

    /// PIN shown to the owner by the lender
    #[arg(long)]
    pub pin: String,
}

pub async fn cmd_unlock(opts: &DeviceOpts, args: &UnlockArgs) -> Result<()> {
    let (target, warnings) = resolve_target(opts).await?;
    let data = target
        .call(
            "unlock",
            json!({ "lock_id": args.lock_id, "pin": args.pin }),
            |host| async move {
                host.kernel().start()?;
                to_value(&host.kernel().pin_unlock(&args.lock_id, &args.pin)?)
            },
        )
        .await?;
    print_success(opts, data, warnings)
}
