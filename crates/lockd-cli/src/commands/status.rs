//! `lockd status` command.

use anyhow::Result;
use serde_json::json;

use crate::opts::DeviceOpts;
use crate::output::print_success;

use super::{resolve_target, to_value};

pub async fn cmd_status(opts: &DeviceOpts) -> Result<()> {
    let (target, warnings) = resolve_target(opts).await?;
    let data = target
        .call("status", json!({}), |host| async move { to_value(&host.kernel().status()) })
        .await?;
    print_success(opts, data, warnings)
}
