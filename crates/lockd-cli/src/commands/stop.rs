//! `lockd stop` command.

use anyhow::Result;
use serde_json::json;

use crate::opts::DeviceOpts;
use crate::output::print_success;

use super::try_control_client;

pub async fn cmd_stop(opts: &DeviceOpts) -> Result<()> {
    let config = opts.host_config()?;
    let mut client = try_control_client(opts, &config)
        .await
        .ok_or_else(|| anyhow::anyhow!("No daemon running. Nothing to shut down."))?;
    client.call("shutdown", json!({})).await?;
    print_success(opts, json!({ "stopped": true }), vec![])
}
