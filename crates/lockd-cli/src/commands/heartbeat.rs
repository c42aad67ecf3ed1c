//! `lockd heartbeat` command: one heartbeat cycle now.

use anyhow::Result;
use serde_json::json;

use crate::opts::DeviceOpts;
use crate::output::print_success;

use super::{resolve_target, to_value};

pub async fn cmd_heartbeat(opts: &DeviceOpts) -> Result<()> {
    let (target, warnings) = resolve_target(opts).await?;
    let data = target
        .call("heartbeat", json!({}), |host| async move {
            let kernel = host.kernel();
            kernel.start()?;
            let report = kernel.heartbeat_cycle().await?;
            let delivered = kernel.flush_alerts().await;
            let mut value = to_value(&report)?;
            if let Some(obj) = value.as_object_mut() {
                obj.insert("alerts_delivered".into(), json!(delivered));
            }
            Ok::<_, anyhow::Error>(value)
        })
        .await?;
    print_success(opts, data, warnings)
}
