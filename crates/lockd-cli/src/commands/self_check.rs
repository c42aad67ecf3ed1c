//! `lockd self-check` command: capability check, recovering if degraded.

use anyhow::Result;
use serde_json::json;

use crate::opts::DeviceOpts;
use crate::output::print_success;

use super::resolve_target;

pub async fn cmd_self_check(opts: &DeviceOpts) -> Result<()> {
    let (target, warnings) = resolve_target(opts).await?;
    let data = target
        .call("self-check", json!({}), |host| async move {
            host.kernel().start()?;
            let outcome = host.kernel().recovery().check_and_recover().await?;
            Ok::<_, anyhow::Error>(json!({ "outcome": format!("{outcome:?}") }))
        })
        .await?;
    print_success(opts, data, warnings)
}
