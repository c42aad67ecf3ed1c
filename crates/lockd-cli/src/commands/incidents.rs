//! `lockd incidents` command.

use anyhow::Result;
use clap::{Args, ValueEnum};
use lockd_types::Severity;
use serde_json::json;

use crate::opts::DeviceOpts;
use crate::output::print_success;

use super::{resolve_target, to_value};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverityArg {
    Info,
    Medium,
    High,
    Critical,
}

impl From<SeverityArg> for Severity {
    fn from(arg: SeverityArg) -> Self {
        match arg {
            SeverityArg::Info => Severity::Info,
            SeverityArg::Medium => Severity::Medium,
            SeverityArg::High => Severity::High,
            SeverityArg::Critical => Severity::Critical,
        }
    }
}

#[derive(Args, Debug)]
pub struct IncidentsArgs {
    /// Lowest severity to show
    #[arg(long, value_enum, default_value_t = SeverityArg::Info)]
    pub min_severity: SeverityArg,
}

pub async fn cmd_incidents(opts: &DeviceOpts, args: &IncidentsArgs) -> Result<()> {
    let min = Severity::from(args.min_severity);
    let (target, warnings) = resolve_target(opts).await?;
    let data = target
        .call("incidents", json!({ "min_severity": min }), |host| async move {
            to_value(&host.kernel().incidents(min))
        })
        .await?;
    print_success(opts, data, warnings)
}
