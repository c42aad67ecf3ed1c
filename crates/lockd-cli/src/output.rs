//! Human and JSON output.
//!
//! Human mode prints data to stdout and notices to stderr. JSON mode wraps
//! responses in `{ data, warnings? }`.

use std::io::Write;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::opts::DeviceOpts;

pub fn print_success(opts: &DeviceOpts, data: Value, mut warnings: Vec<String>) -> Result<()> {
    if opts.quiet {
        warnings.clear();
    }
    if opts.json || opts.pretty {
        let mut root = Map::new();
        root.insert("data".into(), data);
        if !warnings.is_empty() {
            root.insert("warnings".into(), warnings.into_iter().map(Value::String).collect());
        }
        let root = Value::Object(root);
        if opts.pretty {
            println!("{}", serde_json::to_string_pretty(&root)?);
        } else {
            println!("{}", serde_json::to_string(&root)?);
        }
        return Ok(());
    }

    let mut stderr = std::io::stderr();
    for w in warnings {
        writeln!(stderr, "notice: {w}")?;
    }
    match data {
        Value::String(s) => println!("{s}"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}
