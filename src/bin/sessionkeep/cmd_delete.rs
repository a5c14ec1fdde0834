use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use crate::util::{open_engine, print_json};

pub fn exec(root: Option<PathBuf>, id: String, json: bool) -> Result<()> {
    let mut engine = open_engine(root)?;
    engine.delete(&id)?;
    if json {
        return print_json(&json!({ "deleted": id }));
    }
    println!("deleted {}", id);
    Ok(())
}

pub fn exec_cleanup(root: Option<PathBuf>, days: u64, json: bool) -> Result<()> {
    let mut engine = open_engine(root)?;
    let report = engine.cleanup(days)?;
    if json {
        print_json(&report)?;
    } else {
        println!("removed {} session(s) older than {} days", report.removed.len(), days);
        for id in &report.removed {
            println!("  removed {}", id);
        }
        for (id, err) in &report.failed {
            println!("  failed  {}: {}", id, err);
        }
    }
    if !report.failed.is_empty() {
        anyhow::bail!("cleanup: {} session(s) could not be removed", report.failed.len());
    }
    Ok(())
}
