use anyhow::Result;
use std::path::PathBuf;

use sessionkeep::util::format_size;

use crate::util::{open_engine, print_json};

pub fn exec(root: Option<PathBuf>, id: String, path: PathBuf, no_verify: bool, json: bool) -> Result<()> {
    let mut engine = open_engine(root)?;
    let verify = engine.config().verify_export && !no_verify;
    let report = engine.export(&id, &path, verify)?;
    if json {
        return print_json(&report);
    }
    println!(
        "exported {} -> {} ({}, data {}{})",
        id,
        report.path.display(),
        format_size(report.archive_bytes),
        format_size(report.header.used_bytes),
        if report.verified { ", verified" } else { "" }
    );
    Ok(())
}
