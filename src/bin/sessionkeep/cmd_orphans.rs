use anyhow::Result;
use std::path::PathBuf;

use crate::util::{open_engine, print_json};

pub fn exec(root: Option<PathBuf>, json: bool) -> Result<()> {
    let mut engine = open_engine(root)?;
    let orphans = engine.orphans()?;
    if json {
        return print_json(&orphans);
    }
    if orphans.is_empty() {
        println!("no orphans");
        return Ok(());
    }
    for o in &orphans {
        let note = if o.in_progress { "  (in progress)" } else { "" };
        println!("{:<22} {}{}", o.kind.to_string(), o.path.display(), note);
    }
    if orphans.iter().any(|o| !o.in_progress) {
        println!("run `sessionkeep reclaim --yes` to delete them");
    }
    Ok(())
}

pub fn exec_reclaim(root: Option<PathBuf>, yes: bool, json: bool) -> Result<()> {
    let mut engine = open_engine(root)?;
    let removed = engine.reclaim(yes)?;
    if json {
        return print_json(&removed);
    }
    println!("reclaimed {} orphan(s)", removed.len());
    for o in &removed {
        println!("  {} {}", o.kind, o.path.display());
    }
    Ok(())
}
