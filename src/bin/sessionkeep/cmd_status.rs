use anyhow::Result;
use std::path::PathBuf;

use crate::util::{open_engine, print_json};

pub fn exec(root: Option<PathBuf>, json: bool) -> Result<()> {
    let mut engine = open_engine(root)?;
    let st = engine.status()?;
    if json {
        return print_json(&st);
    }

    println!("Storage root {}", st.root.display());
    println!("  found          = {}", st.found);
    println!("  writable       = {}", st.writable);
    match &st.filesystem {
        Some(fs) => println!(
            "  filesystem     = {} on {} ({}){}",
            fs.fs_type,
            fs.device,
            fs.mountpoint.display(),
            if fs.read_only { " read-only" } else { "" }
        ),
        None => println!("  filesystem     = unknown"),
    }
    println!("  sessions       = {}", st.sessions);
    match (&st.active, &st.active_mountpoint) {
        (Some(id), Some(mp)) => println!("  active         = {} at {}", id, mp.display()),
        _ => println!("  active         = none"),
    }
    println!("  orphans        = {}", st.orphans.len());
    for o in &st.orphans {
        println!("    {} {}", o.kind, o.path.display());
    }

    let ms = &st.metrics;
    println!("Metrics snapshot:");
    println!("  sessions_created      = {}", ms.sessions_created);
    println!("  sessions_deleted      = {}", ms.sessions_deleted);
    println!("  activations           = {}", ms.activations);
    println!("  sessions_converted    = {}", ms.sessions_converted);
    println!("  sessions_copied       = {}", ms.sessions_copied);
    println!("  tree_bytes_copied     = {}", ms.tree_bytes_copied);
    println!("  exports/imports       = {}/{}", ms.exports, ms.imports);
    println!("  archive_bytes_written = {}", ms.archive_bytes_written);
    println!("  archive_bytes_read    = {}", ms.archive_bytes_read);
    println!("  avg_export_bytes      = {:.0}", ms.avg_export_bytes());
    Ok(())
}

pub fn exec_info(root: Option<PathBuf>, json: bool) -> Result<()> {
    let engine = open_engine(root)?;
    let caps = engine.info()?;
    if json {
        return print_json(&caps);
    }
    let fs = &caps.filesystem;
    println!("Filesystem {} ({})", fs.fs_type, fs.device);
    println!("  mountpoint     = {}", fs.mountpoint.display());
    println!("  read_only      = {}", fs.read_only);
    println!("  dynfilefs      = {}", if caps.dynfilefs_available { "installed" } else { "missing" });
    let modes: Vec<&str> = caps.modes.iter().map(|m| m.as_str()).collect();
    println!(
        "  modes          = {}",
        if modes.is_empty() { "none".to_string() } else { modes.join(", ") }
    );
    let lim = &caps.limitations;
    if let Some(max) = lim.max_file_mb {
        println!("  max_file_mb    = {}", max);
    }
    if lim.no_posix {
        println!("  no POSIX permissions or ownership");
    }
    if lim.case_insensitive {
        println!("  case-insensitive names");
    }
    Ok(())
}
