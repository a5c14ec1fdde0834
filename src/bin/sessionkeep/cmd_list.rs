use anyhow::Result;
use std::path::PathBuf;

use sessionkeep::util::{format_size, format_unix_ms};

use crate::util::{open_engine, print_json, session_line};

pub fn exec(root: Option<PathBuf>, json: bool) -> Result<()> {
    let mut engine = open_engine(root)?;
    let rows = engine.list()?;
    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("no sessions in {}", engine.root().display());
        return Ok(());
    }
    println!(
        "{:<6} {:<10} {:>10} {:<22} {:<20} {:<24} {}",
        "ID", "MODE", "LIMIT", "USED", "CREATED", "SYSTEM", "ACTIVE"
    );
    for r in &rows {
        let s = &r.session;
        let system = [&s.system.version, &s.system.edition, &s.system.union]
            .iter()
            .map(|v| v.as_deref().unwrap_or("?"))
            .collect::<Vec<_>>()
            .join("/");
        println!(
            "{:<6} {:<10} {:>10} {:<22} {:<20} {:<24} {}",
            s.id,
            s.mode,
            format_size(s.size_limit_mb * sessionkeep::consts::MB),
            r.size_display,
            format_unix_ms(s.created_unix_ms),
            system,
            if s.active { "*" } else { "" }
        );
    }
    Ok(())
}

pub fn exec_active(root: Option<PathBuf>, json: bool) -> Result<()> {
    let mut engine = open_engine(root)?;
    let active = engine.active()?;
    if json {
        return print_json(&active);
    }
    match active {
        Some(s) => println!("{}", session_line(&s)),
        None => println!("no active session"),
    }
    Ok(())
}
