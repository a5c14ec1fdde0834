use anyhow::Result;
use std::path::PathBuf;

use crate::util::{open_engine, parse_mode, print_json, session_line};

pub fn exec_copy(
    root: Option<PathBuf>,
    id: String,
    to_mode: Option<String>,
    size: Option<u64>,
    json: bool,
) -> Result<()> {
    let mode = to_mode.as_deref().map(parse_mode).transpose()?;
    let mut engine = open_engine(root)?;
    let s = engine.copy(&id, mode, size)?;
    if json {
        return print_json(&s);
    }
    println!("copied {} -> {}", id, session_line(&s));
    Ok(())
}

pub fn exec_convert(root: Option<PathBuf>, id: String, mode: String, size: Option<u64>, json: bool) -> Result<()> {
    let mode = parse_mode(&mode)?;
    let mut engine = open_engine(root)?;
    let s = engine.convert(&id, mode, size)?;
    if json {
        return print_json(&s);
    }
    println!("converted {}", session_line(&s));
    Ok(())
}

pub fn exec_resize(root: Option<PathBuf>, id: String, size_mb: u64, json: bool) -> Result<()> {
    let mut engine = open_engine(root)?;
    let s = engine.resize(&id, size_mb)?;
    if json {
        return print_json(&s);
    }
    println!("resized {}", session_line(&s));
    Ok(())
}
