use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use crate::util::{open_engine, print_json, session_line};

pub fn exec(root: Option<PathBuf>, id: String, json: bool) -> Result<()> {
    let mut engine = open_engine(root)?;
    let s = engine.activate(&id)?;
    let mountpoint = engine.config().active_mountpoint();
    if json {
        return print_json(&json!({ "session": s, "mountpoint": mountpoint }));
    }
    println!("activated {}", session_line(&s));
    println!("mounted at {}", mountpoint.display());
    Ok(())
}

pub fn exec_deactivate(root: Option<PathBuf>, json: bool) -> Result<()> {
    let mut engine = open_engine(root)?;
    let id = engine.deactivate()?;
    if json {
        return print_json(&json!({ "deactivated": id }));
    }
    match id {
        Some(id) => println!("deactivated {}", id),
        None => println!("no active session"),
    }
    Ok(())
}
