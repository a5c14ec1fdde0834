use anyhow::{anyhow, Result};
use std::path::PathBuf;

use sessionkeep::SessionMode;

use crate::util::{open_engine, parse_mode, print_json, session_line};

pub fn exec(
    root: Option<PathBuf>,
    mode: Option<String>,
    size_mb: Option<u64>,
    id: Option<String>,
    json: bool,
) -> Result<()> {
    let mut engine = open_engine(root)?;
    let mode = match mode {
        Some(m) => parse_mode(&m)?,
        None => {
            let caps = engine.info()?;
            SessionMode::ALL
                .into_iter()
                .find(|m| caps.supports(*m))
                .ok_or_else(|| anyhow!("{} cannot hold sessions ({})", engine.root().display(), caps.filesystem.fs_type))?
        }
    };
    let s = engine.create(mode, size_mb, id.as_deref())?;
    if json {
        return print_json(&s);
    }
    println!("created {}", session_line(&s));
    Ok(())
}
