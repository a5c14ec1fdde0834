use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use sessionkeep::util::{format_unix_ms, format_size};
use sessionkeep::{Engine, EngineConfig, Session, SessionMode, SystemHost};

/// Config from SK_* with `--root` on top.
pub fn load_config(root: Option<PathBuf>) -> EngineConfig {
    let cfg = EngineConfig::from_env();
    match root {
        Some(r) => cfg.with_root(r),
        None => cfg,
    }
}

pub fn open_engine(root: Option<PathBuf>) -> Result<Engine> {
    let cfg = load_config(root);
    let host = Arc::new(SystemHost::new(cfg.mount_timeout_ms));
    let root = cfg.root.clone();
    let engine = Engine::open(cfg, host).with_context(|| format!("open storage root {}", root.display()))?;
    Ok(engine)
}

/// Parse a mode argument; unknown strings are validation errors (exit 9).
pub fn parse_mode(s: &str) -> Result<SessionMode> {
    Ok(s.parse::<SessionMode>()?)
}

pub fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

/// One-line human summary of a session.
pub fn session_line(s: &Session) -> String {
    format!(
        "{}{} mode={} limit={} created={}",
        s.id,
        if s.active { " (active)" } else { "" },
        s.mode,
        format_size(s.size_limit_mb * sessionkeep::consts::MB),
        format_unix_ms(s.created_unix_ms)
    )
}
