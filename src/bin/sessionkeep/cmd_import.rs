use anyhow::Result;
use std::path::PathBuf;

use sessionkeep::ImportOptions;

use crate::util::{open_engine, parse_mode, print_json, session_line};

pub fn exec(
    root: Option<PathBuf>,
    path: PathBuf,
    force_mode: Option<String>,
    auto_convert: bool,
    json: bool,
) -> Result<()> {
    let force_mode = force_mode.as_deref().map(parse_mode).transpose()?;
    let mut engine = open_engine(root)?;
    let s = engine.import(
        &path,
        ImportOptions {
            force_mode,
            auto_convert,
        },
    )?;
    if json {
        return print_json(&s);
    }
    println!("imported {} as {}", path.display(), session_line(&s));
    Ok(())
}
