use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};
use log::error;

use sessionkeep::SessionError;

mod cli;
mod util;
mod cmd_activate;
mod cmd_convert;
mod cmd_create;
mod cmd_delete;
mod cmd_export;
mod cmd_import;
mod cmd_list;
mod cmd_orphans;
mod cmd_status;

fn init_logger() {
    // RUST_LOG overrides, e.g. RUST_LOG=debug shows host commands
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn exit_code(e: &anyhow::Error) -> i32 {
    e.chain()
        .find_map(|c| c.downcast_ref::<SessionError>())
        .map(SessionError::exit_code)
        .unwrap_or(1)
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    let root = cli.root;
    let json = cli.json;
    match cli.cmd {
        cli::Cmd::List => cmd_list::exec(root, json),
        cli::Cmd::Active => cmd_list::exec_active(root, json),

        cli::Cmd::Status => cmd_status::exec(root, json),
        cli::Cmd::Info => cmd_status::exec_info(root, json),

        cli::Cmd::Create { mode, size_mb, id } => cmd_create::exec(root, mode, size_mb, id, json),

        cli::Cmd::Activate { id } => cmd_activate::exec(root, id, json),
        cli::Cmd::Deactivate => cmd_activate::exec_deactivate(root, json),

        cli::Cmd::Delete { id } => cmd_delete::exec(root, id, json),
        cli::Cmd::Cleanup { days } => cmd_delete::exec_cleanup(root, days, json),

        cli::Cmd::Export { id, path, no_verify } => cmd_export::exec(root, id, path, no_verify, json),
        cli::Cmd::Import {
            path,
            force_mode,
            auto_convert,
        } => cmd_import::exec(root, path, force_mode, auto_convert, json),

        cli::Cmd::Copy { id, to_mode, size } => cmd_convert::exec_copy(root, id, to_mode, size, json),
        cli::Cmd::Convert { id, mode, size } => cmd_convert::exec_convert(root, id, mode, size, json),
        cli::Cmd::Resize { id, size_mb } => cmd_convert::exec_resize(root, id, size_mb, json),

        cli::Cmd::Orphans => cmd_orphans::exec(root, json),
        cli::Cmd::Reclaim { yes } => cmd_orphans::exec_reclaim(root, yes, json),
    }
}
