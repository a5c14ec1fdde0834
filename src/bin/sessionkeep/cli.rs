use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Persistent session manager for live systems
#[derive(Parser, Debug)]
#[command(name = "sessionkeep", version, about = "Manage persistent live-system sessions", arg_required_else_help = true)]
pub struct Cli {
    /// Storage root (overrides SK_ROOT)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Machine-readable output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// List sessions with their usage
    List,
    /// Storage root health, active session, orphans and counters
    Status,
    /// Filesystem of the storage root and the modes it can hold
    Info,
    /// Print the active session
    Active,
    /// Create a new, inactive session
    Create {
        /// native | dynfilefs | raw (default: first mode the root supports)
        mode: Option<String>,
        /// Size limit in MB (default SK_DEFAULT_SIZE_MB)
        size_mb: Option<u64>,
        /// Explicit decimal id instead of the next free one
        #[arg(long)]
        id: Option<String>,
    },
    /// Make a session the active one
    Activate { id: String },
    /// Unmount the active session
    Deactivate,
    /// Delete an inactive session
    Delete { id: String },
    /// Delete inactive sessions older than N days
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: u64,
    },
    /// Export a session to <PATH> (directory or file name) as .tar.zst
    Export {
        id: String,
        path: PathBuf,
        /// Skip re-reading the archive after writing it
        #[arg(long)]
        no_verify: bool,
    },
    /// Import a .tar.zst archive as a new session
    Import {
        path: PathBuf,
        /// Import as this mode regardless of the archived one
        #[arg(long)]
        force_mode: Option<String>,
        /// Fall back to a supported container mode when needed
        #[arg(long)]
        auto_convert: bool,
    },
    /// Copy a session into a new one
    Copy {
        id: String,
        #[arg(long)]
        to_mode: Option<String>,
        #[arg(long)]
        size: Option<u64>,
    },
    /// Convert a session to another mode in place (same id)
    Convert {
        id: String,
        mode: String,
        #[arg(long)]
        size: Option<u64>,
    },
    /// Change the size limit of an inactive session
    Resize { id: String, size_mb: u64 },
    /// List leftovers of interrupted operations
    Orphans,
    /// Delete every orphan
    Reclaim {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}
