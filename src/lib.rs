// Storage primitives
pub mod consts;
pub mod error;
pub mod lock;
pub mod util;

// Catalog: descriptors on disk + reconciliation
pub mod session;
pub mod registry;

// OS seam and the three storage backends
pub mod host;
pub mod backend;
pub mod tree;

pub mod config;
pub mod metrics;

// High-level API (lifecycle, conversion, archives)
pub mod engine;

pub use config::{EngineBuilder, EngineConfig};
pub use engine::{ArchiveHeader, CleanupReport, Engine, ExportReport, ImportOptions, SessionInfo, Status};
pub use error::{ErrorKind, Result, SessionError};
pub use host::{Capabilities, FsInfo, Host, Limitations, SystemHost, SystemRelease};
pub use registry::{Orphan, OrphanKind};
pub use session::{Session, SessionMode};
