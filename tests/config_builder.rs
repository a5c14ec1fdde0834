use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use sessionkeep::{Engine, EngineBuilder, EngineConfig, SessionMode};

mod common;
use common::{unique_root, FakeHost};

// The only test in this binary that touches SK_* variables.
#[test]
fn env_then_builder_overrides() -> Result<()> {
    let base = unique_root("env");
    std::env::set_var("SK_ROOT", base.join("root"));
    std::env::set_var("SK_WORK_DIR", base.join("work"));
    std::env::set_var("SK_DEFAULT_SIZE_MB", "256");
    std::env::set_var("SK_ZSTD_LEVEL", "9");
    std::env::set_var("SK_VERIFY_EXPORT", "0");
    std::env::set_var("SK_PREALLOCATE_RAW", "false");
    std::env::set_var("SK_DYNFILEFS_SPLIT_MB", "not-a-number");

    let cfg = EngineConfig::from_env();
    assert_eq!(cfg.root, base.join("root"));
    assert_eq!(cfg.work_dir, base.join("work"));
    assert_eq!(cfg.active_mountpoint(), base.join("work").join("active"));
    assert_eq!(cfg.default_size_mb, 256);
    assert_eq!(cfg.zstd_level, 9);
    assert!(!cfg.verify_export);
    assert!(!cfg.preallocate_raw);
    // unparsable values keep the default
    assert_eq!(cfg.dynfilefs_split_mb, 4000);

    let built = EngineBuilder::new()
        .default_size_mb(32)
        .active_mount(base.join("live"))
        .build();
    assert_eq!(built.root, base.join("root"));
    assert_eq!(built.default_size_mb, 32);
    assert_eq!(built.active_mountpoint(), base.join("live"));

    let clean = EngineBuilder::from_default().build();
    assert_eq!(clean.default_size_mb, 1000);
    assert!(clean.verify_export);
    assert!(clean.to_string().contains("default_size_mb: 1000"));

    for k in [
        "SK_ROOT",
        "SK_WORK_DIR",
        "SK_DEFAULT_SIZE_MB",
        "SK_ZSTD_LEVEL",
        "SK_VERIFY_EXPORT",
        "SK_PREALLOCATE_RAW",
        "SK_DYNFILEFS_SPLIT_MB",
    ] {
        std::env::remove_var(k);
    }

    // default size flows into create
    let mut engine = Engine::open(built.with_preallocate_raw(false), Arc::new(FakeHost::new()))?;
    let s = engine.create(SessionMode::Raw, None, None)?;
    assert_eq!(s.size_limit_mb, 32);
    assert_eq!(fs::metadata(s.path.join("changes.img"))?.len(), 32 * 1024 * 1024);

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn open_creates_missing_root_and_work_dir() -> Result<()> {
    let base = unique_root("open");
    let cfg = EngineBuilder::from_default()
        .root(base.join("a/b/root"))
        .work_dir(base.join("scratch"))
        .build();
    let mut engine = Engine::open(cfg, Arc::new(FakeHost::new()))?;
    assert!(base.join("a/b/root").is_dir());
    assert!(base.join("scratch").is_dir());
    let st = engine.status()?;
    assert!(!st.found);
    assert_eq!(st.root, PathBuf::from(base.join("a/b/root")));
    assert_eq!(st.filesystem.map(|f| f.fs_type), Some("ext4".to_string()));

    let _ = fs::remove_dir_all(&base);
    Ok(())
}
