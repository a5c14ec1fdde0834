use anyhow::Result;
use std::fs;
use std::sync::Arc;

use sessionkeep::util::now_unix_ms;
use sessionkeep::{ErrorKind, SessionMode};

mod common;
use common::{open_engine, unique_root, FakeHost};

#[test]
fn create_activate_status_native() -> Result<()> {
    let base = unique_root("native-activate");
    let host = Arc::new(FakeHost::new());
    let mut engine = open_engine(&base, host)?;
    assert!(!engine.status()?.found);

    let s = engine.create(SessionMode::Native, None, None)?;
    assert_eq!(s.id, "1");
    assert_eq!(s.size_limit_mb, 64);
    assert!(!s.active);
    assert!(s.path.is_dir());

    let activated = engine.activate(&s.id)?;
    assert!(activated.active);

    let st = engine.status()?;
    assert_eq!(st.active.as_deref(), Some("1"));
    assert_eq!(st.sessions, 1);
    assert!(st.writable);
    assert!(st.orphans.is_empty());

    // a fresh engine sees the same pointer on disk
    let mut reopened = open_engine(&base, Arc::new(FakeHost::new()))?;
    assert!(reopened.status()?.found);
    assert_eq!(reopened.active()?.map(|s| s.id), Some("1".to_string()));

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn activate_twice_is_idempotent_and_single_active() -> Result<()> {
    let base = unique_root("activate-twice");
    let host = Arc::new(FakeHost::new());
    let mut engine = open_engine(&base, host.clone())?;

    let a = engine.create(SessionMode::Raw, Some(16), None)?;
    let b = engine.create(SessionMode::Dynfilefs, Some(32), None)?;

    engine.activate(&a.id)?;
    engine.activate(&a.id)?;
    assert_eq!(host.mount_count(), 1);
    let active: Vec<_> = engine.list()?.into_iter().filter(|r| r.session.active).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session.id, a.id);

    // switching moves the single mount over
    engine.activate(&b.id)?;
    assert_eq!(host.mount_count(), 1);
    let rows = engine.list()?;
    assert_eq!(rows.iter().filter(|r| r.session.active).count(), 1);
    assert!(rows.iter().any(|r| r.session.id == b.id && r.session.active));
    assert!(rows
        .iter()
        .any(|r| r.session.id == b.id && r.size_display.contains('/')));

    assert_eq!(engine.deactivate()?, Some(b.id.clone()));
    assert_eq!(host.mount_count(), 0);
    assert!(engine.active()?.is_none());
    assert_eq!(engine.deactivate()?, None);

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn data_written_while_active_survives_reactivation() -> Result<()> {
    let base = unique_root("raw-persist");
    let host = Arc::new(FakeHost::new());
    let mut engine = open_engine(&base, host)?;

    let s = engine.create(SessionMode::Raw, Some(16), None)?;
    engine.activate(&s.id)?;
    let mp = engine.config().active_mountpoint();
    fs::write(mp.join("notes.txt"), b"kept across reboots")?;
    engine.deactivate()?;
    assert!(!mp.join("notes.txt").exists());

    engine.activate(&s.id)?;
    assert_eq!(fs::read(mp.join("notes.txt"))?, b"kept across reboots");
    engine.deactivate()?;

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn fat32_root_accepts_raw_but_not_native() -> Result<()> {
    let base = unique_root("fat32");
    let host = Arc::new(FakeHost::new().with_fs("vfat"));
    let mut engine = open_engine(&base, host)?;

    let caps = engine.info()?;
    assert!(!caps.supports(SessionMode::Native));
    assert_eq!(caps.limitations.max_file_mb, Some(4096));

    let raw = engine.create(SessionMode::Raw, Some(500), None)?;
    assert_eq!(raw.mode, SessionMode::Raw);
    assert_eq!(fs::metadata(raw.path.join("changes.img"))?.len(), 500 * 1024 * 1024);

    let err = engine.create(SessionMode::Native, Some(500), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapabilityUnsupported);
    assert_eq!(err.exit_code(), 4);

    let err = engine.create(SessionMode::Raw, Some(5000), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapabilityUnsupported);

    // failed creates leave nothing behind
    assert_eq!(engine.list()?.len(), 1);
    assert!(engine.orphans()?.is_empty());

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn create_fails_cleanly_without_space() -> Result<()> {
    let base = unique_root("no-space");
    let host = Arc::new(FakeHost::new().with_free_mb(10));
    let mut engine = open_engine(&base, host)?;

    let err = engine.create(SessionMode::Raw, Some(100), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientSpace);
    assert!(engine.list()?.is_empty());
    assert!(engine.orphans()?.is_empty());

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn delete_refuses_active_and_unknown() -> Result<()> {
    let base = unique_root("delete");
    let host = Arc::new(FakeHost::new());
    let mut engine = open_engine(&base, host)?;

    let a = engine.create(SessionMode::Native, None, None)?;
    let b = engine.create(SessionMode::Raw, Some(8), None)?;
    engine.activate(&a.id)?;

    let err = engine.delete(&a.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionActive);
    assert_eq!(engine.delete("42").unwrap_err().kind(), ErrorKind::NotFound);

    engine.delete(&b.id)?;
    assert!(!b.path.exists());
    assert_eq!(engine.get(&b.id).unwrap_err().kind(), ErrorKind::NotFound);

    // ids are never reused
    let c = engine.create(SessionMode::Native, None, None)?;
    assert_eq!(c.id, "3");

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn explicit_ids_are_validated() -> Result<()> {
    let base = unique_root("ids");
    let host = Arc::new(FakeHost::new());
    let mut engine = open_engine(&base, host)?;

    let s = engine.create(SessionMode::Native, None, Some("7"))?;
    assert_eq!(s.id, "7");
    assert_eq!(engine.create(SessionMode::Native, None, Some("7")).unwrap_err().exit_code(), 9);
    assert_eq!(engine.create(SessionMode::Native, None, Some("../x")).unwrap_err().kind(), ErrorKind::Invalid);
    assert_eq!(engine.create(SessionMode::Native, Some(0), None).unwrap_err().kind(), ErrorKind::Invalid);

    let next = engine.create(SessionMode::Native, None, None)?;
    assert_eq!(next.id, "8");

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn cleanup_continues_past_a_busy_session() -> Result<()> {
    let base = unique_root("cleanup");
    let host = Arc::new(FakeHost::new());
    let mut engine = open_engine(&base, host.clone())?;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(engine.create(SessionMode::Raw, Some(8), None)?.id);
    }
    let keep = engine.create(SessionMode::Native, None, None)?;
    engine.activate(&keep.id)?;

    // #3 is held open elsewhere
    let third = engine.get(&ids[2])?;
    let scratch = engine.scratch_mountpoint(&third);
    host.set_busy(&scratch);

    // nothing here is 30 days old yet
    let report = engine.cleanup(30)?;
    assert!(report.removed.is_empty() && report.failed.is_empty());

    let report = engine.cleanup_created_before(now_unix_ms() + 60_000)?;
    assert_eq!(report.removed.len(), 4);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, ids[2]);

    let remaining: Vec<String> = engine.list()?.into_iter().map(|r| r.session.id).collect();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&ids[2]));
    assert!(remaining.contains(&keep.id));

    host.clear_busy(&scratch);
    engine.delete(&ids[2])?;

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn failed_mount_after_switch_leaves_nothing_active() -> Result<()> {
    let base = unique_root("activate-fails");
    let host = Arc::new(FakeHost::new());
    let mut engine = open_engine(&base, host.clone())?;

    let a = engine.create(SessionMode::Raw, Some(16), None)?;
    let b = engine.create(SessionMode::Raw, Some(16), None)?;
    engine.activate(&a.id)?;

    // b's image is present but holds no filesystem: mount fails after a is down
    fs::remove_dir_all(b.path.join("changes.img.fs"))?;
    let err = engine.activate(&b.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);

    assert!(engine.active()?.is_none());
    assert!(engine.status()?.active.is_none());
    assert_eq!(host.mount_count(), 0);
    assert!(engine.list()?.iter().all(|r| !r.session.active));

    // the previous session is intact and can come back
    engine.activate(&a.id)?;
    assert_eq!(engine.active()?.map(|s| s.id), Some(a.id.clone()));

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn sessions_record_the_release_they_were_created_on() -> Result<()> {
    let base = unique_root("release");
    let host = Arc::new(FakeHost::new().with_release("4.1", "XFCE", "overlayfs"));
    let mut engine = open_engine(&base, host)?;

    let s = engine.create(SessionMode::Native, None, None)?;
    assert_eq!(s.system.version.as_deref(), Some("4.1"));
    assert_eq!(s.system.edition.as_deref(), Some("XFCE"));
    assert_eq!(s.system.union.as_deref(), Some("overlayfs"));

    // persisted in the descriptor and reported by list
    let mut reopened = open_engine(&base, Arc::new(FakeHost::new()))?;
    let rows = reopened.list()?;
    assert_eq!(rows[0].session.system, s.system);
    let json = serde_json::to_value(&rows[0])?;
    assert_eq!(json["edition"], "XFCE");
    assert_eq!(json["union"], "overlayfs");

    // conversion keeps the origin
    let raw = reopened.convert(&s.id, SessionMode::Raw, Some(16))?;
    assert_eq!(raw.system, s.system);

    let _ = fs::remove_dir_all(&base);
    Ok(())
}
