use anyhow::Result;
use std::fs;
use std::sync::Arc;

use sessionkeep::engine::archive::{read_header, verify_archive};
use sessionkeep::{ErrorKind, ImportOptions, OrphanKind, SessionMode};

mod common;
use common::{open_engine, read_tree, unique_root, write_tree, FakeHost};

fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = oorandom::Rand64::new(seed as u128);
    (0..len).map(|_| rng.rand_u64() as u8).collect()
}

#[test]
fn export_import_roundtrip_native() -> Result<()> {
    let base = unique_root("archive-native");
    let host = Arc::new(FakeHost::new());
    let mut engine = open_engine(&base, host)?;

    let s = engine.create(SessionMode::Native, Some(300), None)?;
    write_tree(
        &s.path,
        &[
            ("etc/motd", b"welcome\n"),
            ("home/live/Desktop/todo.txt", b"- ship it\n"),
            ("opt/data.bin", &noise(64 * 1024, 7)),
        ],
    )?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::os::unix::fs::symlink("../etc/motd", s.path.join("home/motd"))?;
        fs::set_permissions(s.path.join("etc/motd"), fs::Permissions::from_mode(0o600))?;
    }

    let out_dir = base.join("exports");
    fs::create_dir_all(&out_dir)?;
    let report = engine.export(&s.id, &out_dir, true)?;
    assert!(report.verified);
    assert!(report.path.starts_with(&out_dir));
    assert!(report.path.to_string_lossy().ends_with(".tar.zst"));
    assert_eq!(report.archive_bytes, fs::metadata(&report.path)?.len());
    assert_eq!(report.header.original_mode, SessionMode::Native);
    assert_eq!(report.header.original_size_limit_mb, 300);
    assert_eq!(report.header.session_id, s.id);

    let header = read_header(&report.path)?;
    assert_eq!(header, report.header);
    assert_eq!(verify_archive(&report.path)?, header);
    // no partial file next to the archive
    assert_eq!(fs::read_dir(&out_dir)?.count(), 1);

    let imported = engine.import(&report.path, ImportOptions::default())?;
    assert_ne!(imported.id, s.id);
    assert_eq!(imported.mode, SessionMode::Native);
    assert_eq!(imported.size_limit_mb, 300);
    assert_eq!(read_tree(&imported.path)?, read_tree(&s.path)?);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(
            fs::read_link(imported.path.join("home/motd"))?,
            std::path::PathBuf::from("../etc/motd")
        );
        let mode = fs::metadata(imported.path.join("etc/motd"))?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn export_import_roundtrip_raw_through_mounts() -> Result<()> {
    let base = unique_root("archive-raw");
    let host = Arc::new(FakeHost::new());
    let mut engine = open_engine(&base, host.clone())?;

    let s = engine.create(SessionMode::Raw, Some(24), None)?;
    engine.activate(&s.id)?;
    let mp = engine.config().active_mountpoint();
    write_tree(&mp, &[("root/.profile", b"PATH=/usr/bin\n"), ("srv/a.bin", &noise(10_000, 3))])?;
    let expected = read_tree(&mp)?;

    // exporting the active session reads its live mountpoint
    let target = base.join("backup");
    let report = engine.export(&s.id, &target, false)?;
    assert_eq!(report.path, base.join("backup.tar.zst"));
    assert!(!report.verified);
    assert_eq!(host.mount_count(), 1);
    engine.deactivate()?;

    let imported = engine.import(&report.path, ImportOptions::default())?;
    assert_eq!(imported.mode, SessionMode::Raw);
    assert_eq!(imported.size_limit_mb, 24);
    assert_eq!(host.mount_count(), 0);

    engine.activate(&imported.id)?;
    assert_eq!(read_tree(&mp)?, expected);
    engine.deactivate()?;

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn corrupt_archives_are_rejected() -> Result<()> {
    let base = unique_root("archive-corrupt");
    let host = Arc::new(FakeHost::new());
    let mut engine = open_engine(&base, host)?;

    let garbage = base.join("garbage.tar.zst");
    fs::write(&garbage, b"definitely not zstd")?;
    let err = engine.import(&garbage, ImportOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchiveCorrupt);
    assert_eq!(err.exit_code(), 7);

    // valid header, data cut short
    let s = engine.create(SessionMode::Native, None, None)?;
    write_tree(&s.path, &[("big.bin", &noise(512 * 1024, 11))])?;
    let report = engine.export(&s.id, &base.join("full"), true)?;
    let bytes = fs::read(&report.path)?;
    let truncated = base.join("truncated.tar.zst");
    fs::write(&truncated, &bytes[..bytes.len() / 2])?;

    assert_eq!(read_header(&truncated)?.session_id, s.id);
    assert_eq!(verify_archive(&truncated).unwrap_err().kind(), ErrorKind::ArchiveCorrupt);
    let err = engine.import(&truncated, ImportOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchiveCorrupt);

    // the half-built session was discarded
    let ids: Vec<String> = engine.list()?.into_iter().map(|r| r.session.id).collect();
    assert_eq!(ids, vec![s.id.clone()]);
    assert!(engine.orphans()?.is_empty());

    let missing = engine.import(&base.join("nope.tar.zst"), ImportOptions::default()).unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::IoFailure);

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn native_archive_on_fat_root_needs_a_mode_choice() -> Result<()> {
    let src_base = unique_root("archive-src");
    let mut src = open_engine(&src_base, Arc::new(FakeHost::new()))?;
    let s = src.create(SessionMode::Native, Some(200), None)?;
    write_tree(&s.path, &[("etc/issue", b"MiniOS\n")])?;
    let report = src.export(&s.id, &src_base.join("s"), true)?;

    let dst_base = unique_root("archive-fat");
    let mut dst = open_engine(&dst_base, Arc::new(FakeHost::new().with_fs("vfat")))?;

    let err = dst.import(&report.path, ImportOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModeUnsupported);
    assert_eq!(err.exit_code(), 8);
    assert!(dst.list()?.is_empty());

    let forced = ImportOptions {
        force_mode: Some(SessionMode::Native),
        auto_convert: false,
    };
    assert_eq!(
        dst.import(&report.path, forced).unwrap_err().kind(),
        ErrorKind::CapabilityUnsupported
    );

    let auto = ImportOptions {
        force_mode: None,
        auto_convert: true,
    };
    let imported = dst.import(&report.path, auto)?;
    assert_eq!(imported.mode, SessionMode::Raw);
    assert_eq!(imported.size_limit_mb, 200);
    dst.activate(&imported.id)?;
    let mp = dst.config().active_mountpoint();
    assert_eq!(fs::read(mp.join("etc/issue"))?, b"MiniOS\n");
    dst.deactivate()?;

    let dyn_opts = ImportOptions {
        force_mode: Some(SessionMode::Dynfilefs),
        auto_convert: false,
    };
    assert_eq!(dst.import(&report.path, dyn_opts)?.mode, SessionMode::Dynfilefs);

    let _ = fs::remove_dir_all(&src_base);
    let _ = fs::remove_dir_all(&dst_base);
    Ok(())
}

#[test]
fn export_of_unknown_session_writes_nothing() -> Result<()> {
    let base = unique_root("archive-missing");
    let mut engine = open_engine(&base, Arc::new(FakeHost::new()))?;
    let out = base.join("x");
    let err = engine.export("5", &out, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!base.join("x.tar.zst").exists());
    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn import_failing_after_extraction_never_registers_a_session() -> Result<()> {
    let base = unique_root("archive-unmount-fails");
    let host = Arc::new(FakeHost::new());
    let mut engine = open_engine(&base, host.clone())?;

    let s = engine.create(SessionMode::Raw, Some(16), None)?;
    engine.activate(&s.id)?;
    write_tree(&engine.config().active_mountpoint(), &[("etc/hostname", b"minios\n")])?;
    engine.deactivate()?;
    let report = engine.export(&s.id, &base.join("raw"), true)?;

    // the next id is 2; its scratch mount cannot be released after unpacking
    let scratch = engine.config().work_dir.join("2.mnt");
    host.busy_once_mounted(&scratch);
    let err = engine.import(&report.path, ImportOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceBusy);

    let ids: Vec<String> = engine.list()?.into_iter().map(|r| r.session.id).collect();
    assert_eq!(ids, vec![s.id.clone()]);
    assert!(!engine.root().join("2.session").exists());

    // the storage is left as a plain orphan, not a half-restored session
    let orphans = engine.orphans()?;
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].kind, OrphanKind::UnreferencedStorage);
    assert_eq!(orphans[0].id.as_deref(), Some("2"));

    let _ = fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn archives_carry_the_release_of_their_session() -> Result<()> {
    let src_base = unique_root("archive-release-src");
    let src_host = Arc::new(FakeHost::new().with_release("4.0", "XFCE", "aufs"));
    let mut src = open_engine(&src_base, src_host)?;
    let s = src.create(SessionMode::Native, None, None)?;
    write_tree(&s.path, &[("etc/issue", b"MiniOS\n")])?;
    let report = src.export(&s.id, &src_base.join("s"), true)?;
    assert_eq!(report.header.system.version.as_deref(), Some("4.0"));
    assert_eq!(read_header(&report.path)?.system, s.system);

    // a different release only warns; the session keeps its origin
    let dst_base = unique_root("archive-release-dst");
    let dst_host = Arc::new(FakeHost::new().with_release("4.1", "Flux", "overlayfs"));
    let mut dst = open_engine(&dst_base, dst_host)?;
    let imported = dst.import(&report.path, ImportOptions::default())?;
    assert_eq!(imported.system, s.system);
    assert_eq!(fs::read(imported.path.join("etc/issue"))?, b"MiniOS\n");

    let _ = fs::remove_dir_all(&src_base);
    let _ = fs::remove_dir_all(&dst_base);
    Ok(())
}
