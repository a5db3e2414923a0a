//! Integration tests for backup and restore.
//!
//!  1. Backup then restore into a fresh location reproduces the data
//!  2. Tampered archives are refused before anything live is touched
//!  3. Retention keeps only the newest complete archives
//!  4. Disabled backups short-circuit
//!  5. Listing and verification are read-only
//!  6. Every commit finished before a backup starts is in the archive

use inventory_core::archive::{ArchiveError, Category, CategoryStatus, ChecksumStatus};
use inventory_core::config::ConfigSource;
use inventory_core::error::ErrorClass;
use inventory_core::fsutil;
use inventory_core::store::RetryPolicy;
use inventory_core::{
    ArchiveCoordinator, CipherService, KeyVault, Layout, Settings, StaticConfig, StoreManager,
    StoreOptions,
};
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

struct Env {
    _dir: TempDir,
    layout: Layout,
    cipher: CipherService,
    store: Arc<StoreManager>,
    coordinator: ArchiveCoordinator,
}

impl Env {
    fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    fn with_settings(settings: Settings) -> Self {
        Self::with_options(settings, StoreOptions::default())
    }

    fn with_options(settings: Settings, options: StoreOptions) -> Self {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let vault = KeyVault::load_or_create(layout.key_file()).unwrap();
        let cipher = CipherService::new(vault.key());
        let config: Arc<dyn ConfigSource> = Arc::new(StaticConfig::new(settings));
        let store = Arc::new(StoreManager::new(
            layout.clone(),
            cipher.clone(),
            config.clone(),
            options,
        ));
        let coordinator = ArchiveCoordinator::new(layout.clone(), store.clone(), config);
        Self {
            _dir: dir,
            layout,
            cipher,
            store,
            coordinator,
        }
    }

    fn count(&self, table: &str) -> i64 {
        self.store
            .run_with_retry(|c| {
                c.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            })
            .unwrap()
    }

    fn seed(&self) {
        let client = self.cipher.encrypt("Minera Andina S.A.").unwrap();
        self.store
            .run_in_transaction(|tx| {
                tx.execute(
                    "INSERT INTO proyectos (nombre, cliente) VALUES ('Planta Norte', ?1)",
                    [&client],
                )?;
                let project = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO reportes (proyecto_id, titulo) VALUES (?1, 'Mantenimiento mayo')",
                    [project],
                )?;
                for code in ["BOM-01", "BOM-02", "VAL-07"] {
                    tx.execute(
                        "INSERT INTO inventarios (proyecto_id, codigo, cantidad) VALUES (?1, ?2, 4)",
                        rusqlite::params![project, code],
                    )?;
                }
                tx.execute(
                    "INSERT INTO logs_auditoria (usuario, accion) VALUES ('admin', 'seed')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let projects = self.layout.projects_dir();
        fs::create_dir_all(projects).unwrap();
        fs::write(projects.join("Planta Norte.xlsx"), b"workbook").unwrap();
        fs::write(projects.join("~$Planta Norte.xlsx"), b"lock").unwrap();
        fs::write(self.layout.app_properties(), "backup.keep_last=7\n").unwrap();
        fs::write(self.layout.report_blob(), b"report-blob").unwrap();
        fs::create_dir_all(self.layout.drafts_dir()).unwrap();
        fs::write(self.layout.drafts_dir().join("draft-1.json"), b"{}").unwrap();
        fs::create_dir_all(self.layout.signatures_dir()).unwrap();
        fs::write(self.layout.signatures_dir().join("firma.png"), b"png").unwrap();
    }
}

fn flip_first_hex_char(path: &Path) {
    let mut text = fs::read_to_string(path).unwrap();
    let replacement = if text.starts_with('0') { "1" } else { "0" };
    text.replace_range(0..1, replacement);
    fs::write(path, text).unwrap();
}

fn read_only_count(store: &Path, table: &str) -> i64 {
    let conn = Connection::open_with_flags(store, OpenFlags::SQLITE_OPEN_READ_ONLY).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

fn make_fake_archive(backups: &Path, id: &str) -> PathBuf {
    let path = backups.join(id);
    fs::create_dir_all(path.join("security")).unwrap();
    fs::write(path.join("security").join("encryption.key"), id).unwrap();
    fs::write(path.join("inventario.db"), id).unwrap();
    path
}

fn archived_file(archive: &Path, entry: &str) -> PathBuf {
    entry.split('/').fold(archive.to_path_buf(), |p, part| p.join(part))
}

// ─── 1: restore fidelity ────────────────────────────────────────────────────

#[test]
fn test_backup_restores_into_fresh_location() {
    let source = Env::new();
    source.seed();
    let archive = source.coordinator.create_backup().unwrap().unwrap();
    assert_eq!(archive.core_tables_present, 4);
    assert!(archive.checkpoint_complete);
    let archive_sha = archive.store_sha256.clone().unwrap();

    let target = Env::new();
    let report = target
        .coordinator
        .restore_backup_report(&archive.root)
        .unwrap();

    assert_eq!(report.checksum, Some(ChecksumStatus::Verified));
    assert_eq!(report.store_sha256.as_deref(), Some(archive_sha.as_str()));
    assert!(report.restart_required, "target had its own key before restore");
    for category in [
        Category::KeyMaterial,
        Category::Store,
        Category::Projects,
        Category::AppConfig,
        Category::ReportBlob,
        Category::Drafts,
        Category::Signatures,
    ] {
        assert!(report.restored(category), "{category} not restored");
    }
    assert_eq!(report.status(Category::Supplementary), Some(&CategoryStatus::Missing));

    for table in ["proyectos", "reportes", "inventarios", "logs_auditoria"] {
        assert_eq!(target.count(table), source.count(table), "{table}");
    }

    // encrypted fields decrypt with the restored key
    let restored_key = KeyVault::load_or_create(target.layout.key_file()).unwrap();
    let cipher = CipherService::new(restored_key.key());
    let client: String = target
        .store
        .run_with_retry(|c| c.query_row("SELECT cliente FROM proyectos", [], |r| r.get(0)))
        .unwrap();
    assert_eq!(cipher.decrypt(&client).unwrap(), "Minera Andina S.A.");

    let projects = target.layout.projects_dir();
    assert!(projects.join("Planta Norte.xlsx").is_file());
    assert!(!projects.join("~$Planta Norte.xlsx").exists());
    assert_eq!(fs::read(target.layout.report_blob()).unwrap(), b"report-blob");
    assert!(target.layout.drafts_dir().join("draft-1.json").is_file());
}

#[test]
fn test_restore_keeps_previous_store_aside() {
    let env = Env::new();
    env.seed();
    let archive = env.coordinator.create_backup().unwrap().unwrap();
    env.store
        .run_in_transaction(|tx| tx.execute("DELETE FROM logs_auditoria", []))
        .unwrap();
    assert_eq!(env.count("logs_auditoria"), 0);

    assert!(env.coordinator.restore_backup(&archive.root).unwrap());
    assert_eq!(env.count("logs_auditoria"), 1);

    let report = env.coordinator.restore_backup_report(&archive.root).unwrap();
    let aside = report.pre_restore_copy.unwrap();
    assert!(aside.is_file());
    assert!(!report.restart_required, "same key restored");
}

// ─── 2: tamper detection ────────────────────────────────────────────────────

#[test]
fn test_tampered_sidecar_refuses_restore() {
    let source = Env::new();
    source.seed();
    let archive = source.coordinator.create_backup().unwrap().unwrap();
    flip_first_hex_char(&fsutil::checksum_path(&archive.store_file()));

    let target = Env::new();
    target.store.initialize().unwrap();
    target.store.checkpoint().unwrap();
    let live_before = fsutil::sha256_file(target.layout.store_file()).unwrap();
    let key_before = fs::read(target.layout.key_file()).unwrap();

    let err = target
        .coordinator
        .restore_backup(&archive.root)
        .unwrap_err();
    assert!(matches!(err, ArchiveError::ChecksumMismatch { .. }));
    assert_eq!(err.class(), ErrorClass::Integrity);

    assert_eq!(
        fsutil::sha256_file(target.layout.store_file()).unwrap(),
        live_before
    );
    assert_eq!(fs::read(target.layout.key_file()).unwrap(), key_before);
    assert_eq!(target.count("proyectos"), 0);
}

#[test]
fn test_tampered_store_copy_refuses_restore() {
    let source = Env::new();
    source.seed();
    let archive = source.coordinator.create_backup().unwrap().unwrap();

    let store_copy = archive.store_file();
    let mut bytes = fs::read(&store_copy).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;
    fs::write(&store_copy, bytes).unwrap();

    let target = Env::new();
    target.seed();
    let err = target
        .coordinator
        .restore_backup(&archive.root)
        .unwrap_err();
    assert!(matches!(err, ArchiveError::ChecksumMismatch { .. }));
    assert_eq!(target.count("inventarios"), 3);
}

#[test]
fn test_tampered_key_refuses_restore() {
    let source = Env::new();
    source.seed();
    let archive = source.coordinator.create_backup().unwrap().unwrap();
    let archived_key = archived_file(&archive.root, "security/encryption.key");
    let mut key_text = fs::read_to_string(&archived_key).unwrap();
    let replacement = if key_text.starts_with('A') { "B" } else { "A" };
    key_text.replace_range(0..1, replacement);
    fs::write(&archived_key, key_text).unwrap();

    let verification = source.coordinator.verify_backup(&archive.root).unwrap();
    assert_eq!(verification.digest_mismatches.len(), 1);
    assert!(!verification.is_restorable());

    let target = Env::new();
    target.seed();
    let key_before = fs::read(target.layout.key_file()).unwrap();
    let err = target
        .coordinator
        .restore_backup(&archive.root)
        .unwrap_err();
    assert!(matches!(err, ArchiveError::ChecksumMismatch { .. }));
    assert_eq!(fs::read(target.layout.key_file()).unwrap(), key_before);
    assert_eq!(target.count("inventarios"), 3);
}

#[test]
fn test_undecodable_key_refuses_restore_without_manifest() {
    let source = Env::new();
    source.seed();
    let archive = source.coordinator.create_backup().unwrap().unwrap();
    fs::remove_file(archive.root.join("manifest.json")).unwrap();
    fs::remove_file(archive.root.join("manifest.json.sha256")).unwrap();
    fs::write(
        archived_file(&archive.root, "security/encryption.key"),
        "not a key",
    )
    .unwrap();

    let target = Env::new();
    let key_before = fs::read(target.layout.key_file()).unwrap();
    let err = target
        .coordinator
        .restore_backup(&archive.root)
        .unwrap_err();
    assert!(matches!(err, ArchiveError::InvalidKeyMaterial(_)));
    assert_eq!(err.class(), ErrorClass::Integrity);
    assert_eq!(fs::read(target.layout.key_file()).unwrap(), key_before);
}

#[test]
fn test_tampered_artifact_skips_only_its_category() {
    let source = Env::new();
    source.seed();
    let archive = source.coordinator.create_backup().unwrap().unwrap();
    fs::write(archived_file(&archive.root, "firmas/firma.png"), b"forged").unwrap();

    let target = Env::new();
    let report = target
        .coordinator
        .restore_backup_report(&archive.root)
        .unwrap();
    assert!(matches!(
        report.status(Category::Signatures),
        Some(CategoryStatus::Failed { .. })
    ));
    assert!(report.restored(Category::Store));
    assert!(report.restored(Category::Drafts));
    assert!(!target.layout.signatures_dir().join("firma.png").exists());
}

#[test]
fn test_tampered_manifest_refuses_restore() {
    let source = Env::new();
    source.seed();
    let archive = source.coordinator.create_backup().unwrap().unwrap();
    let manifest = archive.root.join("manifest.json");
    let text = fs::read_to_string(&manifest).unwrap();
    fs::write(&manifest, text.replace("\"core_tables_present\": 4", "\"core_tables_present\": 5"))
        .unwrap();

    let target = Env::new();
    let err = target
        .coordinator
        .restore_backup(&archive.root)
        .unwrap_err();
    assert!(matches!(err, ArchiveError::ChecksumMismatch { ref path, .. } if path == &manifest));
}

#[test]
fn test_missing_archive_fails_closed() {
    let env = Env::new();
    let missing = env.layout.backups_dir().join("backup_20990101_000000_000");
    let err = env.coordinator.restore_backup(&missing).unwrap_err();
    assert!(matches!(err, ArchiveError::NotFound(_)));

    let empty = env.layout.root().join("empty");
    fs::create_dir_all(&empty).unwrap();
    let err = env.coordinator.restore_backup(&empty).unwrap_err();
    assert!(matches!(err, ArchiveError::Unrecognized(_)));
}

#[test]
fn test_legacy_archive_restores_flat_records() {
    let env = Env::new();
    let archive = env.layout.root().join("old-archive");
    fs::create_dir_all(archive.join("legacy")).unwrap();
    fs::write(archive.join("legacy").join("proyectos.dat"), b"rows").unwrap();

    let report = env.coordinator.restore_backup_report(&archive).unwrap();
    assert!(report.restored(Category::Legacy));
    assert!(report.status(Category::Store).is_none());
    assert!(env
        .layout
        .legacy_import_dir()
        .join("proyectos.dat")
        .is_file());
}

// ─── 3: retention ───────────────────────────────────────────────────────────

#[test]
fn test_retention_keeps_newest_two() {
    let env = Env::with_settings(Settings {
        backup_keep_last: 2,
        ..Settings::default()
    });
    let backups = env.layout.backups_dir();
    for i in 0..5 {
        make_fake_archive(&backups, &format!("backup_20200101_00000{i}_000"));
    }
    fs::create_dir_all(backups.join("unrelated")).unwrap();

    let archive = env.coordinator.create_backup().unwrap().unwrap();

    let ids: Vec<String> = env
        .coordinator
        .list_backups()
        .unwrap()
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(ids, vec![archive.id.clone(), "backup_20200101_000004_000".to_string()]);
    assert!(backups.join("unrelated").is_dir());
}

#[test]
fn test_incomplete_archives_never_push_out_complete_ones() {
    let env = Env::with_settings(Settings {
        backup_keep_last: 2,
        store_enabled: false,
        ..Settings::default()
    });
    let backups = env.layout.backups_dir();
    let older = make_fake_archive(&backups, "backup_20200101_000000_000");
    let newer = make_fake_archive(&backups, "backup_20200101_000001_000");

    let mut incomplete = Vec::new();
    for _ in 0..4 {
        let archive = env.coordinator.create_backup().unwrap().unwrap();
        assert!(archive.store_sha256.is_none());
        incomplete.push(archive.root);
    }

    assert!(older.is_dir());
    assert!(newer.is_dir());
    let listed = env.coordinator.list_backups().unwrap();
    assert_eq!(listed.iter().filter(|b| b.complete).count(), 2);
    assert_eq!(listed.iter().filter(|b| !b.complete).count(), 2);
    // the newest incomplete ones survive
    assert!(incomplete[3].is_dir());
    assert!(incomplete[2].is_dir());
    assert!(!incomplete[0].exists());
}

// ─── 4: disabled ────────────────────────────────────────────────────────────

#[test]
fn test_disabled_backup_returns_none() {
    let env = Env::with_settings(Settings {
        backup_enabled: false,
        ..Settings::default()
    });
    assert!(env.coordinator.create_backup().unwrap().is_none());
    assert!(!env.layout.backups_dir().exists());
}

#[test]
fn test_missing_key_material_aborts_backup() {
    let env = Env::new();
    env.seed();
    fs::remove_dir_all(env.layout.key_dir()).unwrap();

    let err = env.coordinator.create_backup().unwrap_err();
    assert!(matches!(err, ArchiveError::MissingKeyMaterial(_)));
    assert!(env.coordinator.list_backups().unwrap().is_empty());
}

// ─── 5: listing and verification ────────────────────────────────────────────

#[test]
fn test_list_backups_newest_first() {
    let env = Env::new();
    env.seed();
    let first = env.coordinator.create_backup().unwrap().unwrap();
    let second = env.coordinator.create_backup().unwrap().unwrap();

    let listed = env.coordinator.list_backups().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);
    assert!(listed.iter().all(|b| b.complete && b.file_count > 0));
    assert!(listed[0].created_at.is_some());
}

#[test]
fn test_verify_backup_reports_health() {
    let env = Env::new();
    env.seed();
    let archive = env.coordinator.create_backup().unwrap().unwrap();

    let verification = env.coordinator.verify_backup(&archive.root).unwrap();
    assert!(verification.complete);
    assert_eq!(verification.checksum, Some(ChecksumStatus::Verified));
    assert_eq!(verification.probe_ok, Some(true));
    assert_eq!(verification.core_tables_present, 4);
    assert_eq!(verification.manifest_checksum, Some(ChecksumStatus::Verified));
    assert!(verification.digest_mismatches.is_empty());
    assert!(verification.is_restorable());

    flip_first_hex_char(&fsutil::checksum_path(&archive.store_file()));
    let verification = env.coordinator.verify_backup(&archive.root).unwrap();
    assert!(matches!(
        verification.checksum,
        Some(ChecksumStatus::Mismatch { .. })
    ));
    assert!(!verification.is_restorable());
}

// ─── 6: commit visibility ───────────────────────────────────────────────────

#[test]
fn test_backup_holds_every_prior_commit() {
    let env = Env::new();
    env.seed();
    for i in 0..10 {
        env.store
            .run_in_transaction(|tx| {
                tx.execute(
                    "INSERT INTO logs_auditoria (usuario, accion) VALUES ('ana', ?1)",
                    [format!("op-{i}")],
                )
            })
            .unwrap();
    }
    let archive = env.coordinator.create_backup().unwrap().unwrap();
    assert_eq!(read_only_count(&archive.store_file(), "logs_auditoria"), 11);
}

#[test]
fn test_backup_with_open_reader_holds_every_prior_commit() {
    let env = Env::with_options(
        Settings::default(),
        StoreOptions {
            busy_timeout: Duration::from_millis(50),
            retry: RetryPolicy {
                attempts: 2,
                base_delay: Duration::from_millis(5),
            },
            ..StoreOptions::default()
        },
    );
    env.store
        .run_in_transaction(|tx| tx.execute("INSERT INTO proyectos (nombre) VALUES ('A')", []))
        .unwrap();
    env.store.checkpoint().unwrap();

    // a reader pinned to the snapshot before B keeps B's frames in the WAL
    let reader = Connection::open(env.layout.store_file()).unwrap();
    reader.execute_batch("BEGIN").unwrap();
    let seen: i64 = reader
        .query_row("SELECT COUNT(*) FROM proyectos", [], |r| r.get(0))
        .unwrap();
    assert_eq!(seen, 1);

    env.store
        .run_in_transaction(|tx| tx.execute("INSERT INTO proyectos (nombre) VALUES ('B')", []))
        .unwrap();
    let archive = env.coordinator.create_backup().unwrap().unwrap();
    reader.execute_batch("COMMIT").unwrap();

    assert!(!archive.checkpoint_complete);
    assert_eq!(read_only_count(&archive.store_file(), "proyectos"), 2);
    assert_eq!(env.count("proyectos"), 2);
}

#[test]
fn test_backup_during_concurrent_writes() {
    let env = Env::new();
    env.seed();
    let store = env.store.clone();
    let writer = thread::spawn(move || {
        for i in 0..50 {
            store
                .run_in_transaction(|tx| {
                    tx.execute(
                        "INSERT INTO logs_auditoria (usuario, accion) VALUES ('writer', ?1)",
                        [format!("op-{i}")],
                    )
                })
                .unwrap();
        }
    });

    let archive = env.coordinator.create_backup().unwrap().unwrap();
    writer.join().unwrap();

    assert_eq!(archive.core_tables_present, 4);
    let verification = env.coordinator.verify_backup(&archive.root).unwrap();
    assert!(verification.is_restorable());

    let archived = read_only_count(&archive.store_file(), "logs_auditoria");
    assert!((1..=51).contains(&archived), "archived {archived} rows");
    assert_eq!(env.count("logs_auditoria"), 51);
}
