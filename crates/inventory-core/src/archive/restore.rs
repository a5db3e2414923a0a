use chrono::Utc;
use serde::Serialize;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::format::{self, ArchiveFormat, Category, ChecksumStatus, DigestMismatch, Manifest};
use super::{ArchiveCoordinator, ArchiveError};
use crate::fsutil;
use crate::key_vault::KeyVault;
use crate::paths::{self, with_suffix, STORE_FILE};
use crate::store::schema::CORE_TABLES;
use crate::store::{StoreError, StoreState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CategoryStatus {
    Restored { files: usize },
    /// Not carried by the archive.
    Missing,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryOutcome {
    pub category: Category,
    #[serde(flatten)]
    pub status: CategoryStatus,
}

/// Itemised result of a restore that was not aborted.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub archive: PathBuf,
    pub format: ArchiveFormat,
    pub checksum: Option<ChecksumStatus>,
    /// SHA-256 of the live store file right after it was replaced.
    pub store_sha256: Option<String>,
    /// Where the previous live store was copied before being overwritten.
    pub pre_restore_copy: Option<PathBuf>,
    /// The restored key differs from the one this process loaded.
    pub restart_required: bool,
    pub categories: Vec<CategoryOutcome>,
}

impl RestoreReport {
    pub fn status(&self, category: Category) -> Option<&CategoryStatus> {
        self.categories
            .iter()
            .find(|o| o.category == category)
            .map(|o| &o.status)
    }

    pub fn restored(&self, category: Category) -> bool {
        matches!(self.status(category), Some(CategoryStatus::Restored { .. }))
    }

    fn push(&mut self, category: Category, status: CategoryStatus) {
        match &status {
            CategoryStatus::Restored { files } => info!(%category, files, "restored"),
            CategoryStatus::Missing => warn!(%category, "not present in archive; skipped"),
            CategoryStatus::Failed { reason } => warn!(%category, reason = %reason, "restore failed"),
        }
        self.categories.push(CategoryOutcome { category, status });
    }
}

impl ArchiveCoordinator {
    /// Restore an archive over the live data. `Ok(true)` once every category
    /// has been attempted; integrity failures abort before anything is written.
    pub fn restore_backup(&self, archive: &Path) -> Result<bool, ArchiveError> {
        self.restore_backup_report(archive).map(|_| true)
    }

    pub fn restore_backup_report(&self, archive: &Path) -> Result<RestoreReport, ArchiveError> {
        if !archive.exists() {
            error!(archive = %archive.display(), "restore refused: archive not found");
            return Err(ArchiveError::NotFound(archive.to_path_buf()));
        }
        if !archive.is_dir() {
            error!(archive = %archive.display(), "restore refused: not a directory");
            return Err(ArchiveError::NotADirectory(archive.to_path_buf()));
        }
        let format = ArchiveFormat::detect(archive)
            .ok_or_else(|| ArchiveError::Unrecognized(archive.to_path_buf()))?;
        if matches!(self.store.state(), StoreState::ShuttingDown | StoreState::Closed) {
            return Err(StoreError::Closed.into());
        }
        info!(archive = %archive.display(), ?format, "restoring backup");

        let checksum = match format {
            ArchiveFormat::Current => Some(validate_store_copy(archive)?),
            ArchiveFormat::LegacyFlatFile => {
                warn!(
                    archive = %archive.display(),
                    "archive predates the store file format; only file artifacts will be restored"
                );
                None
            }
        };
        let tampered = validate_artifacts(archive)?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut report = RestoreReport {
            archive: archive.to_path_buf(),
            format,
            checksum,
            store_sha256: None,
            pre_restore_copy: None,
            restart_required: false,
            categories: Vec::new(),
        };

        // 1. keys first: without them the store is inert
        let (status, changed) = self.restore_keys(archive)?;
        report.restart_required = changed;
        report.push(Category::KeyMaterial, status);

        // 2. store
        if format == ArchiveFormat::Current {
            if self.config.settings().store_enabled {
                let (sha, aside) = self.restore_store(archive, &stamp)?;
                report.store_sha256 = Some(sha);
                report.pre_restore_copy = aside;
                report.push(Category::Store, CategoryStatus::Restored { files: 1 });
            } else {
                report.push(
                    Category::Store,
                    CategoryStatus::Failed {
                        reason: "store disabled by configuration".to_string(),
                    },
                );
            }
        }

        // 3. dependent artifacts, best-effort per category; a category with a
        // damaged file is skipped whole
        let projects = self.projects_dir();
        let status = refuse_tampered(&tampered, Category::Projects).unwrap_or_else(|| {
            restore_dir(
                &archive.join(paths::PROJECTS_DIR),
                &projects,
                format::is_project_file,
            )
        });
        report.push(Category::Projects, status);

        let status = refuse_tampered(&tampered, Category::AppConfig).unwrap_or_else(|| {
            restore_files(
                archive,
                &[(paths::APP_PROPERTIES_FILE, self.layout.app_properties())],
            )
        });
        if matches!(status, CategoryStatus::Restored { .. }) {
            if let Err(e) = self.config.reload() {
                warn!(error = %e, "configuration reload after restore failed");
            }
        }
        report.push(Category::AppConfig, status);

        let status = refuse_tampered(&tampered, Category::ReportBlob)
            .unwrap_or_else(|| self.restore_report_blob(archive, &stamp));
        report.push(Category::ReportBlob, status);

        let status = refuse_tampered(&tampered, Category::Drafts).unwrap_or_else(|| {
            restore_dir(
                &archive.join(paths::DRAFTS_DIR),
                &self.layout.drafts_dir(),
                |_| true,
            )
        });
        report.push(Category::Drafts, status);

        let status = refuse_tampered(&tampered, Category::Signatures).unwrap_or_else(|| {
            restore_dir(
                &archive.join(paths::SIGNATURES_DIR),
                &self.layout.signatures_dir(),
                |_| true,
            )
        });
        report.push(Category::Signatures, status);

        let status = refuse_tampered(&tampered, Category::Supplementary).unwrap_or_else(|| {
            restore_files(
                archive,
                &[
                    (paths::MASTER_KEY_FILE, self.layout.master_key_file()),
                    (paths::CONFIG_PROPERTIES_FILE, self.layout.config_properties()),
                ],
            )
        });
        if matches!(status, CategoryStatus::Restored { .. }) {
            fsutil::restrict_to_owner(&self.layout.master_key_file());
        }
        report.push(Category::Supplementary, status);

        // 4. deprecated flat-file records
        let legacy = archive.join(paths::LEGACY_DIR);
        if legacy.is_dir() {
            warn!(
                archive = %archive.display(),
                target = %self.layout.legacy_import_dir().display(),
                "DEPRECATED: restoring legacy flat-file records; import them and re-create the backup"
            );
            let status = refuse_tampered(&tampered, Category::Legacy).unwrap_or_else(|| {
                restore_dir(&legacy, &self.layout.legacy_import_dir(), |_| true)
            });
            report.push(Category::Legacy, status);
        }

        let failed = report
            .categories
            .iter()
            .filter(|o| matches!(o.status, CategoryStatus::Failed { .. }))
            .count();
        info!(
            archive = %archive.display(),
            categories = report.categories.len(),
            failed,
            restart_required = report.restart_required,
            "restore finished"
        );
        Ok(report)
    }

    /// Returns the status and whether the live key changed.
    fn restore_keys(&self, archive: &Path) -> Result<(CategoryStatus, bool), ArchiveError> {
        let src = archive.join(paths::KEY_DIR);
        if !src.is_dir() {
            warn!(
                archive = %archive.display(),
                "archive carries no key material; encrypted fields may be unreadable"
            );
            return Ok((CategoryStatus::Missing, false));
        }
        let dst = self.layout.key_dir();
        let key_file = self.layout.key_file();
        let before = fsutil::sha256_file(&key_file).ok();

        let expected = fsutil::dir_stats(&src).0 as usize;
        let copied = fsutil::copy_tree(&src, &dst, |_| true).map_err(|e| ArchiveError::io(&dst, e))?;
        if copied != expected {
            return Err(ArchiveError::io(
                &dst,
                io::Error::other(format!("copied {copied} of {expected} key files")),
            ));
        }
        fsutil::restrict_to_owner(&dst);
        if key_file.is_file() {
            fsutil::restrict_to_owner(&key_file);
            fsutil::set_hidden(&key_file);
        }

        let after = fsutil::sha256_file(&key_file).ok();
        let changed = before.is_some() && before != after;
        if changed {
            warn!("restored encryption key differs from the loaded one; restart to use it");
        }
        Ok((CategoryStatus::Restored { files: copied }, changed))
    }

    /// Swap the live store for the archive copy while the pool is closed.
    fn restore_store(
        &self,
        archive: &Path,
        stamp: &str,
    ) -> Result<(String, Option<PathBuf>), ArchiveError> {
        let lease = self.store.release_for_restore()?;
        let live = lease.layout().store_file().to_path_buf();
        let wal = lease.layout().wal_file();
        let shm = lease.layout().shm_file();

        let aside = replace_store(&archive.join(STORE_FILE), &live, &wal, &shm, stamp)
            .map_err(|e| {
                error!(path = %live.display(), error = %e, "store file restore failed");
                ArchiveError::io(&live, e)
            })?;
        let sha = fsutil::sha256_file(&live).map_err(|e| ArchiveError::io(&live, e))?;
        lease.reopen()?;
        Ok((sha, aside))
    }

    fn restore_report_blob(&self, archive: &Path, stamp: &str) -> CategoryStatus {
        let live = self.layout.report_blob();
        if archive.join(paths::REPORT_BLOB_FILE).is_file() && live.is_file() {
            let side = with_suffix(&live, &format!(".pre-restore.{stamp}"));
            if let Err(e) = fs::copy(&live, &side) {
                warn!(path = %live.display(), error = %e, "cannot keep pre-restore copy of report blob");
            }
        }
        restore_files(
            archive,
            &[
                (paths::REPORT_BLOB_FILE, live),
                (paths::REPORT_BLOB_BACKUP_FILE, self.layout.report_blob_backup()),
            ],
        )
    }
}

/// Checksum then structural probe on the archive's store copy. Nothing live
/// has been touched when this fails.
fn validate_store_copy(archive: &Path) -> Result<ChecksumStatus, ArchiveError> {
    let store = archive.join(STORE_FILE);
    let status = format::check_store_checksum(archive)?;
    match &status {
        ChecksumStatus::Verified => {}
        ChecksumStatus::Missing => {
            warn!(path = %store.display(), "no checksum sidecar; relying on the structural probe")
        }
        ChecksumStatus::Mismatch { expected, actual } => {
            error!(
                path = %store.display(),
                expected = %expected,
                actual = %actual,
                "restore refused: checksum mismatch"
            );
            return Err(ArchiveError::ChecksumMismatch {
                path: store,
                expected: expected.clone(),
                actual: actual.clone(),
            });
        }
    }
    let present = format::probe_store_copy(&store)?;
    if present < CORE_TABLES.len() {
        warn!(present, expected = CORE_TABLES.len(), "archive store lacks core tables");
    }
    Ok(status)
}

/// Manifest sidecar, per-file digests and the archived key, all checked
/// before anything live is written. Store or key damage aborts; damage in
/// other categories is returned so those categories can be skipped.
fn validate_artifacts(archive: &Path) -> Result<Vec<DigestMismatch>, ArchiveError> {
    let manifest_path = archive.join(format::MANIFEST_FILE);
    let tampered = if manifest_path.is_file() {
        let manifest_status = format::check_sidecar(&manifest_path)?;
        if let ChecksumStatus::Mismatch { expected, actual } = manifest_status {
            error!(path = %manifest_path.display(), "restore refused: manifest checksum mismatch");
            return Err(ArchiveError::ChecksumMismatch {
                path: manifest_path,
                expected,
                actual,
            });
        }
        Manifest::read(archive)
            .map(|m| format::check_digests(archive, &m))
            .unwrap_or_default()
    } else {
        warn!(archive = %archive.display(), "no manifest; per-file digests unavailable");
        Vec::new()
    };

    if let Some(critical) = tampered.iter().find(|m| m.is_critical()) {
        error!(entry = %critical.entry, "restore refused: archived file does not match its digest");
        return Err(critical.clone().into_error(archive));
    }

    let key = archive.join(paths::KEY_DIR).join(paths::KEY_FILE);
    if key.is_file() {
        KeyVault::check_key_file(&key).map_err(|e| {
            error!(path = %key.display(), error = %e, "restore refused: archived key is unusable");
            ArchiveError::InvalidKeyMaterial(e)
        })?;
    }
    Ok(tampered)
}

fn refuse_tampered(tampered: &[DigestMismatch], category: Category) -> Option<CategoryStatus> {
    let entries: Vec<&str> = tampered
        .iter()
        .filter(|m| m.category() == Some(category))
        .map(|m| m.entry.as_str())
        .collect();
    (!entries.is_empty()).then(|| CategoryStatus::Failed {
        reason: format!("checksum mismatch: {}", entries.join(", ")),
    })
}

/// Copy the live file aside, move the archive copy into place, then drop
/// WAL/SHM files belonging to the old file.
fn replace_store(
    src: &Path,
    live: &Path,
    wal: &Path,
    shm: &Path,
    stamp: &str,
) -> io::Result<Option<PathBuf>> {
    let dir = live
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;

    let aside = if live.is_file() {
        let aside = with_suffix(live, &format!(".pre-restore.{stamp}"));
        fs::copy(live, &aside)?;
        info!(path = %aside.display(), "live store copied aside");
        Some(aside)
    } else {
        None
    };

    let staging = with_suffix(live, ".restore-staging");
    let staged = fs::copy(src, &staging).and_then(|_| File::open(&staging)?.sync_all());
    if let Err(e) = staged {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    fs::rename(&staging, live)?;
    fsutil::fsync_dir(dir)?;

    fsutil::remove_if_exists(wal)?;
    fsutil::remove_if_exists(shm)?;
    Ok(aside)
}

fn restore_dir(src: &Path, dst: &Path, filter: impl Fn(&Path) -> bool) -> CategoryStatus {
    if !src.is_dir() {
        return CategoryStatus::Missing;
    }
    match fsutil::copy_tree(src, dst, filter) {
        Ok(files) => CategoryStatus::Restored { files },
        Err(e) => CategoryStatus::Failed {
            reason: e.to_string(),
        },
    }
}

fn restore_files(archive: &Path, files: &[(&str, PathBuf)]) -> CategoryStatus {
    let mut restored = 0;
    let mut failures = Vec::new();
    for (name, dst) in files {
        match fsutil::copy_if_exists(&archive.join(name), dst) {
            Ok(true) => restored += 1,
            Ok(false) => {}
            Err(e) => failures.push(format!("{name}: {e}")),
        }
    }
    if !failures.is_empty() {
        CategoryStatus::Failed {
            reason: failures.join("; "),
        }
    } else if restored == 0 {
        CategoryStatus::Missing
    } else {
        CategoryStatus::Restored { files: restored }
    }
}
