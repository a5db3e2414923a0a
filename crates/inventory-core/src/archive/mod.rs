//! Full-system backup and restore.
//!
//! An archive is one timestamped directory under `backups/` holding a
//! consistent snapshot of the store with its `.sha256` sidecar, the key
//! material copied verbatim, and every file artifact the store's data depends
//! on. `manifest.json` lists a digest for each of those files and carries a
//! sidecar of its own.

pub mod format;
mod restore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ConfigSource;
use crate::error::ErrorClass;
use crate::fsutil;
use crate::key_vault::CryptoError;
use crate::paths::{self, Layout, STORE_FILE};
use crate::store::schema::CORE_TABLES;
use crate::store::{StoreError, StoreManager};

pub use format::{
    ArchiveFormat, ArchiveVerification, Category, ChecksumStatus, DigestMismatch, Manifest,
    ALL_CATEGORIES,
};
pub use restore::{CategoryOutcome, CategoryStatus, RestoreReport};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive {0} does not exist")]
    NotFound(PathBuf),

    #[error("archive {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("archive {0} holds neither a store file nor legacy records")]
    Unrecognized(PathBuf),

    #[error("checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("structural probe failed for {path}: {reason}")]
    StructuralProbe { path: PathBuf, reason: String },

    #[error("key material missing at {0}")]
    MissingKeyMaterial(PathBuf),

    #[error("archived key material is unusable: {0}")]
    InvalidKeyMaterial(#[source] CryptoError),

    #[error("archive I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ArchiveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ArchiveError::NotFound(_)
            | ArchiveError::NotADirectory(_)
            | ArchiveError::Unrecognized(_) => ErrorClass::Configuration,
            ArchiveError::ChecksumMismatch { .. }
            | ArchiveError::StructuralProbe { .. }
            | ArchiveError::InvalidKeyMaterial(_) => ErrorClass::Integrity,
            ArchiveError::MissingKeyMaterial(_) | ArchiveError::Io { .. } => ErrorClass::Io,
            ArchiveError::Store(e) => e.class(),
        }
    }

    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A freshly created archive.
#[derive(Debug, Clone, Serialize)]
pub struct BackupArchive {
    pub id: String,
    pub root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub store_sha256: Option<String>,
    /// The WAL was fully folded into the main file before the snapshot.
    /// The snapshot is complete either way.
    pub checkpoint_complete: bool,
    pub core_tables_present: usize,
    pub categories: Vec<(Category, usize)>,
}

impl BackupArchive {
    pub fn store_file(&self) -> PathBuf {
        self.root.join(STORE_FILE)
    }
}

/// Listing entry for an existing archive.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub id: String,
    pub path: PathBuf,
    pub created_at: Option<DateTime<Utc>>,
    pub file_count: u64,
    pub total_bytes: u64,
    pub complete: bool,
}

pub struct ArchiveCoordinator {
    layout: Layout,
    store: Arc<StoreManager>,
    config: Arc<dyn ConfigSource>,
}

impl ArchiveCoordinator {
    pub fn new(layout: Layout, store: Arc<StoreManager>, config: Arc<dyn ConfigSource>) -> Self {
        Self {
            layout,
            store,
            config,
        }
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.layout.backups_dir()
    }

    /// Workspace directory for project files; configuration may relocate it.
    pub fn projects_dir(&self) -> PathBuf {
        self.config
            .settings()
            .projects_dir
            .unwrap_or_else(|| self.layout.projects_dir().to_path_buf())
    }

    /// Snapshot the store and every dependent artifact. `Ok(None)` when
    /// backups are disabled.
    pub fn create_backup(&self) -> Result<Option<BackupArchive>, ArchiveError> {
        let settings = self.config.settings();
        if !settings.backup_enabled {
            info!("backups disabled by configuration; skipping");
            return Ok(None);
        }
        let (id, root, created_at) = self.new_archive_dir()?;
        info!(archive = %root.display(), "creating backup");

        match self.fill_archive(&id, &root, created_at) {
            Ok(archive) => {
                info!(
                    archive = %archive.root.display(),
                    core_tables = archive.core_tables_present,
                    "backup created"
                );
                self.prune(settings.backup_keep_last);
                Ok(Some(archive))
            }
            Err(e) => {
                error!(archive = %root.display(), error = %e, "backup aborted");
                if let Err(rm) = fs::remove_dir_all(&root) {
                    warn!(archive = %root.display(), error = %rm, "cannot remove partial archive");
                }
                Err(e)
            }
        }
    }

    fn new_archive_dir(&self) -> Result<(String, PathBuf, DateTime<Utc>), ArchiveError> {
        let backups = self.layout.backups_dir();
        fs::create_dir_all(&backups).map_err(|e| ArchiveError::io(&backups, e))?;
        loop {
            let now = Utc::now();
            let id = format::archive_id_for(now);
            let root = backups.join(&id);
            match fs::create_dir(&root) {
                Ok(()) => return Ok((id, root, now)),
                // two backups inside the same millisecond
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    thread::sleep(Duration::from_millis(2));
                }
                Err(e) => return Err(ArchiveError::io(&root, e)),
            }
        }
    }

    fn fill_archive(
        &self,
        id: &str,
        root: &Path,
        created_at: DateTime<Utc>,
    ) -> Result<BackupArchive, ArchiveError> {
        let mut categories = Vec::new();

        // Store: checkpoint and snapshot inside one quiesce window.
        let store_copy = root.join(STORE_FILE);
        let (store_sha256, checkpoint_complete) = if self.config.settings().store_enabled {
            let checkpoint = {
                let _quiesce = self.store.quiesce();
                let checkpoint = self.store.checkpoint()?;
                self.store.snapshot_into(&store_copy)?;
                checkpoint
            };
            let complete =
                !checkpoint.busy && checkpoint.checkpointed_frames >= checkpoint.log_frames;
            if !complete {
                warn!(
                    log_frames = checkpoint.log_frames,
                    checkpointed_frames = checkpoint.checkpointed_frames,
                    "checkpoint incomplete; snapshot taken from the WAL-inclusive view"
                );
            }
            let sha =
                fsutil::sha256_file(&store_copy).map_err(|e| ArchiveError::io(&store_copy, e))?;
            fsutil::write_checksum(&store_copy, &sha)
                .map_err(|e| ArchiveError::io(&store_copy, e))?;
            categories.push((Category::Store, 1));
            (Some(sha), complete)
        } else {
            warn!("store disabled; archive will not contain a store file");
            (None, false)
        };

        let core_tables_present = if store_sha256.is_some() {
            match format::probe_store_copy(&store_copy) {
                Ok(n) => {
                    if n < CORE_TABLES.len() {
                        warn!(
                            present = n,
                            expected = CORE_TABLES.len(),
                            "core tables missing from store copy"
                        );
                    }
                    n
                }
                Err(e) => {
                    error!(error = %e, "store copy failed its structural probe");
                    0
                }
            }
        } else {
            0
        };

        let projects = self.projects_dir();
        categories.push(self.copy_dir_category(
            Category::Projects,
            &projects,
            &root.join(paths::PROJECTS_DIR),
            format::is_project_file,
        ));

        // Key material is the decryption root; a missing or failed copy aborts.
        let key_dir = self.layout.key_dir();
        if !key_dir.is_dir() {
            return Err(ArchiveError::MissingKeyMaterial(key_dir));
        }
        let expected = fsutil::dir_stats(&key_dir).0 as usize;
        if expected == 0 {
            return Err(ArchiveError::MissingKeyMaterial(key_dir));
        }
        let keys = fsutil::copy_tree(&key_dir, &root.join(paths::KEY_DIR), |_| true)
            .map_err(|e| ArchiveError::io(&key_dir, e))?;
        if keys != expected {
            return Err(ArchiveError::io(
                &key_dir,
                io::Error::other(format!("copied {keys} of {expected} key files")),
            ));
        }
        categories.push((Category::KeyMaterial, keys));

        categories.push(self.copy_files_category(
            Category::AppConfig,
            &[(self.layout.app_properties(), paths::APP_PROPERTIES_FILE)],
            root,
        ));
        categories.push(self.copy_files_category(
            Category::ReportBlob,
            &[
                (self.layout.report_blob(), paths::REPORT_BLOB_FILE),
                (self.layout.report_blob_backup(), paths::REPORT_BLOB_BACKUP_FILE),
            ],
            root,
        ));
        categories.push(self.copy_dir_category(
            Category::Drafts,
            &self.layout.drafts_dir(),
            &root.join(paths::DRAFTS_DIR),
            |_| true,
        ));
        categories.push(self.copy_dir_category(
            Category::Signatures,
            &self.layout.signatures_dir(),
            &root.join(paths::SIGNATURES_DIR),
            |_| true,
        ));
        categories.push(self.copy_files_category(
            Category::Supplementary,
            &[
                (self.layout.master_key_file(), paths::MASTER_KEY_FILE),
                (self.layout.config_properties(), paths::CONFIG_PROPERTIES_FILE),
            ],
            root,
        ));

        let digests = format::digest_tree(root).map_err(|e| ArchiveError::io(root, e))?;
        let manifest = Manifest {
            id: id.to_string(),
            created_at,
            format: ArchiveFormat::Current,
            store_sha256: store_sha256.clone(),
            core_tables_present,
            categories: categories.clone(),
            digests,
        };
        manifest.write(root)?;

        Ok(BackupArchive {
            id: id.to_string(),
            root: root.to_path_buf(),
            created_at,
            store_sha256,
            checkpoint_complete,
            core_tables_present,
            categories,
        })
    }

    /// Optional directory category. Failures are logged, never raised.
    fn copy_dir_category(
        &self,
        category: Category,
        src: &Path,
        dst: &Path,
        filter: impl Fn(&Path) -> bool,
    ) -> (Category, usize) {
        if !src.is_dir() {
            debug!(%category, path = %src.display(), "nothing to back up");
            return (category, 0);
        }
        match fsutil::copy_tree(src, dst, filter) {
            Ok(n) => {
                debug!(%category, files = n, "category backed up");
                (category, n)
            }
            Err(e) => {
                warn!(%category, path = %src.display(), error = %e, "category backup failed");
                (category, 0)
            }
        }
    }

    /// Optional single-file category. Failures are logged, never raised.
    fn copy_files_category(
        &self,
        category: Category,
        files: &[(PathBuf, &str)],
        root: &Path,
    ) -> (Category, usize) {
        let mut copied = 0;
        for (src, name) in files {
            match fsutil::copy_if_exists(src, &root.join(name)) {
                Ok(true) => copied += 1,
                Ok(false) => debug!(%category, path = %src.display(), "absent; skipped"),
                Err(e) => {
                    warn!(%category, path = %src.display(), error = %e, "file backup failed")
                }
            }
        }
        (category, copied)
    }

    /// Keep the `keep_last` newest complete archives and delete the rest.
    ///
    /// Incomplete archives (no store file or no key material) never count
    /// toward `keep_last`. Up to `keep_last` of them are kept, and only while
    /// they are newer than the oldest complete archive kept.
    pub fn prune(&self, keep_last: usize) -> usize {
        let archives = match self.archive_dirs() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "cannot enumerate archives for pruning");
                return 0;
            }
        };
        let (mut complete_kept, mut incomplete_kept) = (0, 0);
        let mut doomed = Vec::new();
        for (id, path) in archives {
            if format::is_complete(&path) {
                if complete_kept < keep_last {
                    complete_kept += 1;
                    continue;
                }
            } else if complete_kept < keep_last && incomplete_kept < keep_last {
                incomplete_kept += 1;
                continue;
            }
            doomed.push((id, path));
        }
        let mut removed = 0;
        for (id, path) in doomed {
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(archive = %id, "old backup removed");
                    removed += 1;
                }
                Err(e) => warn!(archive = %id, error = %e, "cannot remove old backup"),
            }
        }
        removed
    }

    /// Archive directories, newest first.
    fn archive_dirs(&self) -> io::Result<Vec<(String, PathBuf)>> {
        let backups = self.layout.backups_dir();
        if !backups.is_dir() {
            return Ok(Vec::new());
        }
        let mut out: Vec<(String, PathBuf)> = fs::read_dir(&backups)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                name.starts_with(format::ARCHIVE_PREFIX)
                    .then(|| (name, e.path()))
            })
            .collect();
        out.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(out)
    }

    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, ArchiveError> {
        let dirs = self
            .archive_dirs()
            .map_err(|e| ArchiveError::io(&self.layout.backups_dir(), e))?;
        Ok(dirs
            .into_iter()
            .map(|(id, path)| {
                let (file_count, total_bytes) = fsutil::dir_stats(&path);
                BackupInfo {
                    created_at: format::parse_archive_id(&id),
                    complete: format::is_complete(&path),
                    id,
                    path,
                    file_count,
                    total_bytes,
                }
            })
            .collect())
    }

    /// Read-only check of an archive; never touches live data.
    pub fn verify_backup(&self, archive: &Path) -> Result<ArchiveVerification, ArchiveError> {
        format::verify(archive)
    }
}
