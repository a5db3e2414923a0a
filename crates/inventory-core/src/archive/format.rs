//! On-disk archive layout: categories, format detection, manifest and the
//! read-only verification shared by backup, restore and `verify_backup`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use super::ArchiveError;
use crate::credential::sanitize;
use crate::fsutil;
use crate::paths::{
    self, APP_PROPERTIES_FILE, CONFIG_PROPERTIES_FILE, DRAFTS_DIR, KEY_DIR, LEGACY_DIR,
    MASTER_KEY_FILE, PROJECTS_DIR, REPORT_BLOB_BACKUP_FILE, REPORT_BLOB_FILE, SIGNATURES_DIR,
    STORE_FILE,
};
use crate::store::recovery::{self, Probe};
use crate::store::schema::{self, CORE_TABLES};

pub const ARCHIVE_PREFIX: &str = "backup_";
pub const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const PROJECT_EXTENSION: &str = "xlsx";

/// One kind of artifact carried by an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Store,
    KeyMaterial,
    Projects,
    AppConfig,
    ReportBlob,
    Drafts,
    Signatures,
    Supplementary,
    Legacy,
}

impl Category {
    /// Archive-relative entries that make up this category.
    pub fn entries(self) -> &'static [&'static str] {
        match self {
            Category::Store => &[STORE_FILE],
            Category::KeyMaterial => &[KEY_DIR],
            Category::Projects => &[PROJECTS_DIR],
            Category::AppConfig => &[APP_PROPERTIES_FILE],
            Category::ReportBlob => &[REPORT_BLOB_FILE, REPORT_BLOB_BACKUP_FILE],
            Category::Drafts => &[DRAFTS_DIR],
            Category::Signatures => &[SIGNATURES_DIR],
            Category::Supplementary => &[MASTER_KEY_FILE, CONFIG_PROPERTIES_FILE],
            Category::Legacy => &[LEGACY_DIR],
        }
    }

    pub fn is_present_in(self, archive: &Path) -> bool {
        self.entries().iter().any(|e| archive.join(e).exists())
    }

    /// Category an archive-relative entry (`security/encryption.key`) belongs to.
    pub fn owning(entry: &str) -> Option<Category> {
        let head = entry.split('/').next()?;
        ALL_CATEGORIES
            .iter()
            .copied()
            .find(|c| c.entries().contains(&head))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Store => "store",
            Category::KeyMaterial => "key material",
            Category::Projects => "project files",
            Category::AppConfig => "application config",
            Category::ReportBlob => "report blob",
            Category::Drafts => "drafts",
            Category::Signatures => "signatures",
            Category::Supplementary => "supplementary keys/config",
            Category::Legacy => "legacy records",
        };
        f.write_str(name)
    }
}

/// Archive generations this build can restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    /// Store file plus checksum sidecar at the root.
    Current,
    /// Older archives: flat exported records under `legacy/`, no store file.
    LegacyFlatFile,
}

impl ArchiveFormat {
    pub fn detect(archive: &Path) -> Option<Self> {
        if archive.join(STORE_FILE).is_file() {
            Some(ArchiveFormat::Current)
        } else if archive.join(LEGACY_DIR).is_dir() {
            Some(ArchiveFormat::LegacyFlatFile)
        } else {
            None
        }
    }
}

/// Store file and key material both present.
pub fn is_complete(archive: &Path) -> bool {
    archive.join(STORE_FILE).is_file() && archive.join(KEY_DIR).is_dir()
}

/// `.xlsx` (any case), a safe name, and not an Office lock file.
pub fn is_project_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(PROJECT_EXTENSION))
        .unwrap_or(false);
    ext_ok && !name.starts_with("~$") && sanitize::is_safe_filename(name)
}

pub fn archive_id_for(now: DateTime<Utc>) -> String {
    format!("{ARCHIVE_PREFIX}{}", now.format(ARCHIVE_TIMESTAMP_FORMAT))
}

/// Timestamp encoded in an archive directory name.
pub fn parse_archive_id(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(ARCHIVE_PREFIX)?;
    NaiveDateTime::parse_from_str(stamp, ARCHIVE_TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Summary written next to the artifacts of every archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub format: ArchiveFormat,
    pub store_sha256: Option<String>,
    pub core_tables_present: usize,
    pub categories: Vec<(Category, usize)>,
    /// SHA-256 of every archived file, keyed by `/`-separated relative path.
    #[serde(default)]
    pub digests: BTreeMap<String, String>,
}

impl Manifest {
    /// Write the manifest and its own `.sha256` sidecar.
    pub fn write(&self, archive: &Path) -> Result<(), ArchiveError> {
        let path = archive.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| ArchiveError::io(&path, io::Error::other(e)))?;
        fsutil::write_atomic(&path, &bytes).map_err(|e| ArchiveError::io(&path, e))?;
        let digest = fsutil::sha256_file(&path).map_err(|e| ArchiveError::io(&path, e))?;
        fsutil::write_checksum(&path, &digest).map_err(|e| ArchiveError::io(&path, e))?;
        Ok(())
    }

    /// `None` for archives without a manifest or with an unreadable one.
    pub fn read(archive: &Path) -> Option<Self> {
        let path = archive.join(MANIFEST_FILE);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable manifest");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChecksumStatus {
    Verified,
    /// No sidecar; nothing to compare against.
    Missing,
    Mismatch { expected: String, actual: String },
}

/// An archived file whose content no longer matches the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestMismatch {
    pub entry: String,
    pub expected: String,
    /// `None` when the file is gone.
    pub actual: Option<String>,
}

impl DigestMismatch {
    pub fn category(&self) -> Option<Category> {
        Category::owning(&self.entry)
    }

    /// Store file or key material: restoring either would break the live data.
    pub fn is_critical(&self) -> bool {
        matches!(
            self.category(),
            Some(Category::Store) | Some(Category::KeyMaterial)
        )
    }

    pub fn into_error(self, archive: &Path) -> ArchiveError {
        ArchiveError::ChecksumMismatch {
            path: archive.join(&self.entry),
            expected: self.expected,
            actual: self.actual.unwrap_or_else(|| "missing".to_string()),
        }
    }
}

/// Read-only assessment of an archive.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveVerification {
    pub archive: PathBuf,
    pub format: Option<ArchiveFormat>,
    pub complete: bool,
    pub checksum: Option<ChecksumStatus>,
    /// Manifest against its sidecar; `None` without a manifest.
    pub manifest_checksum: Option<ChecksumStatus>,
    pub digest_mismatches: Vec<DigestMismatch>,
    pub probe_ok: Option<bool>,
    pub core_tables_present: usize,
    pub categories_present: Vec<Category>,
}

impl ArchiveVerification {
    /// Restorable without an integrity refusal.
    pub fn is_restorable(&self) -> bool {
        let manifest_ok = !matches!(self.manifest_checksum, Some(ChecksumStatus::Mismatch { .. }));
        let artifacts_ok = !self.digest_mismatches.iter().any(DigestMismatch::is_critical);
        manifest_ok
            && artifacts_ok
            && match self.format {
                Some(ArchiveFormat::Current) => {
                    !matches!(self.checksum, Some(ChecksumStatus::Mismatch { .. }))
                        && self.probe_ok == Some(true)
                }
                Some(ArchiveFormat::LegacyFlatFile) => true,
                None => false,
            }
    }
}

/// Compare `file` against its `.sha256` sidecar.
pub fn check_sidecar(file: &Path) -> Result<ChecksumStatus, ArchiveError> {
    let expected = fsutil::read_checksum(file)
        .map_err(|e| ArchiveError::io(&fsutil::checksum_path(file), e))?;
    let Some(expected) = expected else {
        return Ok(ChecksumStatus::Missing);
    };
    let actual = fsutil::sha256_file(file).map_err(|e| ArchiveError::io(file, e))?;
    if actual == expected {
        Ok(ChecksumStatus::Verified)
    } else {
        Ok(ChecksumStatus::Mismatch { expected, actual })
    }
}

/// Compare the store copy against its sidecar.
pub fn check_store_checksum(archive: &Path) -> Result<ChecksumStatus, ArchiveError> {
    check_sidecar(&archive.join(STORE_FILE))
}

/// Hash every file under `archive` except the manifest and root-level sidecars.
pub fn digest_tree(archive: &Path) -> io::Result<BTreeMap<String, String>> {
    let mut digests = BTreeMap::new();
    for entry in WalkDir::new(archive).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_entry(archive, entry.path()) else {
            continue;
        };
        let at_root = !rel.contains('/');
        if at_root && (rel == MANIFEST_FILE || rel.ends_with(".sha256")) {
            continue;
        }
        digests.insert(rel, fsutil::sha256_file(entry.path())?);
    }
    Ok(digests)
}

fn relative_entry(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

/// Re-hash every file the manifest lists. Files added after the fact are ignored.
pub fn check_digests(archive: &Path, manifest: &Manifest) -> Vec<DigestMismatch> {
    manifest
        .digests
        .iter()
        .filter_map(|(entry, expected)| {
            let actual = fsutil::sha256_file(&archive.join(entry)).ok();
            (actual.as_deref() != Some(expected.as_str())).then(|| DigestMismatch {
                entry: entry.clone(),
                expected: expected.clone(),
                actual,
            })
        })
        .collect()
}

/// Structural probe plus core-table presence on a store copy, opened
/// read-only. Returns the number of core tables found.
pub fn probe_store_copy(store: &Path) -> Result<usize, ArchiveError> {
    let (probe, conn) = recovery::probe_read_only(store).map_err(|e| {
        ArchiveError::StructuralProbe {
            path: store.to_path_buf(),
            reason: e.to_string(),
        }
    })?;
    if let Probe::Corrupt(reason) = probe {
        return Err(ArchiveError::StructuralProbe {
            path: store.to_path_buf(),
            reason,
        });
    }
    let Some(conn) = conn else {
        return Ok(0);
    };
    let present = schema::count_present(&conn, &CORE_TABLES).map_err(|e| {
        ArchiveError::StructuralProbe {
            path: store.to_path_buf(),
            reason: e.to_string(),
        }
    });
    drop(conn);
    // a read-only handle on a WAL-mode copy leaves empty side files behind
    for side in ["-wal", "-shm"] {
        let _ = fsutil::remove_if_exists(&paths::with_suffix(store, side));
    }
    present
}

pub fn verify(archive: &Path) -> Result<ArchiveVerification, ArchiveError> {
    if !archive.exists() {
        return Err(ArchiveError::NotFound(archive.to_path_buf()));
    }
    if !archive.is_dir() {
        return Err(ArchiveError::NotADirectory(archive.to_path_buf()));
    }
    let format = ArchiveFormat::detect(archive);
    let manifest_path = archive.join(MANIFEST_FILE);
    let (manifest_checksum, digest_mismatches) = if manifest_path.is_file() {
        let status = check_sidecar(&manifest_path)?;
        let mismatches = Manifest::read(archive)
            .map(|m| check_digests(archive, &m))
            .unwrap_or_default();
        (Some(status), mismatches)
    } else {
        (None, Vec::new())
    };
    let mut verification = ArchiveVerification {
        archive: archive.to_path_buf(),
        format,
        complete: is_complete(archive),
        checksum: None,
        manifest_checksum,
        digest_mismatches,
        probe_ok: None,
        core_tables_present: 0,
        categories_present: ALL_CATEGORIES
            .iter()
            .copied()
            .filter(|c| c.is_present_in(archive))
            .collect(),
    };
    if format == Some(ArchiveFormat::Current) {
        verification.checksum = Some(check_store_checksum(archive)?);
        match probe_store_copy(&archive.join(STORE_FILE)) {
            Ok(n) => {
                verification.probe_ok = Some(true);
                verification.core_tables_present = n;
            }
            Err(e) => {
                warn!(archive = %archive.display(), error = %e, "archive store copy failed probe");
                verification.probe_ok = Some(false);
            }
        }
    }
    Ok(verification)
}

pub const ALL_CATEGORIES: [Category; 9] = [
    Category::Store,
    Category::KeyMaterial,
    Category::Projects,
    Category::AppConfig,
    Category::ReportBlob,
    Category::Drafts,
    Category::Signatures,
    Category::Supplementary,
    Category::Legacy,
];
