use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "inventario";
pub const APP_NAME: &str = "inventory";

/// Environment override for the data directory.
pub const DATA_DIR_ENV: &str = "INVENTORY_DATA_DIR";

pub const STORE_FILE: &str = "inventario.db";
pub const KEY_DIR: &str = "security";
pub const KEY_FILE: &str = "encryption.key";
pub const MASTER_KEY_FILE: &str = "master.key";
pub const APP_PROPERTIES_FILE: &str = "application.properties";
pub const CONFIG_PROPERTIES_FILE: &str = "config.properties";
pub const REPORT_BLOB_FILE: &str = "reportes_mantenimiento.dat";
pub const REPORT_BLOB_BACKUP_FILE: &str = "reportes_mantenimiento.dat.bak";
pub const PROJECTS_DIR: &str = "excel";
pub const SIGNATURES_DIR: &str = "firmas";
pub const DRAFTS_DIR: &str = "borradores";
pub const LEGACY_DIR: &str = "legacy";
pub const BACKUPS_DIR: &str = "backups";
pub const LOCKOUT_FILE: &str = "lockout_state.json";

#[derive(Debug, thiserror::Error)]
#[error("cannot determine data directory")]
pub struct NoDataDir;

pub fn data_dir() -> Result<PathBuf, NoDataDir> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        if !override_path.trim().is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or(NoDataDir)?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Every file location the core reads or writes, derived from one data root.
///
/// The store file and the projects directory may be relocated by
/// configuration; everything else lives under `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    store_file: PathBuf,
    projects_dir: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            store_file: root.join(STORE_FILE),
            projects_dir: root.join(PROJECTS_DIR),
            root,
        }
    }

    /// Resolve the platform data directory (or `INVENTORY_DATA_DIR`).
    pub fn discover() -> Result<Self, NoDataDir> {
        Ok(Self::new(data_dir()?))
    }

    pub fn with_store_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_file = path.into();
        self
    }

    pub fn with_projects_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.projects_dir = path.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_file(&self) -> &Path {
        &self.store_file
    }

    pub fn store_dir(&self) -> &Path {
        self.store_file.parent().unwrap_or(&self.root)
    }

    pub fn wal_file(&self) -> PathBuf {
        with_suffix(&self.store_file, "-wal")
    }

    pub fn shm_file(&self) -> PathBuf {
        with_suffix(&self.store_file, "-shm")
    }

    pub fn key_dir(&self) -> PathBuf {
        self.root.join(KEY_DIR)
    }

    pub fn key_file(&self) -> PathBuf {
        self.key_dir().join(KEY_FILE)
    }

    pub fn master_key_file(&self) -> PathBuf {
        self.root.join(MASTER_KEY_FILE)
    }

    pub fn app_properties(&self) -> PathBuf {
        self.root.join(APP_PROPERTIES_FILE)
    }

    pub fn config_properties(&self) -> PathBuf {
        self.root.join(CONFIG_PROPERTIES_FILE)
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    pub fn report_blob(&self) -> PathBuf {
        self.root.join(REPORT_BLOB_FILE)
    }

    pub fn report_blob_backup(&self) -> PathBuf {
        self.root.join(REPORT_BLOB_BACKUP_FILE)
    }

    pub fn drafts_dir(&self) -> PathBuf {
        self.root.join(DRAFTS_DIR)
    }

    pub fn signatures_dir(&self) -> PathBuf {
        self.root.join(SIGNATURES_DIR)
    }

    /// Where flat-file records from old archives are restored to.
    pub fn legacy_import_dir(&self) -> PathBuf {
        self.root.join("legacy_import")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    /// Lockout bookkeeping lives outside `security/` so archives never carry it.
    pub fn lockout_file(&self) -> PathBuf {
        self.root.join(LOCKOUT_FILE)
    }
}

/// Append `suffix` to the file name of `path` (`a.db` + `-wal` = `a.db-wal`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}
