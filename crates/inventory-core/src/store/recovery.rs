//! Startup snapshot and corruption recovery for the store file.
//!
//! The snapshot taken before open is only *staged*. It becomes the
//! `.prestart` copy once the freshly opened store probes clean, so the
//! `.prestart` file is always the last state known to be good.

use chrono::Utc;
use rusqlite::{ffi, Connection, OpenFlags};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::fsutil;
use crate::paths::{with_suffix, Layout};

const PRESTART_SUFFIX: &str = ".prestart";
const STAGED_SUFFIX: &str = ".prestart.pending";

/// Result of the quick structural probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Healthy,
    Corrupt(String),
}

impl Probe {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Probe::Healthy)
    }
}

/// `PRAGMA quick_check` on an open connection. "Not a database" and
/// "malformed" errors are reported as `Corrupt`, other errors propagate.
pub fn probe_connection(conn: &Connection) -> rusqlite::Result<Probe> {
    let result = conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0));
    match result {
        Ok(s) if s.eq_ignore_ascii_case("ok") => Ok(Probe::Healthy),
        Ok(s) => Ok(Probe::Corrupt(s)),
        Err(e) if is_corruption(&e) => Ok(Probe::Corrupt(e.to_string())),
        Err(e) => Err(e),
    }
}

/// Probe a store file on a dedicated connection. A missing file is healthy
/// (it will be created empty).
pub fn probe_file(path: &Path) -> rusqlite::Result<Probe> {
    if !path.exists() {
        return Ok(Probe::Healthy);
    }
    let conn = match Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ) {
        Ok(c) => c,
        Err(e) if is_corruption(&e) => return Ok(Probe::Corrupt(e.to_string())),
        Err(e) => return Err(e),
    };
    probe_connection(&conn)
}

/// Read-only probe used on archive copies; never touches the file.
pub fn probe_read_only(path: &Path) -> rusqlite::Result<(Probe, Option<Connection>)> {
    let conn = match Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ) {
        Ok(c) => c,
        Err(e) if is_corruption(&e) => return Ok((Probe::Corrupt(e.to_string()), None)),
        Err(e) => return Err(e),
    };
    let probe = probe_connection(&conn)?;
    Ok((probe, Some(conn)))
}

pub fn is_corruption(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ffi::ErrorCode::NotADatabase | ffi::ErrorCode::DatabaseCorrupt
        ),
        _ => false,
    }
}

pub fn prestart_path(layout: &Layout) -> PathBuf {
    with_suffix(layout.store_file(), PRESTART_SUFFIX)
}

fn staged_path(layout: &Layout) -> PathBuf {
    with_suffix(layout.store_file(), STAGED_SUFFIX)
}

/// A pre-start copy waiting for the probe verdict.
#[derive(Debug)]
pub struct StagedSnapshot {
    store: PathBuf,
    wal: Option<PathBuf>,
}

/// Copy the store (and WAL if present) to the staging slot. Best-effort:
/// returns `None` when there is nothing to copy or the copy fails.
pub fn stage_snapshot(layout: &Layout) -> Option<StagedSnapshot> {
    let src = layout.store_file();
    if !src.is_file() {
        return None;
    }
    let store = staged_path(layout);
    if let Err(e) = fs::copy(src, &store) {
        warn!(path = %src.display(), error = %e, "pre-start snapshot failed");
        return None;
    }
    let wal_src = layout.wal_file();
    let wal = if wal_src.is_file() {
        let dst = with_suffix(&store, "-wal");
        match fs::copy(&wal_src, &dst) {
            Ok(_) => Some(dst),
            Err(e) => {
                warn!(path = %wal_src.display(), error = %e, "pre-start WAL snapshot failed");
                let _ = fs::remove_file(&store);
                return None;
            }
        }
    } else {
        None
    };
    Some(StagedSnapshot { store, wal })
}

impl StagedSnapshot {
    /// The store probed clean: this snapshot becomes the known-good copy.
    pub fn promote(self, layout: &Layout) {
        let target = prestart_path(layout);
        let target_wal = with_suffix(&target, "-wal");
        if let Err(e) = fs::rename(&self.store, &target) {
            warn!(path = %target.display(), error = %e, "cannot promote pre-start snapshot");
            self.discard();
            return;
        }
        let result = match &self.wal {
            Some(wal) => fs::rename(wal, &target_wal),
            None => fsutil::remove_if_exists(&target_wal).map(|_| ()),
        };
        if let Err(e) = result {
            warn!(path = %target_wal.display(), error = %e, "cannot promote pre-start WAL");
        }
    }

    /// The snapshot captured a corrupt file; throw it away.
    pub fn discard(self) {
        let _ = fsutil::remove_if_exists(&self.store);
        if let Some(wal) = &self.wal {
            let _ = fsutil::remove_if_exists(wal);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The last known-good snapshot replaced the corrupt file.
    RestoredSnapshot { corrupt_copy: PathBuf },
    /// No snapshot existed; the store starts empty.
    FreshStore { corrupt_copy: PathBuf },
}

/// Move the corrupt store aside, drop its side files, and put the known-good
/// snapshot in its place if one exists.
pub fn recover(layout: &Layout, reason: &str) -> io::Result<RecoveryOutcome> {
    let store = layout.store_file();
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let corrupt_copy = with_suffix(store, &format!(".corrupt.{stamp}"));
    error!(path = %store.display(), reason, "store failed integrity probe; recovering");

    if store.exists() {
        fs::rename(store, &corrupt_copy)?;
    }
    fsutil::remove_if_exists(&layout.wal_file())?;
    fsutil::remove_if_exists(&layout.shm_file())?;

    let snapshot = prestart_path(layout);
    if snapshot.is_file() {
        fs::copy(&snapshot, store)?;
        let snapshot_wal = with_suffix(&snapshot, "-wal");
        if snapshot_wal.is_file() {
            fs::copy(&snapshot_wal, layout.wal_file())?;
        }
        info!(
            from = %snapshot.display(),
            corrupt_copy = %corrupt_copy.display(),
            "restored last known-good snapshot"
        );
        Ok(RecoveryOutcome::RestoredSnapshot { corrupt_copy })
    } else {
        error!(
            corrupt_copy = %corrupt_copy.display(),
            "no known-good snapshot; starting with an empty store"
        );
        Ok(RecoveryOutcome::FreshStore { corrupt_copy })
    }
}
