//! Filesystem helpers shared by the key vault, lockout persistence and archives.
//!
//! - Atomic writes (staging file, fsync, rename, fsync parent)
//! - Owner-only permissions and hidden attribute, best-effort
//! - Streaming SHA-256 and `.sha256` sidecars
//! - Verified copies and recursive directory copies

use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::paths::with_suffix;

/// Buffer size for file hashing (64KB)
const HASH_BUFFER_SIZE: usize = 65536;

pub const CHECKSUM_SUFFIX: &str = ".sha256";

/// Write `bytes` to `dest` so readers see either the old or the new content.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let staging = parent.join(format!(".{}.{}.staging", file_name, Uuid::new_v4()));
    let result = (|| {
        let mut file = File::create(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&staging, dest)?;
        fsync_dir(parent)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

pub fn fsync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Owner read/write only. Best-effort: failures are logged, never returned.
pub fn restrict_to_owner(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if path.is_dir() { 0o700 } else { 0o600 };
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!(path = %path.display(), error = %e, "cannot restrict permissions");
        }
    }
    #[cfg(not(unix))]
    debug!(path = %path.display(), "owner-only permissions rely on the profile directory ACL");
}

/// Mark a file hidden + system where the platform has such attributes.
pub fn set_hidden(path: &Path) {
    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::{
            SetFileAttributesW, FILE_ATTRIBUTE_HIDDEN, FILE_ATTRIBUTE_SYSTEM,
        };
        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let ok = unsafe {
            SetFileAttributesW(wide.as_ptr(), FILE_ATTRIBUTE_HIDDEN | FILE_ATTRIBUTE_SYSTEM)
        };
        if ok == 0 {
            warn!(path = %path.display(), "cannot set hidden attribute");
        }
    }
    #[cfg(not(windows))]
    let _ = path;
}

/// Lowercase hex SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn checksum_path(target: &Path) -> PathBuf {
    with_suffix(target, CHECKSUM_SUFFIX)
}

/// Sidecar content is the bare lowercase hex digest.
pub fn write_checksum(target: &Path, digest: &str) -> io::Result<PathBuf> {
    let path = checksum_path(target);
    fs::write(&path, digest.to_ascii_lowercase())?;
    Ok(path)
}

/// `Ok(None)` when no sidecar exists.
pub fn read_checksum(target: &Path) -> io::Result<Option<String>> {
    let path = checksum_path(target);
    match fs::read_to_string(&path) {
        Ok(s) => Ok(Some(s.trim().to_ascii_lowercase())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Copy a file if it exists. `Ok(false)` when the source is absent.
pub fn copy_if_exists(src: &Path, dst: &Path) -> io::Result<bool> {
    if !src.is_file() {
        return Ok(false);
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    Ok(true)
}

/// Recursively copy files under `src` accepted by `filter` into `dst`,
/// preserving relative paths. Per-file failures are logged and skipped.
/// Returns the number of files copied.
pub fn copy_tree<F>(src: &Path, dst: &Path, filter: F) -> io::Result<usize>
where
    F: Fn(&Path) -> bool,
{
    if !src.is_dir() {
        return Ok(0);
    }
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || !filter(entry.path()) {
            continue;
        }
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = dst.join(rel);
        let result = target
            .parent()
            .map(fs::create_dir_all)
            .transpose()
            .and_then(|_| fs::copy(entry.path(), &target));
        match result {
            Ok(_) => {
                debug!(from = %entry.path().display(), to = %target.display(), "copied");
                copied += 1;
            }
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "copy failed; skipping file");
            }
        }
    }
    Ok(copied)
}

/// Recursive (file count, total bytes) of a directory.
pub fn dir_stats(dir: &Path) -> (u64, u64) {
    let mut files = 0u64;
    let mut bytes = 0u64;
    for entry in WalkDir::new(dir).into_iter().flatten() {
        if entry.file_type().is_file() {
            files += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    (files, bytes)
}

/// Remove a file if present; absence is not an error.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
