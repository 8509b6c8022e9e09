//! Utility functions shared by the store, scanner and reconciler
//!
//! ## Categories of Utilities
//!
//! ### File Operations
//! - Streaming SHA-256 hashing
//! - Metadata extraction that never follows symlinks
//! - Durable writes (temp file, fsync, rename, directory fsync)
//! - Permission and modification-time restore (cross-platform)
//! - Symbolic link creation and reading
//!
//! ### Path Helpers
//! - Slash-normalized relative paths for glob matching
//! - Junk-file detection
//!
//! ### Formatting
//! - Human-readable byte sizes

use crate::error::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::trace;

/// Read buffer for hashing and block I/O
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Desktop clutter that is neither tracked nor allowed to keep a directory alive
const JUNK_FILES: &[&str] = &["thumbs.db", ".ds_store", "desktop.ini"];

/// Calculate SHA-256 hash of file content
///
/// Streams the file through a fixed-size buffer, so memory use does not grow
/// with file size.
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    hash_reader(&mut file)
}

/// Hash everything a reader yields
pub fn hash_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; IO_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Filesystem metadata needed for fingerprints
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,
    /// Permission bits
    pub permissions: u32,
    /// Last modification time
    pub modified: DateTime<Utc>,
    /// Whether this is a symbolic link
    pub is_symlink: bool,
}

/// Metadata for `path` without following symlinks
pub fn get_file_metadata(path: &Path) -> Result<FileMetadata> {
    let metadata = fs::symlink_metadata(path)?;
    let modified = metadata.modified()?;

    Ok(FileMetadata {
        size: metadata.len(),
        permissions: get_permissions(&metadata),
        modified: DateTime::<Utc>::from(modified),
        is_symlink: metadata.file_type().is_symlink(),
    })
}

#[cfg(unix)]
fn get_permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(windows)]
fn get_permissions(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Set permissions (Windows only knows the read-only flag)
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Set the modification time of a regular file
pub fn set_modified(path: &Path, modified: DateTime<Utc>) -> Result<()> {
    let mtime = filetime::FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, mtime)?;
    Ok(())
}

/// fsync a directory so a rename inside it survives a crash
#[cfg(unix)]
pub fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

/// Directory fsync is not available on windows; renames are journaled by NTFS
#[cfg(windows)]
pub fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

/// Write `content` to `path` so that readers see either the old file or the
/// complete new one, and the new one is on stable storage before returning
pub fn durable_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    sync_dir(parent)?;
    trace!("Durably wrote {:?} ({} bytes)", path, content.len());
    Ok(())
}

/// Create a symlink (cross-platform)
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

/// Create a symlink (Windows)
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    let resolved = link.parent().map(|p| p.join(target)).unwrap_or_else(|| target.to_path_buf());
    if resolved.is_dir() {
        symlink_dir(target, link)?;
    } else {
        symlink_file(target, link)?;
    }
    Ok(())
}

/// Read symlink target
pub fn read_symlink(path: &Path) -> Result<PathBuf> {
    Ok(fs::read_link(path)?)
}

/// Bytes that stand for a symlink target in the content store
pub fn symlink_content(target: &Path) -> Vec<u8> {
    target.to_string_lossy().replace('\\', "/").into_bytes()
}

/// Whether a file name is desktop junk
pub fn is_junk_file(name: &str) -> bool {
    JUNK_FILES.iter().any(|junk| junk.eq_ignore_ascii_case(name))
}

/// Render a relative path with forward slashes for glob matching
pub fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Number of normal components in a path
pub fn path_depth(path: &Path) -> usize {
    path.components().filter(|c| matches!(c, Component::Normal(_))).count()
}

/// Shortened id for display
pub fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}

/// Format bytes as human-readable string
///
/// ```rust
/// use strata::format_bytes;
///
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
