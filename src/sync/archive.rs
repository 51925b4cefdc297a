//! Zip packing and unpacking of working directories.
//!
//! Both directions are synchronous and meant to run on a blocking thread.

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::SyncError;

const JUNK_FILES: &[&str] = &[".DS_Store", "Thumbs.db"];
const JUNK_DIRS: &[&str] = &["__MACOSX"];
const VCS_DIR: &str = ".git";

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SyncError + '_ {
    move |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn is_junk(name: &str) -> bool {
    JUNK_FILES.contains(&name)
}

// ── Packing ──────────────────────────────────────────────────────────

/// Pack `root` into an in-memory zip. Skips `.git/`, OS junk files and
/// symlinks. Entry names are relative, `/`-separated, and directories end
/// with `/`.
pub fn pack_dir(root: &Path) -> Result<Vec<u8>, SyncError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && e.file_name() == VCS_DIR));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            SyncError::Io {
                path,
                source: e.into(),
            }
        })?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }
        if entry.file_name().to_str().is_some_and(is_junk) {
            continue;
        }

        let Some(name) = entry_name(root, entry.path()) else {
            continue;
        };
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(mode_of(entry.path(), file_type.is_dir()));

        if file_type.is_dir() {
            writer.add_directory(format!("{}/", name), options)?;
        } else {
            writer.start_file(name, options)?;
            let mut file = fs::File::open(entry.path()).map_err(io_err(entry.path()))?;
            std::io::copy(&mut file, &mut writer).map_err(io_err(entry.path()))?;
        }
    }

    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(unix)]
fn mode_of(path: &Path, is_dir: bool) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::symlink_metadata(path)
        .map(|m| m.permissions().mode() & 0o777)
        .unwrap_or(if is_dir { 0o755 } else { 0o644 })
}

#[cfg(not(unix))]
fn mode_of(_path: &Path, is_dir: bool) -> u32 {
    if is_dir { 0o755 } else { 0o644 }
}

// ── Unpacking ────────────────────────────────────────────────────────

/// Resolve an archive entry name to a path relative to the target.
///
/// `Ok(None)` means the entry is skipped (junk, or the root itself). Any
/// name that could land outside the target is an error.
pub fn safe_entry_path(name: &str) -> Result<Option<PathBuf>, SyncError> {
    let normalized = name.replace('\\', "/");
    let unsafe_entry = || SyncError::UnsafeEntry {
        name: name.to_string(),
    };

    if normalized.starts_with('/') {
        return Err(unsafe_entry());
    }
    // Windows drive prefix, e.g. `C:/`
    if normalized.len() >= 2 && normalized.as_bytes()[1] == b':' {
        return Err(unsafe_entry());
    }

    let mut path = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(unsafe_entry()),
            p => path.push(p),
        }
    }

    let first = path.components().next();
    if let Some(Component::Normal(first)) = first {
        if JUNK_DIRS.iter().any(|d| first == *d) {
            return Ok(None);
        }
    }
    match path.file_name().and_then(|f| f.to_str()) {
        None => Ok(None),
        Some(f) if is_junk(f) => Ok(None),
        Some(_) => Ok(Some(path)),
    }
}

/// Unpack `bytes` into `dest`, creating it. Every entry name is checked
/// before anything is written, so an unsafe archive leaves `dest` empty.
/// Returns the number of files written.
pub fn unpack_into(bytes: &[u8], dest: &Path) -> Result<usize, SyncError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let mut plan = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        let is_symlink = file.unix_mode().is_some_and(|m| m & S_IFMT == S_IFLNK);
        if let Some(rel) = safe_entry_path(file.name())? {
            if !is_symlink {
                plan.push((i, rel));
            }
        }
    }

    fs::create_dir_all(dest).map_err(io_err(dest))?;

    let mut written = 0;
    for (i, rel) in plan {
        let mut file = archive.by_index(i)?;
        let target = dest.join(&rel);
        if file.is_dir() {
            fs::create_dir_all(&target).map_err(io_err(&target))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents).map_err(io_err(&target))?;
        let mut out = fs::File::create(&target).map_err(io_err(&target))?;
        out.write_all(&contents).map_err(io_err(&target))?;
        set_mode(&target, file.unix_mode());
        written += 1;
    }
    Ok(written)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        let perms = fs::Permissions::from_mode(mode & 0o777);
        if let Err(e) = fs::set_permissions(path, perms) {
            tracing::debug!(path = %path.display(), error = %e, "could not restore file mode");
        }
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) {}
