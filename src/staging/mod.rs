//! Sandbox staging: incremental copy and fault-tolerant delete of
//! directory trees.
//!
//! Everything here is synchronous `std::fs` — deletions and copies are
//! blocking syscalls, so async callers wrap these in
//! `tokio::task::spawn_blocking`. Cancellation is polled on the shared
//! [`CancellationToken`] at directory/file granularity, not preemptively.
//!
//! Symlinks play the role of reparse points: they are removed as a single
//! unit and never traversed, which keeps the delete from following an alias
//! into another tree or looping through self-referential links.

use std::cmp::Reverse;
use std::fs;
use std::io;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use filetime::FileTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::StagingError;

/// Upper bound on the delete worker pool, whatever the machine reports.
const MAX_DELETE_WORKERS: usize = 8;

/// Recursively copies `source` into `target`, creating `target` if absent.
///
/// A file is copied only when the destination is missing or differs in size
/// or last-modified timestamp — a cheap incremental sync with no content
/// hashing. The source timestamp is preserved on the copy so an unchanged
/// tree produces zero writes on the next pass.
///
/// On cancellation the partially-copied state is left as-is.
pub fn copy_directory(
    source: &Path,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<(), StagingError> {
    if !source.is_dir() {
        return Err(StagingError::NotADirectory(source.to_path_buf()));
    }
    if cancel.is_cancelled() {
        return Err(StagingError::Canceled);
    }
    fs::create_dir_all(target)?;

    let mut subdirectories = Vec::new();
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            subdirectories.push(entry.file_name());
            continue;
        }

        if cancel.is_cancelled() {
            return Err(StagingError::Canceled);
        }
        let source_file = entry.path();
        let target_file = target.join(entry.file_name());
        if needs_copy(&source_file, &target_file)? {
            debug!("copying {}", source_file.display());
            let modified = fs::metadata(&source_file)?.modified()?;
            // A previous pass carries the source mode bits onto the target,
            // so an overwrite may hit a read-only file.
            match clear_read_only(&target_file) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            fs::copy(&source_file, &target_file)?;
            // Carry the source mtime so the next incremental pass sees the
            // pair as identical. The copy may itself be read-only (mode bits
            // travel with it), so set the timestamp by path rather than
            // through a write handle.
            filetime::set_file_mtime(&target_file, FileTime::from_system_time(modified))?;
        }
    }

    for name in subdirectories {
        copy_directory(&source.join(&name), &target.join(&name), cancel)?;
    }
    Ok(())
}

fn needs_copy(source: &Path, target: &Path) -> io::Result<bool> {
    let target_meta = match fs::metadata(target) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err),
    };
    let source_meta = fs::metadata(source)?;
    Ok(source_meta.len() != target_meta.len()
        || source_meta.modified()? != target_meta.modified()?)
}

/// Deletes a directory tree. No-op when `path` does not exist.
///
/// - `contents_only` keeps the root directory itself.
/// - A symlink root is removed as a unit without descending into it;
///   emptying a symlink root is rejected, since its "contents" belong to
///   the aliased tree.
/// - Content deletions run concurrently on a bounded worker pool sharing a
///   cooperative cancellation flag; the first failure cancels the siblings
///   unless `continue_on_content_delete_error` tolerates per-item failures.
/// - Emptied directories are removed deepest-first (descending path length),
///   so a child is always gone before its parent.
pub fn delete_directory(
    path: &Path,
    contents_only: bool,
    continue_on_content_delete_error: bool,
    cancel: &CancellationToken,
) -> Result<(), StagingError> {
    let root_meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    // A symlink root is never enumerated: deleting it means removing the
    // link itself, and emptying "its" contents would really empty the
    // aliased tree.
    if root_meta.file_type().is_symlink() {
        if contents_only {
            return Err(StagingError::NotADirectory(path.to_path_buf()));
        }
        fs::remove_file(path)?;
        return Ok(());
    }
    if !contents_only {
        clear_read_only(path)?;
    }

    // Enumerate with an explicit stack (no recursion, deep trees stay cheap).
    // Symlinked subdirectories count as content and are removed atomically.
    let mut contents: Vec<PathBuf> = Vec::new();
    let mut directories: Vec<PathBuf> = Vec::new();
    if !contents_only {
        directories.push(path.to_path_buf());
    }
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        if cancel.is_cancelled() {
            return Err(StagingError::Canceled);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let entry_path = entry.path();
            // DirEntry::file_type does not follow symlinks, so a link to a
            // directory lands in `contents`, not on the traversal stack.
            if entry.file_type()?.is_dir() {
                pending.push(entry_path.clone());
                directories.push(entry_path);
            } else {
                contents.push(entry_path);
            }
        }
    }

    info!(
        "deleting {} item(s) under {}",
        contents.len() + directories.len(),
        path.display()
    );
    delete_contents(
        path,
        contents,
        continue_on_content_delete_error,
        cancel,
    )?;

    // Children sort after their parent by path length, so deepest-first
    // removal never hits a non-empty directory.
    directories.sort_by_key(|dir| Reverse(dir.as_os_str().len()));
    for dir in directories {
        if cancel.is_cancelled() {
            return Err(StagingError::Canceled);
        }
        clear_read_only(&dir)?;
        if let Err(err) = fs::remove_dir(&dir) {
            if !continue_on_content_delete_error {
                return Err(err.into());
            }
            debug!("tolerating directory delete failure for {}: {err}", dir.display());
        }
    }
    Ok(())
}

/// Runs the concurrent content-deletion pass over `items`.
fn delete_contents(
    root: &Path,
    items: Vec<PathBuf>,
    continue_on_content_delete_error: bool,
    cancel: &CancellationToken,
) -> Result<(), StagingError> {
    if items.is_empty() {
        return Ok(());
    }

    let queue = Mutex::new(items);
    // Cooperative fail-fast: the first intolerable failure flips the flag
    // and records itself exactly once; siblings observe the flag and stop.
    let aborted = AtomicBool::new(false);
    let first_error: Mutex<Option<io::Error>> = Mutex::new(None);

    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DELETE_WORKERS);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if aborted.load(Ordering::Relaxed) || cancel.is_cancelled() {
                    return;
                }
                let item = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop();
                let Some(item) = item else { return };

                if let Err(err) = delete_entry(&item) {
                    if continue_on_content_delete_error {
                        debug!(
                            "tolerating content delete failure for {}: {err}",
                            item.display()
                        );
                    } else {
                        let mut slot =
                            first_error.lock().unwrap_or_else(PoisonError::into_inner);
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                        drop(slot);
                        aborted.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            });
        }
    });

    if cancel.is_cancelled() {
        return Err(StagingError::Canceled);
    }
    if let Some(source) = first_error
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
    {
        return Err(StagingError::AggregateDelete {
            root: root.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Deletes one content item: a file, or a symlink removed as a unit.
fn delete_entry(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.file_type().is_symlink() {
        clear_read_only(path)?;
    }
    fs::remove_file(path)
}

/// Deletes a single file if it exists, clearing the read-only attribute
/// first. No-op when the path is absent.
pub fn delete_file(path: &Path) -> Result<(), StagingError> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if !meta.file_type().is_symlink() {
                clear_read_only(path)?;
            }
            fs::remove_file(path)?;
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn clear_read_only(path: &Path) -> io::Result<()> {
    let meta = fs::metadata(path)?;
    let mut permissions = meta.permissions();
    if permissions.readonly() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            permissions.set_mode(permissions.mode() | 0o200);
        }
        #[cfg(not(unix))]
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

/// Returns `path` relative to `folder` when `folder` is a literal
/// path-separator-respecting prefix; otherwise `path` unchanged. Pure
/// string manipulation, never touches the disk.
///
/// `make_relative("/src/project/foo.c", "/src")` → `"project/foo.c"`,
/// `make_relative("/src/project/foo.c", "/specs")` → unchanged,
/// `make_relative("/src", "/src")` → `""`.
pub fn make_relative(path: &str, folder: &str) -> String {
    let path = normalize_separators(path);
    let folder = normalize_separators(folder);

    if !path.starts_with(&folder) {
        return path;
    }
    if path.len() == folder.len() {
        return String::new();
    }
    if folder.ends_with(MAIN_SEPARATOR) {
        return path[folder.len()..].to_string();
    }
    // The next character must be a separator, or the prefix match was only
    // partial (e.g. "/src/proj" against "/src/project/foo.c").
    if path.as_bytes()[folder.len()] == MAIN_SEPARATOR as u8 {
        return path[folder.len() + 1..].to_string();
    }
    path
}

fn normalize_separators(value: &str) -> String {
    if MAIN_SEPARATOR == '/' {
        value.replace('\\', "/")
    } else {
        value.replace('/', "\\")
    }
}
