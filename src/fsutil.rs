//! Unprivileged filesystem shim.
//!
//! Copyright (C) Microsoft Corporation.
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful,
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU General Public License for more details.
//!
//! You should have received a copy of the GNU General Public License
//! along with this program.  If not, see <https://www.gnu.org/licenses/>.
//!
//! Simulates `CAP_DAC_READ_SEARCH` for an unprivileged process: every
//! primitive here first tries the plain syscall, and only if that fails on
//! a permission-denied ancestor does it climb the path, temporarily adding
//! `rwx` to every ancestor it can change, retry once, and restore every
//! touched ancestor's mode and timestamps on the way back out — success,
//! failure, or otherwise.
use crate::error::OciRepackError;
use anyhow::{Context, Result};
use filetime::FileTime;
use nix::errno::Errno;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{AccessFlags, UnlinkatFlags};
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// A single entry produced by [`walk`], in deterministic preorder lexical
/// order.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Path relative to the walk root.
    pub rel_path: PathBuf,
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Metadata as seen by `lstat` (does not follow the entry itself, if a
    /// symlink).
    pub metadata: fs::Metadata,
}

fn is_permission_denied(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == Errno::EACCES as i32 || code == Errno::EPERM as i32
    )
}

/// Ancestor directories from `root` down to (and including) `target`'s
/// parent, nearest-to-root first.
fn ancestor_chain(root: &Path, target: &Path) -> Vec<PathBuf> {
    let mut chain = Vec::new();
    let Ok(rel) = target.strip_prefix(root) else {
        return chain;
    };
    let mut cur = root.to_path_buf();
    let mut components: Vec<_> = rel.components().collect();
    components.pop(); // drop the target's own basename
    for comp in components {
        cur.push(comp);
        chain.push(cur.clone());
    }
    chain
}

struct RelaxedAncestor {
    path: PathBuf,
    mode: u32,
    atime: FileTime,
    mtime: FileTime,
}

/// RAII guard restoring every ancestor this call relaxed, in reverse order,
/// on every exit path (including panics, via `Drop`).
struct AncestorGuard(Vec<RelaxedAncestor>);

impl Drop for AncestorGuard {
    fn drop(&mut self) {
        for a in self.0.drain(..).rev() {
            let _ = fs::set_permissions(&a.path, fs::Permissions::from_mode(a.mode));
            let _ = filetime::set_file_times(&a.path, a.atime, a.mtime);
        }
    }
}

fn relax_chain(root: &Path, target: &Path) -> std::io::Result<AncestorGuard> {
    let mut relaxed = Vec::new();
    for dir in ancestor_chain(root, target) {
        let accessible = nix::unistd::access(&dir, AccessFlags::X_OK).is_ok();
        if accessible {
            continue;
        }
        let meta = fs::symlink_metadata(&dir)?;
        let original_mode = meta.permissions().mode();
        let atime = FileTime::from_last_access_time(&meta);
        let mtime = FileTime::from_last_modification_time(&meta);
        fs::set_permissions(&dir, fs::Permissions::from_mode(original_mode | 0o700))?;
        relaxed.push(RelaxedAncestor {
            path: dir,
            mode: original_mode,
            atime,
            mtime,
        });
    }
    Ok(AncestorGuard(relaxed))
}

/// Run `op(path)`; if it fails with a permission-denied error, relax every
/// inaccessible ancestor of `path` (below `root`), retry once, then restore
/// every ancestor's mode and timestamps regardless of the outcome.
pub fn with_relaxed_ancestors<T>(
    root: &Path,
    path: &Path,
    mut op: impl FnMut(&Path) -> std::io::Result<T>,
) -> Result<T> {
    match op(path) {
        Ok(v) => Ok(v),
        Err(e) if is_permission_denied(&e) => {
            let guard = relax_chain(root, path).map_err(|e| {
                OciRepackError::PermissionDenied(format!(
                    "failed to relax ancestors of `{}`: {e}",
                    path.display()
                ))
            })?;
            let result = op(path);
            drop(guard);
            result.with_context(|| format!("operating on `{}`", path.display()))
        }
        Err(e) => Err(e).with_context(|| format!("operating on `{}`", path.display())),
    }
}

/// `lstat`.
pub fn lstat(root: &Path, path: &Path) -> Result<fs::Metadata> {
    with_relaxed_ancestors(root, path, |p| fs::symlink_metadata(p))
}

/// `readlink`.
pub fn readlink(root: &Path, path: &Path) -> Result<PathBuf> {
    with_relaxed_ancestors(root, path, |p| fs::read_link(p))
}

/// Create a symlink at `path` pointing at `target`.
pub fn symlink(root: &Path, target: &Path, path: &Path) -> Result<()> {
    with_relaxed_ancestors(root, path, |p| std::os::unix::fs::symlink(target, p))
}

/// Create a hardlink at `new_path` pointing at `existing`.
pub fn link(root: &Path, existing: &Path, new_path: &Path) -> Result<()> {
    with_relaxed_ancestors(root, new_path, |p| fs::hard_link(existing, p))
}

/// Open `path` for reading.
pub fn open(root: &Path, path: &Path) -> Result<File> {
    with_relaxed_ancestors(root, path, |p| File::open(p))
}

/// Create (or truncate) `path` for writing.
pub fn create(root: &Path, path: &Path) -> Result<File> {
    with_relaxed_ancestors(root, path, |p| File::create(p))
}

/// Materialize the directory listing of `path` as a sorted `Vec`, rather
/// than a lazy stream, so the shim never leaves a half-consumed iterator
/// holding a directory fd open across a panic-equivalent unwind.
pub fn readdir(root: &Path, path: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut entries: Vec<fs::DirEntry> =
        with_relaxed_ancestors(root, path, |p| fs::read_dir(p)?.collect())?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

/// `mkdir`.
pub fn mkdir(root: &Path, path: &Path, mode: u32) -> Result<()> {
    with_relaxed_ancestors(root, path, |p| {
        fs::create_dir(p)?;
        fs::set_permissions(p, fs::Permissions::from_mode(mode))
    })
}

/// `mkdir -p`.
pub fn mkdir_all(root: &Path, path: &Path, mode: u32) -> Result<()> {
    with_relaxed_ancestors(root, path, |p| {
        fs::create_dir_all(p)?;
        fs::set_permissions(p, fs::Permissions::from_mode(mode))
    })
}

/// Remove a file or empty directory. Absence is not an error (idempotence
/// contract).
pub fn remove(root: &Path, path: &Path) -> Result<()> {
    match with_relaxed_ancestors(root, path, |p| {
        if p.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false) {
            fs::remove_dir(p)
        } else {
            fs::remove_file(p)
        }
    }) {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove a file or a directory tree. Absence is not an error.
pub fn remove_all(root: &Path, path: &Path) -> Result<()> {
    match with_relaxed_ancestors(root, path, fs::remove_dir_all) {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(_) => {
            // Might be a non-directory; fall back to remove_file.
            match with_relaxed_ancestors(root, path, fs::remove_file) {
                Ok(()) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(e),
            }
        }
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.downcast_ref::<std::io::Error>()
        .map(|io| io.kind() == std::io::ErrorKind::NotFound)
        .unwrap_or(false)
}

/// `chmod`, following symlinks.
pub fn chmod(root: &Path, path: &Path, mode: u32) -> Result<()> {
    with_relaxed_ancestors(root, path, |p| {
        fs::set_permissions(p, fs::Permissions::from_mode(mode))
    })
}

/// Set mtime/atime, following symlinks.
pub fn chtimes(root: &Path, path: &Path, atime: FileTime, mtime: FileTime) -> Result<()> {
    with_relaxed_ancestors(root, path, |p| filetime::set_file_times(p, atime, mtime))
}

/// Set mtime/atime without following symlinks.
pub fn lutimes(root: &Path, path: &Path, atime: FileTime, mtime: FileTime) -> Result<()> {
    with_relaxed_ancestors(root, path, |p| {
        filetime::set_symlink_file_times(p, atime, mtime)
    })
}

/// `lchown`.
pub fn lchown(root: &Path, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    with_relaxed_ancestors(root, path, |p| {
        nix::unistd::fchownat(
            None,
            p,
            uid.map(nix::unistd::Uid::from_raw),
            gid.map(nix::unistd::Gid::from_raw),
            nix::unistd::FchownatFlags::NoFollowSymlink,
        )
        .map_err(nix_to_io)
    })
}

/// Create a device node, fifo, or other special file.
pub fn mknod(root: &Path, path: &Path, kind: SFlag, mode: Mode, dev: u64) -> Result<()> {
    with_relaxed_ancestors(root, path, |p| {
        nix::sys::stat::mknod(p, kind, mode, dev).map_err(nix_to_io)
    })
}

/// Remove a directory entry via `unlinkat`, honoring whether it names a
/// directory; used by the extractor's type-change handling.
pub fn unlink(root: &Path, path: &Path, is_dir: bool) -> Result<()> {
    let flags = if is_dir {
        UnlinkatFlags::RemoveDir
    } else {
        UnlinkatFlags::NoRemoveDir
    };
    with_relaxed_ancestors(root, path, |p| {
        nix::unistd::unlinkat(None, p, flags).map_err(nix_to_io)
    })
}

fn nix_to_io(e: Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// `chmod`, ignoring the no-such-file case, used when a caller's best
/// effort at restoring a mode races a concurrent delete.
pub fn chmod_best_effort(path: &Path, mode: u32) {
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

/// List extended attribute names on `path` (no symlink-follow).
pub fn xattr_list(path: &Path) -> Result<Vec<std::ffi::OsString>> {
    Ok(xattr::list(path)
        .with_context(|| format!("listing xattrs on `{}`", path.display()))?
        .collect())
}

/// Read a single extended attribute's value.
pub fn xattr_get(path: &Path, name: &std::ffi::OsStr) -> Result<Option<Vec<u8>>> {
    xattr::get(path, name).with_context(|| format!("reading xattr on `{}`", path.display()))
}

/// Set a single extended attribute.
pub fn xattr_set(path: &Path, name: &std::ffi::OsStr, value: &[u8]) -> Result<()> {
    xattr::set(path, name, value).with_context(|| format!("setting xattr on `{}`", path.display()))
}

/// Remove a single extended attribute, if present.
pub fn xattr_remove(path: &Path, name: &std::ffi::OsStr) -> Result<()> {
    match xattr::remove(path, name) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("removing xattr on `{}`", path.display()))
        }
    }
}

/// Remove every extended attribute on `path`.
pub fn xattr_clear(path: &Path) -> Result<()> {
    for name in xattr_list(path)? {
        xattr_remove(path, &name)?;
    }
    Ok(())
}

/// Preorder, deterministic-lexical-order walk of `root`.
pub fn walk(root: &Path) -> Result<Vec<WalkEntry>> {
    let mut out = Vec::new();
    walk_into(root, root, &mut out)?;
    Ok(out)
}

fn walk_into(root: &Path, dir: &Path, out: &mut Vec<WalkEntry>) -> Result<()> {
    let entries = readdir(root, dir)?;
    for entry in entries {
        let path = entry.path();
        let rel_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let metadata = lstat(root, &path)?;
        let is_dir = metadata.is_dir();
        out.push(WalkEntry {
            rel_path,
            path: path.clone(),
            metadata,
        });
        if is_dir {
            walk_into(root, &path, out)?;
        }
    }
    Ok(())
}
