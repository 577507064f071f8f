//! Tar extractor.
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
//! Built on the `tar` crate's low-level `Entries`/`Entry` API, with every
//! filesystem mutation routed through `src/fsutil.rs` so rootless extraction
//! benefits from the ancestor-relaxing shim for free.
use crate::error::OciRepackError;
use crate::fsutil;
use crate::tar_model::{clean_archive_path_lenient, MapOptions};
use anyhow::{Context, Result};
use filetime::FileTime;
use nix::sys::stat::{Mode, SFlag};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";
const MAX_SYMLINK_DEPTH: u32 = 40;

/// What happened during an extraction that a caller (the layer pipeline,
/// a subsequent repack) needs to know about.
#[derive(Debug, Default)]
pub struct ExtractReport {
    /// Archive-relative paths where a hardlink was replaced with a symlink
    /// because the target filesystem could not create one (the
    /// hardlink fallback). A subsequent diff must not treat these as
    /// spuriously modified.
    pub hardlink_fallbacks: Vec<PathBuf>,
}

struct ParentMetaSnapshot {
    path: PathBuf,
    mode: u32,
    atime: FileTime,
    mtime: FileTime,
    xattrs: Vec<(std::ffi::OsString, Vec<u8>)>,
}

impl ParentMetaSnapshot {
    fn capture(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path)?;
        let atime = FileTime::from_last_access_time(&meta);
        let mtime = FileTime::from_last_modification_time(&meta);
        let mut xattrs = Vec::new();
        if let Ok(names) = fsutil::xattr_list(path) {
            for name in names {
                if let Ok(Some(value)) = fsutil::xattr_get(path, &name) {
                    xattrs.push((name, value));
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            mode: meta.permissions().mode(),
            atime,
            mtime,
            xattrs,
        })
    }

    fn restore(&self) {
        let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(self.mode));
        let _ = filetime::set_file_times(&self.path, self.atime, self.mtime);
        for (name, value) in &self.xattrs {
            let _ = fsutil::xattr_set(&self.path, name, value);
        }
    }
}

/// Extract `reader`'s tar stream onto `root`, applying `map`'s forward
/// (container→host) id mapping. Not atomic: a failed extraction may leave
/// `root` in a partial state; this is documented, not accidental.
pub fn extract<R: Read>(reader: R, root: &Path, map: &MapOptions) -> Result<ExtractReport> {
    let mut archive = tar::Archive::new(reader);
    let mut report = ExtractReport::default();
    let mut deferred_links: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut hardlink_targets: HashMap<PathBuf, PathBuf> = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_name = entry.path()?.to_path_buf();
        let rel = clean_archive_path_lenient(&raw_name.to_string_lossy());
        let (dir_part, basename) = match rel.parent() {
            Some(p) if p != Path::new("") => (p.to_path_buf(), rel.file_name().map(PathBuf::from)),
            _ => (PathBuf::new(), rel.file_name().map(PathBuf::from)),
        };
        let Some(basename) = basename else {
            continue;
        };
        let basename_str = basename.to_string_lossy().to_string();

        let resolved_dir = resolve_scoped_dir(root, &dir_part)?;
        let target_path = resolved_dir.join(&basename);

        let parent_snapshot = ParentMetaSnapshot::capture(&resolved_dir).ok();
        let outcome = process_entry(
            &mut entry,
            root,
            &resolved_dir,
            &target_path,
            &basename_str,
            map,
            &mut deferred_links,
            &mut hardlink_targets,
            &mut report,
        );
        if let Some(snapshot) = &parent_snapshot {
            snapshot.restore();
        }
        outcome?;
    }

    for (new_path, existing) in deferred_links {
        apply_hardlink(root, &existing, &new_path, &mut report)?;
    }

    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn process_entry<R: Read>(
    entry: &mut tar::Entry<R>,
    root: &Path,
    resolved_dir: &Path,
    target_path: &Path,
    basename: &str,
    map: &MapOptions,
    deferred_links: &mut Vec<(PathBuf, PathBuf)>,
    hardlink_targets: &mut HashMap<PathBuf, PathBuf>,
    report: &mut ExtractReport,
) -> Result<()> {
    if let Some(referent) = basename.strip_prefix(WHITEOUT_PREFIX) {
        if basename == WHITEOUT_OPAQUE {
            remove_directory_children(resolved_dir)?;
        } else {
            let referent_path = resolved_dir.join(referent);
            fsutil::remove_all(root, &referent_path)?;
        }
        return Ok(());
    }

    let header = entry.header().clone();
    let entry_type = header.entry_type();

    if let Ok(existing) = fs::symlink_metadata(target_path) {
        if !type_matches(existing.file_type(), entry_type) {
            fsutil::remove_all(root, target_path)?;
        }
    }

    match entry_type {
        tar::EntryType::Directory => {
            if fs::symlink_metadata(target_path).is_err() {
                fsutil::mkdir(root, target_path, header.mode().unwrap_or(0o755))?;
            }
        }
        tar::EntryType::Regular | tar::EntryType::Continuous => {
            fsutil::remove(root, target_path)?;
            let mut out = fsutil::create(root, target_path)?;
            let expected = header.size()?;
            let copied = std::io::copy(entry, &mut out)?;
            if copied != expected {
                return Err(OciRepackError::CorruptTar(format!(
                    "`{}` expected {expected} bytes, read {copied}",
                    target_path.display()
                ))
                .into());
            }
        }
        tar::EntryType::Symlink => {
            let link_target = entry
                .link_name()?
                .ok_or_else(|| OciRepackError::CorruptTar("symlink entry missing link name".into()))?;
            fsutil::remove(root, target_path)?;
            fsutil::symlink(root, &link_target, target_path)?;
        }
        tar::EntryType::Link => {
            let link_name = entry
                .link_name()?
                .ok_or_else(|| OciRepackError::CorruptTar("hardlink entry missing link name".into()))?;
            let existing_path = root.join(clean_archive_path_lenient(&link_name.to_string_lossy()));
            fsutil::remove(root, target_path)?;
            if existing_path.exists() || hardlink_targets.contains_key(&existing_path) {
                apply_hardlink(root, &existing_path, target_path, report)?;
            } else {
                deferred_links.push((target_path.to_path_buf(), existing_path));
            }
        }
        tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
            if map.rootless {
                log::warn!(
                    "skipping privileged device node `{}` in rootless mode",
                    target_path.display()
                );
                return Ok(());
            }
            let kind = match entry_type {
                tar::EntryType::Char => SFlag::S_IFCHR,
                tar::EntryType::Block => SFlag::S_IFBLK,
                _ => SFlag::S_IFIFO,
            };
            let mode = Mode::from_bits_truncate(header.mode().unwrap_or(0o600));
            let dev = nix::sys::stat::makedev(
                header.device_major()?.unwrap_or(0) as u64,
                header.device_minor()?.unwrap_or(0) as u64,
            );
            fsutil::remove(root, target_path)?;
            fsutil::mknod(root, target_path, kind, mode, dev)?;
        }
        other => {
            log::warn!("skipping unsupported tar entry type {other:?} at `{}`", target_path.display());
            return Ok(());
        }
    }

    hardlink_targets.insert(target_path.to_path_buf(), target_path.to_path_buf());
    restore_entry_metadata(root, target_path, &header, entry, map)?;
    Ok(())
}

fn restore_entry_metadata<R: Read>(
    root: &Path,
    target_path: &Path,
    header: &tar::Header,
    entry: &mut tar::Entry<R>,
    map: &MapOptions,
) -> Result<()> {
    let is_symlink = header.entry_type() == tar::EntryType::Symlink;
    if !is_symlink {
        if let Some(mode) = header.mode().ok() {
            fsutil::chmod(root, target_path, mode)?;
        }
    }

    let container_uid = header.uid().unwrap_or(0) as u32;
    let container_gid = header.gid().unwrap_or(0) as u32;
    let host_uid = map.uid_map.container_to_host(container_uid)?;
    let host_gid = map.gid_map.container_to_host(container_gid)?;
    fsutil::lchown(root, target_path, Some(host_uid), Some(host_gid))?;

    let mut mtime = header.mtime().unwrap_or(0) as i64;
    if mtime == 0 {
        mtime = now_unix();
    }
    let atime = mtime;
    let atime_ft = FileTime::from_unix_time(atime, 0);
    let mtime_ft = FileTime::from_unix_time(mtime, 0);
    fsutil::lutimes(root, target_path, atime_ft, mtime_ft)?;

    fsutil::xattr_clear(target_path).ok();
    if let Ok(exts) = entry.pax_extensions() {
        if let Some(exts) = exts {
            for ext in exts.flatten() {
                let Ok(key) = ext.key() else { continue };
                let Some(name) = key.strip_prefix("SCHILY.xattr.") else {
                    continue;
                };
                let value = ext.value_bytes();
                let result = fsutil::xattr_set(target_path, OsStr::new(name), value);
                if let Err(e) = result {
                    if map.rootless && is_privileged_xattr(name) {
                        log::warn!(
                            "failed to set privileged xattr `{name}` on `{}` in rootless mode: {e}",
                            target_path.display()
                        );
                    } else {
                        return Err(e);
                    }
                }
            }
        }
    }

    Ok(())
}

fn is_privileged_xattr(name: &str) -> bool {
    name == "security.capability" || name.starts_with("security.")
}

fn type_matches(existing: fs::FileType, entry_type: tar::EntryType) -> bool {
    match entry_type {
        tar::EntryType::Directory => existing.is_dir(),
        tar::EntryType::Symlink => existing.is_symlink(),
        tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::Link => {
            existing.is_file()
        }
        _ => true,
    }
}

fn remove_directory_children(dir: &Path) -> Result<()> {
    let Ok(read) = fs::read_dir(dir) else {
        return Ok(());
    };
    for child in read {
        let child = child?;
        fsutil::remove_all(dir, &child.path())?;
    }
    Ok(())
}

fn apply_hardlink(root: &Path, existing: &Path, new_path: &Path, report: &mut ExtractReport) -> Result<()> {
    fsutil::remove(root, new_path)?;
    match fsutil::link(root, existing, new_path) {
        Ok(()) => Ok(()),
        Err(_) => {
            let target = fs::canonicalize(existing).unwrap_or_else(|_| existing.to_path_buf());
            fsutil::symlink(root, &target, new_path)?;
            report.hardlink_fallbacks.push(
                new_path
                    .strip_prefix(root)
                    .unwrap_or(new_path)
                    .to_path_buf(),
            );
            Ok(())
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Resolve the directory portion of an archive path, component by
/// component, following symlinks but clamping any step that would land
/// outside `root` back to `root`. Missing
/// intermediate directories are created, since not every layer stream
/// enumerates every ancestor directory explicitly.
fn resolve_scoped_dir(root: &Path, rel_dir: &Path) -> Result<PathBuf> {
    let mut current = root.to_path_buf();
    for comp in rel_dir.components() {
        if let Component::Normal(name) = comp {
            current = step_component(root, &current, name, 0)?;
        }
    }
    Ok(current)
}

fn step_component(root: &Path, current: &Path, name: &OsStr, depth: u32) -> Result<PathBuf> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(OciRepackError::MaliciousBlob(
            "too many levels of symbolic links while resolving archive path".to_string(),
        )
        .into());
    }
    let candidate = current.join(name);
    match fs::symlink_metadata(&candidate) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let target = fs::read_link(&candidate)
                .with_context(|| format!("reading symlink `{}`", candidate.display()))?;
            let mut next = if target.is_absolute() {
                root.to_path_buf()
            } else {
                current.to_path_buf()
            };
            for tc in target.components() {
                match tc {
                    Component::RootDir | Component::Prefix(_) => next = root.to_path_buf(),
                    Component::CurDir => {}
                    Component::ParentDir => clamp_pop(&mut next, root),
                    Component::Normal(part) => {
                        next = step_component(root, &next, part, depth + 1)?;
                    }
                }
            }
            Ok(next)
        }
        _ => {
            if fs::symlink_metadata(&candidate).is_err() {
                fsutil::mkdir_all(root, &candidate, 0o755)?;
            }
            Ok(candidate)
        }
    }
}

fn clamp_pop(path: &mut PathBuf, root: &Path) {
    if path.as_path() != root {
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar_model::MapOptions;
    use std::io::Write;

    fn build_tar(entries: &[(&str, tar::EntryType, &[u8], Option<&str>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, kind, data, link) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            header.set_entry_type(*kind);
            header.set_mtime(1_700_000_000);
            if let Some(link) = link {
                header.set_link_name(link).unwrap();
            }
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn extracts_regular_file() {
        let td = tempfile::tempdir().unwrap();
        let data = build_tar(&[("hello.txt", tar::EntryType::Regular, b"hi", None)]);
        extract(&data[..], td.path(), &MapOptions::default()).unwrap();
        assert_eq!(fs::read(td.path().join("hello.txt")).unwrap(), b"hi");
    }

    #[test]
    fn applies_whiteout_removal() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("gone"), b"x").unwrap();
        let data = build_tar(&[(".wh.gone", tar::EntryType::Regular, b"", None)]);
        extract(&data[..], td.path(), &MapOptions::default()).unwrap();
        assert!(!td.path().join("gone").exists());
    }

    #[test]
    fn applies_opaque_whiteout_to_directory_children() {
        let td = tempfile::tempdir().unwrap();
        fs::create_dir(td.path().join("dir")).unwrap();
        fs::write(td.path().join("dir/child"), b"x").unwrap();
        let data = build_tar(&[("dir/.wh..wh..opq", tar::EntryType::Regular, b"", None)]);
        extract(&data[..], td.path(), &MapOptions::default()).unwrap();
        assert!(td.path().join("dir").exists());
        assert!(!td.path().join("dir/child").exists());
    }

    #[test]
    fn path_escape_via_dotdot_is_clamped_under_root() {
        let td = tempfile::tempdir().unwrap();
        let data = build_tar(&[("../../etc/passwd", tar::EntryType::Regular, b"x", None)]);
        extract(&data[..], td.path(), &MapOptions::default()).unwrap();
        assert!(td.path().join("etc/passwd").exists());
    }

    #[test]
    fn symlink_entries_are_recreated() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("real"), b"x").unwrap();
        let data = build_tar(&[("link", tar::EntryType::Symlink, b"", Some("real"))]);
        extract(&data[..], td.path(), &MapOptions::default()).unwrap();
        assert_eq!(fs::read_link(td.path().join("link")).unwrap(), PathBuf::from("real"));
    }

    #[test]
    fn forward_referenced_hardlink_is_deferred_and_applied() {
        let td = tempfile::tempdir().unwrap();
        let data = build_tar(&[
            ("b", tar::EntryType::Link, b"", Some("a")),
            ("a", tar::EntryType::Regular, b"payload", None),
        ]);
        extract(&data[..], td.path(), &MapOptions::default()).unwrap();
        assert_eq!(fs::read(td.path().join("b")).unwrap(), b"payload");
    }

    #[test]
    fn zero_mtime_defaults_to_current_clock() {
        let td = tempfile::tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(1);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, "f", &b"x"[..]).unwrap();
        let data = builder.into_inner().unwrap();

        extract(&data[..], td.path(), &MapOptions::default()).unwrap();
        let meta = fs::metadata(td.path().join("f")).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        assert!(mtime.unix_seconds() > 1_000_000_000);
    }
}
