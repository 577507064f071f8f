//! Filesystem-diff engine.
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
//! Walk→attribute manifest→compare→ordered delta stream. The snapshot walk
//! is `src/fsutil.rs`'s deterministic preorder `walk`; the compare step is a
//! merge-sort-by-path, mirroring `archive.rs`'s sorted-walk approach to
//! building a reproducible tar.
use crate::fsutil;
use crate::tar_model::{DeltaKind, DeltaRecord};
use anyhow::Result;
use openssl::sha::Sha256;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// The type tag carried by a [`SnapshotEntry`]; distinct from
/// [`crate::tar_model::EntryKind`] because a snapshot only needs to tell
/// entries with a different on-disk type apart, not hardlink from regular.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// One row of the sorted manifest produced by a directory walk:
/// `{path, type, size, mode, uid, gid, xattrs-hash, content-hash, mtime}`.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub path: PathBuf,
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub xattrs_hash: Option<[u8; 32]>,
    pub content_hash: Option<[u8; 32]>,
    /// Whole seconds, the granularity a tar mtime can represent. Nanosecond
    /// comparison, when requested, compares `mtime_nanos` instead.
    pub mtime_secs: i64,
    pub mtime_nanos: i64,
}

/// Walk `root` and produce its sorted manifest.
///
/// `root`'s own entry is never included: the manifest describes `root`'s
/// contents, matching the tar generator's archive-relative paths.
pub fn snapshot(root: &Path) -> Result<Vec<SnapshotEntry>> {
    let mut out = Vec::new();
    for entry in fsutil::walk(root)? {
        let meta = &entry.metadata;
        let kind = if meta.file_type().is_dir() {
            FileKind::Directory
        } else if meta.file_type().is_symlink() {
            FileKind::Symlink
        } else if meta.file_type().is_file() {
            FileKind::Regular
        } else {
            FileKind::Other
        };

        let content_hash = if kind == FileKind::Regular {
            Some(hash_file(&entry.path)?)
        } else {
            None
        };

        let xattrs_hash = hash_xattrs(&entry.path)?;

        out.push(SnapshotEntry {
            path: entry.rel_path,
            kind,
            size: if kind == FileKind::Regular { meta.size() } else { 0 },
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            xattrs_hash,
            content_hash,
            mtime_secs: meta.mtime(),
            mtime_nanos: meta.mtime_nsec(),
        });
    }
    // fsutil::walk already produces deterministic lexical preorder; the
    // diff algorithm only requires total-and-stable-by-path, which preorder
    // satisfies (a parent's path is always a strict prefix, hence sorts
    // before, its children's paths).
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

fn hash_xattrs(path: &Path) -> Result<Option<[u8; 32]>> {
    let names = match fsutil::xattr_list(path) {
        Ok(names) => names,
        Err(_) => return Ok(None),
    };
    if names.is_empty() {
        return Ok(None);
    }
    let mut sorted: Vec<_> = names.into_iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for name in sorted {
        if let Some(value) = fsutil::xattr_get(path, &name)? {
            hasher.update(name.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(&value);
            hasher.update(b"\0");
        }
    }
    Ok(Some(hasher.finish()))
}

/// Whether to compare timestamps at tar-granularity (whole seconds) or at
/// full nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeGranularity {
    TarSeconds,
    Nanosecond,
}

/// Merge-sort `old` and `new` by path and emit a [`DeltaRecord`] per path
/// present in either side whose key set differs, in ascending-path order
/// (which already satisfies the whiteout-before-addition and
/// opaque-before-siblings ordering contract, since `.wh.` sorts before
/// ordinary filename characters and a parent's path is always a strict
/// prefix of its children's).
pub fn diff(
    old: &[SnapshotEntry],
    new: &[SnapshotEntry],
    granularity: TimeGranularity,
) -> Vec<DeltaRecord> {
    let mut out = Vec::new();
    let mut i = 0;
    let mut j = 0;
    while i < old.len() || j < new.len() {
        let cmp = match (old.get(i), new.get(j)) {
            (Some(o), Some(n)) => o.path.cmp(&n.path),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => break,
        };
        match cmp {
            std::cmp::Ordering::Less => {
                let o = &old[i];
                out.push(DeltaRecord {
                    path: o.path.clone(),
                    kind: DeltaKind::Removed,
                    is_dir: o.kind == FileKind::Directory,
                });
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                let n = &new[j];
                out.push(DeltaRecord {
                    path: n.path.clone(),
                    kind: DeltaKind::Added,
                    is_dir: n.kind == FileKind::Directory,
                });
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                let o = &old[i];
                let n = &new[j];
                if entries_differ(o, n, granularity) {
                    out.push(DeltaRecord {
                        path: n.path.clone(),
                        kind: DeltaKind::Modified,
                        is_dir: n.kind == FileKind::Directory,
                    });
                }
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn entries_differ(o: &SnapshotEntry, n: &SnapshotEntry, granularity: TimeGranularity) -> bool {
    if o.kind != n.kind || o.mode != n.mode || o.uid != n.uid || o.gid != n.gid {
        return true;
    }
    if o.xattrs_hash != n.xattrs_hash {
        return true;
    }
    if o.kind == FileKind::Regular && (o.size != n.size || o.content_hash != n.content_hash) {
        return true;
    }
    match granularity {
        TimeGranularity::TarSeconds => o.mtime_secs != n.mtime_secs,
        TimeGranularity::Nanosecond => {
            o.mtime_secs != n.mtime_secs || o.mtime_nanos != n.mtime_nanos
        }
    }
}

/// Drop every delta whose path is equal to or descends from a mask path
/// (the mask filter).
pub fn mask_filter(deltas: Vec<DeltaRecord>, masks: &BTreeSet<PathBuf>) -> Vec<DeltaRecord> {
    deltas
        .into_iter()
        .filter(|d| !masks.iter().any(|m| d.path == *m || d.path.starts_with(m)))
        .collect()
}

/// Drop descendant `removed` entries of a removed directory: the parent
/// subsumes them. Must run after other filters.
pub fn simplify(deltas: Vec<DeltaRecord>) -> Vec<DeltaRecord> {
    let removed_dirs: Vec<&Path> = deltas
        .iter()
        .filter(|d| d.kind == DeltaKind::Removed && d.is_dir)
        .map(|d| d.path.as_path())
        .collect();
    deltas
        .into_iter()
        .filter(|d| {
            if d.kind != DeltaKind::Removed {
                return true;
            }
            !removed_dirs
                .iter()
                .any(|dir| d.path != *dir && d.path.starts_with(dir))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, kind: FileKind, mtime_secs: i64) -> SnapshotEntry {
        SnapshotEntry {
            path: PathBuf::from(path),
            kind,
            size: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            xattrs_hash: None,
            content_hash: None,
            mtime_secs,
            mtime_nanos: 0,
        }
    }

    #[test]
    fn diff_detects_added_and_removed() {
        let old = vec![entry("a", FileKind::Regular, 0)];
        let new = vec![entry("b", FileKind::Regular, 0)];
        let deltas = diff(&old, &new, TimeGranularity::TarSeconds);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].kind, DeltaKind::Removed);
        assert_eq!(deltas[0].path, PathBuf::from("a"));
        assert_eq!(deltas[1].kind, DeltaKind::Added);
        assert_eq!(deltas[1].path, PathBuf::from("b"));
    }

    #[test]
    fn diff_ignores_subsecond_changes_at_tar_granularity() {
        let mut old = entry("a", FileKind::Regular, 5);
        old.mtime_nanos = 0;
        let mut new = old.clone();
        new.mtime_nanos = 500_000_000;
        let deltas = diff(
            std::slice::from_ref(&old),
            std::slice::from_ref(&new),
            TimeGranularity::TarSeconds,
        );
        assert!(deltas.is_empty());
    }

    #[test]
    fn diff_detects_subsecond_changes_at_nanosecond_granularity() {
        let old = entry("a", FileKind::Regular, 5);
        let mut new = old.clone();
        new.mtime_nanos = 500_000_000;
        let deltas = diff(
            std::slice::from_ref(&old),
            std::slice::from_ref(&new),
            TimeGranularity::Nanosecond,
        );
        assert_eq!(deltas.len(), 1);
    }

    #[test]
    fn mask_filter_drops_descendants() {
        let deltas = vec![
            DeltaRecord {
                path: PathBuf::from("a/b"),
                kind: DeltaKind::Added,
                is_dir: false,
            },
            DeltaRecord {
                path: PathBuf::from("c"),
                kind: DeltaKind::Added,
                is_dir: false,
            },
        ];
        let masks: BTreeSet<PathBuf> = [PathBuf::from("a")].into_iter().collect();
        let out = mask_filter(deltas, &masks);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, PathBuf::from("c"));
    }

    #[test]
    fn simplify_subsumes_descendants_of_removed_directory() {
        let deltas = vec![
            DeltaRecord {
                path: PathBuf::from("d"),
                kind: DeltaKind::Removed,
                is_dir: true,
            },
            DeltaRecord {
                path: PathBuf::from("d/child"),
                kind: DeltaKind::Removed,
                is_dir: false,
            },
            DeltaRecord {
                path: PathBuf::from("d/child/grandchild"),
                kind: DeltaKind::Removed,
                is_dir: false,
            },
        ];
        let out = simplify(deltas);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, PathBuf::from("d"));
    }

    #[test]
    fn simplify_keeps_unrelated_removed_entries() {
        let deltas = vec![
            DeltaRecord {
                path: PathBuf::from("d"),
                kind: DeltaKind::Removed,
                is_dir: true,
            },
            DeltaRecord {
                path: PathBuf::from("e"),
                kind: DeltaKind::Removed,
                is_dir: false,
            },
        ];
        let out = simplify(deltas);
        assert_eq!(out.len(), 2);
    }
}
