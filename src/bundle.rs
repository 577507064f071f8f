//! Bundle metadata persistence.
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
//! `umoci.json` records a bundle's provenance (the manifest it was last
//! unpacked or repacked from, and the id-mapping options unpack/repack must
//! agree on); the paired `sha256_<manifest>.mtree` file is the attribute
//! manifest the diff engine produced at that point, replayed as the
//! "old" side of the next repack's diff. Both are plain JSON, not the BSD
//! `mtree(5)` format the filename alludes to — the name is kept for
//! familiarity with existing bundle layouts.
use crate::diff::{FileKind, SnapshotEntry};
use crate::digest::Digest;
use crate::tar_model::{IdMapRange, IdMapping};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const BUNDLE_METADATA_FILE: &str = "umoci.json";

/// A bundle's persisted provenance.
#[derive(Debug, Clone)]
pub struct BundleMetadata {
    pub source_manifest_digest: Digest,
    pub uid_map: IdMapping,
    pub gid_map: IdMapping,
    pub rootless: bool,
}

#[derive(Serialize, Deserialize)]
struct WireIdMapRange {
    container_id: u32,
    host_id: u32,
    size: u32,
}

#[derive(Serialize, Deserialize, Default)]
struct WireBundleMetadata {
    source_manifest_digest: String,
    #[serde(default)]
    uid_map: Vec<WireIdMapRange>,
    #[serde(default)]
    gid_map: Vec<WireIdMapRange>,
    #[serde(default)]
    rootless: bool,
}

fn to_wire_ranges(map: &IdMapping) -> Vec<WireIdMapRange> {
    map.ranges()
        .iter()
        .map(|r| WireIdMapRange {
            container_id: r.container_id,
            host_id: r.host_id,
            size: r.size,
        })
        .collect()
}

fn from_wire_ranges(ranges: Vec<WireIdMapRange>) -> IdMapping {
    IdMapping::new(
        ranges
            .into_iter()
            .map(|r| IdMapRange {
                container_id: r.container_id,
                host_id: r.host_id,
                size: r.size,
            })
            .collect(),
    )
}

/// Load a bundle's metadata, if `umoci.json` is present.
pub fn load(bundle_path: &Path) -> Result<Option<BundleMetadata>> {
    let path = bundle_path.join(BUNDLE_METADATA_FILE);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading `{}`", path.display())),
    };
    let wire: WireBundleMetadata =
        serde_json::from_slice(&raw).with_context(|| format!("parsing `{}`", path.display()))?;
    Ok(Some(BundleMetadata {
        source_manifest_digest: Digest::parse(&wire.source_manifest_digest)?,
        uid_map: from_wire_ranges(wire.uid_map),
        gid_map: from_wire_ranges(wire.gid_map),
        rootless: wire.rootless,
    }))
}

/// Persist a bundle's metadata, replacing any existing `umoci.json`.
pub fn save(bundle_path: &Path, meta: &BundleMetadata) -> Result<()> {
    fs::create_dir_all(bundle_path)
        .with_context(|| format!("creating bundle directory `{}`", bundle_path.display()))?;
    let wire = WireBundleMetadata {
        source_manifest_digest: meta.source_manifest_digest.to_string(),
        uid_map: to_wire_ranges(&meta.uid_map),
        gid_map: to_wire_ranges(&meta.gid_map),
        rootless: meta.rootless,
    };
    let path = bundle_path.join(BUNDLE_METADATA_FILE);
    let bytes = serde_json::to_vec_pretty(&wire).context("serializing bundle metadata")?;
    fs::write(&path, bytes).with_context(|| format!("writing `{}`", path.display()))
}

fn mtree_path(bundle_path: &Path, manifest_digest: &Digest) -> PathBuf {
    bundle_path.join(format!("sha256_{}.mtree", manifest_digest.hex()))
}

#[derive(Serialize, Deserialize)]
struct WireSnapshotEntry {
    path: PathBuf,
    kind: String,
    size: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    xattrs_hash: Option<String>,
    content_hash: Option<String>,
    mtime_secs: i64,
    mtime_nanos: i64,
}

fn kind_to_str(kind: FileKind) -> &'static str {
    match kind {
        FileKind::Regular => "regular",
        FileKind::Directory => "directory",
        FileKind::Symlink => "symlink",
        FileKind::Other => "other",
    }
}

fn kind_from_str(s: &str) -> FileKind {
    match s {
        "directory" => FileKind::Directory,
        "symlink" => FileKind::Symlink,
        "regular" => FileKind::Regular,
        _ => FileKind::Other,
    }
}

fn decode_hash(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str).context("decoding hash hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("hash is not 32 bytes"))
}

/// Persist the attribute manifest the diff engine produced for
/// `manifest_digest`'s rootfs.
pub fn save_mtree(
    bundle_path: &Path,
    manifest_digest: &Digest,
    entries: &[SnapshotEntry],
) -> Result<()> {
    fs::create_dir_all(bundle_path)
        .with_context(|| format!("creating bundle directory `{}`", bundle_path.display()))?;
    let wire: Vec<WireSnapshotEntry> = entries
        .iter()
        .map(|e| WireSnapshotEntry {
            path: e.path.clone(),
            kind: kind_to_str(e.kind).to_string(),
            size: e.size,
            mode: e.mode,
            uid: e.uid,
            gid: e.gid,
            xattrs_hash: e.xattrs_hash.map(hex::encode),
            content_hash: e.content_hash.map(hex::encode),
            mtime_secs: e.mtime_secs,
            mtime_nanos: e.mtime_nanos,
        })
        .collect();
    let path = mtree_path(bundle_path, manifest_digest);
    let bytes = serde_json::to_vec_pretty(&wire).context("serializing mtree snapshot")?;
    fs::write(&path, bytes).with_context(|| format!("writing `{}`", path.display()))
}

/// Load the attribute manifest for `manifest_digest`, if present. A bundle
/// that has never been snapshotted under this digest (the first repack of
/// a hand-assembled bundle with no prior unpack) diffs against an empty
/// rootfs.
pub fn load_mtree(bundle_path: &Path, manifest_digest: &Digest) -> Result<Vec<SnapshotEntry>> {
    let path = mtree_path(bundle_path, manifest_digest);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading `{}`", path.display())),
    };
    let wire: Vec<WireSnapshotEntry> =
        serde_json::from_slice(&raw).with_context(|| format!("parsing `{}`", path.display()))?;
    wire.into_iter()
        .map(|w| {
            Ok(SnapshotEntry {
                path: w.path,
                kind: kind_from_str(&w.kind),
                size: w.size,
                mode: w.mode,
                uid: w.uid,
                gid: w.gid,
                xattrs_hash: w.xattrs_hash.map(|h| decode_hash(&h)).transpose()?,
                content_hash: w.content_hash.map(|h| decode_hash(&h)).transpose()?,
                mtime_secs: w.mtime_secs,
                mtime_nanos: w.mtime_nanos,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar_model::IdMapRange;

    #[test]
    fn metadata_roundtrip() {
        let td = tempfile::tempdir().unwrap();
        let meta = BundleMetadata {
            source_manifest_digest: Digest::sha256_of(b"manifest"),
            uid_map: IdMapping::new(vec![IdMapRange {
                container_id: 0,
                host_id: 100000,
                size: 65536,
            }]),
            gid_map: IdMapping::identity(),
            rootless: true,
        };
        save(td.path(), &meta).unwrap();
        let loaded = load(td.path()).unwrap().unwrap();
        assert_eq!(loaded.source_manifest_digest, meta.source_manifest_digest);
        assert_eq!(loaded.uid_map.ranges().len(), 1);
        assert!(loaded.rootless);
    }

    #[test]
    fn missing_metadata_is_none() {
        let td = tempfile::tempdir().unwrap();
        assert!(load(td.path()).unwrap().is_none());
    }

    #[test]
    fn mtree_roundtrip() {
        let td = tempfile::tempdir().unwrap();
        let digest = Digest::sha256_of(b"manifest");
        let entries = vec![SnapshotEntry {
            path: PathBuf::from("a/b"),
            kind: FileKind::Regular,
            size: 3,
            mode: 0o644,
            uid: 0,
            gid: 0,
            xattrs_hash: Some([7u8; 32]),
            content_hash: Some([9u8; 32]),
            mtime_secs: 123,
            mtime_nanos: 456,
        }];
        save_mtree(td.path(), &digest, &entries).unwrap();
        let loaded = load_mtree(td.path(), &digest).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].path, PathBuf::from("a/b"));
        assert_eq!(loaded[0].xattrs_hash, Some([7u8; 32]));
        assert_eq!(loaded[0].content_hash, Some([9u8; 32]));
    }

    #[test]
    fn missing_mtree_is_empty() {
        let td = tempfile::tempdir().unwrap();
        let digest = Digest::sha256_of(b"manifest");
        assert!(load_mtree(td.path(), &digest).unwrap().is_empty());
    }
}
