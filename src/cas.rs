//! Content-addressable blob store over an OCI image layout directory.
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
use crate::digest::Digest;
use crate::error::OciRepackError;
use crate::verify::VerifiedReader;
use anyhow::{Context, Result};
use fs2::FileExt;
use oci_spec::image::{ImageIndex, ImageIndexBuilder, OciLayout, OciLayoutBuilder, SCHEMA_VERSION};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

const OCI_LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";
const SCRATCH_PREFIX: &str = ".umoci-";

/// An open OCI image layout directory, with an exclusive advisory lock on
/// its own scratch area for the lifetime of this handle.
pub struct Cas {
    root: PathBuf,
    scratch_dir: PathBuf,
    lock: File,
    owner_uid: u32,
    owner_gid: u32,
}

impl Cas {
    /// Open an existing layout, validating `oci-layout`'s declared version,
    /// the `blobs/` directory, and `index.json`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let layout_path = root.join(OCI_LAYOUT_FILE);
        let raw = fs::read(&layout_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OciRepackError::InvalidLayout(format!(
                    "`{}` is not an OCI image layout: missing {OCI_LAYOUT_FILE}",
                    root.display()
                ))
                .into()
            } else {
                anyhow::Error::from(e)
                    .context(format!("reading `{}`", layout_path.display()))
            }
        })?;
        let layout: OciLayout = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing `{}`", layout_path.display()))?;
        if layout.image_layout_version() != "1.0.0" {
            return Err(OciRepackError::InvalidLayout(format!(
                "unsupported oci-layout version `{}`",
                layout.image_layout_version()
            ))
            .into());
        }
        let blobs_dir = root.join(BLOBS_DIR);
        if !blobs_dir.is_dir() {
            return Err(OciRepackError::InvalidLayout(format!(
                "`{}` is not a directory",
                blobs_dir.display()
            ))
            .into());
        }
        let index_path = root.join(INDEX_FILE);
        if !index_path.is_file() {
            return Err(OciRepackError::InvalidLayout(format!(
                "`{}` is not a regular file",
                index_path.display()
            ))
            .into());
        }
        Self::claim(root)
    }

    /// Create a fresh, empty layout at `root`, which must not already exist
    /// or must be empty.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating layout directory `{}`", root.display()))?;
        if fs::read_dir(&root)?.next().is_some() {
            return Err(OciRepackError::InvalidLayout(format!(
                "`{}` already exists and is not empty",
                root.display()
            ))
            .into());
        }
        let layout = OciLayoutBuilder::default()
            .image_layout_version("1.0.0")
            .build()
            .expect("oci-layout always builds");
        write_json_atomic(&root, &root.join(OCI_LAYOUT_FILE), &layout)?;

        for algo in ["sha256"] {
            fs::create_dir_all(root.join(BLOBS_DIR).join(algo))?;
        }

        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .manifests(Vec::new())
            .build()
            .expect("empty index always builds");
        write_json_atomic(&root, &root.join(INDEX_FILE), &index)?;

        Self::claim(root)
    }

    fn claim(root: PathBuf) -> Result<Self> {
        let scratch_dir = root.join(format!("{SCRATCH_PREFIX}{}", process::id()));
        fs::create_dir_all(&scratch_dir)
            .with_context(|| format!("creating scratch dir `{}`", scratch_dir.display()))?;
        let lock_path = scratch_dir.join("lock");
        let lock = File::create(&lock_path)
            .with_context(|| format!("creating lock file `{}`", lock_path.display()))?;
        lock.try_lock_exclusive().map_err(|_| {
            OciRepackError::InvalidLayout(format!(
                "layout `{}` is locked by another process",
                root.display()
            ))
        })?;
        Ok(Self {
            root,
            scratch_dir,
            lock,
            owner_uid: nix::unistd::geteuid().as_raw(),
            owner_gid: nix::unistd::getegid().as_raw(),
        })
    }

    /// The layout's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(digest.algorithm())
            .join(digest.hex())
    }

    /// Stream `reader` to a scratch file while hashing it, then atomically
    /// rename into place under `blobs/sha256/<hex>`. Idempotent: writing an
    /// already-present blob is a fast no-op that still drains `reader`'s
    /// digest for the caller's benefit (the on-disk copy is left alone).
    pub fn put_blob(&self, mut reader: impl Read) -> Result<(Digest, u64)> {
        fs::create_dir_all(self.root.join(BLOBS_DIR).join("sha256"))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.scratch_dir)
            .context("creating scratch file for blob write")?;
        let mut hasher = crate::digest::Sha256Accumulator::new();
        let mut size = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            size += n as u64;
        }
        let digest = hasher.finish();
        let dest = self.blob_path(&digest);
        if dest.exists() {
            return Ok((digest, size));
        }
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("fsyncing scratch file for blob `{digest}`"))?;
        if nix::unistd::geteuid().is_root() {
            nix::unistd::chown(
                tmp.path(),
                Some(nix::unistd::Uid::from_raw(self.owner_uid)),
                Some(nix::unistd::Gid::from_raw(self.owner_gid)),
            )
            .with_context(|| format!("chowning blob `{digest}` to engine owner"))?;
        }
        tmp.persist(&dest)
            .map_err(|e| e.error)
            .with_context(|| format!("persisting blob `{}`", dest.display()))?;
        Ok((digest, size))
    }

    /// Whether a blob for `digest` exists on disk.
    pub fn stat_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Open a digest- and size-verified reader over a stored blob.
    /// `expected_size` defaults to the on-disk file size when `None`.
    pub fn get_blob(
        &self,
        digest: &Digest,
        expected_size: Option<u64>,
    ) -> Result<VerifiedReader<File>> {
        let path = self.blob_path(digest);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OciRepackError::NotFound(format!("blob `{digest}` not found")).into()
            } else {
                anyhow::Error::from(e).context(format!("opening blob `{}`", path.display()))
            }
        })?;
        let size = match expected_size {
            Some(s) => s,
            None => file.metadata()?.len(),
        };
        Ok(VerifiedReader::new(file, digest.clone(), Some(size)))
    }

    /// Delete a blob. Idempotent: absence is not an error.
    pub fn delete_blob(&self, digest: &Digest) -> Result<()> {
        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting blob `{digest}`")),
        }
    }

    /// List every blob digest currently stored.
    pub fn list_blobs(&self) -> Result<Vec<Digest>> {
        let mut out = Vec::new();
        let algo_dir = self.root.join(BLOBS_DIR).join("sha256");
        if !algo_dir.is_dir() {
            return Ok(out);
        }
        for entry in fs::read_dir(&algo_dir)? {
            let entry = entry?;
            if let Some(hex) = entry.file_name().to_str() {
                if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                    out.push(Digest::new("sha256", hex.to_string()));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Read `index.json`. A missing index is an `InvalidLayout` error, not
    /// `NotFound`: every valid layout has one.
    pub fn get_index(&self) -> Result<ImageIndex> {
        let path = self.root.join(INDEX_FILE);
        let raw = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OciRepackError::InvalidLayout(format!("missing `{INDEX_FILE}`")).into()
            } else {
                anyhow::Error::from(e).context(format!("reading `{}`", path.display()))
            }
        })?;
        serde_json::from_slice(&raw).with_context(|| format!("parsing `{}`", path.display()))
    }

    /// Atomically replace `index.json`.
    pub fn put_index(&self, index: &ImageIndex) -> Result<()> {
        write_json_atomic(&self.scratch_dir, &self.root.join(INDEX_FILE), index)
    }

    /// Read and parse an arbitrary JSON blob (manifest, config, ...).
    pub fn get_json_blob<T: serde::de::DeserializeOwned>(&self, digest: &Digest) -> Result<T> {
        let mut reader = self.get_blob(digest, None)?;
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        reader.close()?;
        if raw.is_empty() {
            return Err(OciRepackError::InvalidLayout(format!(
                "blob `{digest}` is empty JSON"
            ))
            .into());
        }
        serde_json::from_slice(&raw).with_context(|| format!("parsing blob `{digest}` as JSON"))
    }

    /// Serialize and store a JSON blob, returning its descriptor digest and
    /// size.
    pub fn put_json_blob<T: serde::Serialize>(&self, value: &T) -> Result<(Digest, u64)> {
        let bytes = serde_json::to_vec(value).context("serializing JSON blob")?;
        self.put_blob(&bytes[..])
    }

    /// Best-effort garbage collection of stale scratch directories left by
    /// processes that died without cleaning up. Never blocks: a scratch dir
    /// still locked by a live process is skipped, not waited on.
    pub fn clean(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(SCRATCH_PREFIX) {
                continue;
            }
            if entry.path() == self.scratch_dir {
                continue;
            }
            let lock_path = entry.path().join("lock");
            let Ok(lock) = File::open(&lock_path) else {
                // No lock file at all: abandoned mid-creation, safe to remove.
                let _ = fs::remove_dir_all(entry.path());
                removed += 1;
                continue;
            };
            match lock.try_lock_exclusive() {
                Ok(()) => {
                    FileExt::unlock(&lock)?;
                    drop(lock);
                    let _ = fs::remove_dir_all(entry.path());
                    removed += 1;
                }
                Err(_) => continue, // held by a live process; leave it alone
            }
        }
        Ok(removed)
    }
}

impl Drop for Cas {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.scratch_dir);
    }
}

fn write_json_atomic<T: serde::Serialize>(scratch_dir: &Path, dest: &Path, value: &T) -> Result<()> {
    fs::create_dir_all(scratch_dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(scratch_dir)
        .with_context(|| format!("creating scratch file for `{}`", dest.display()))?;
    serde_json::to_writer_pretty(&mut tmp, value)
        .with_context(|| format!("serializing `{}`", dest.display()))?;
    tmp.flush()?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("fsyncing `{}`", dest.display()))?;
    tmp.persist(dest)
        .map_err(|e| e.error)
        .with_context(|| format!("persisting `{}`", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_open_roundtrip() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("layout");
        {
            let cas = Cas::create(&path).unwrap();
            assert!(cas.get_index().unwrap().manifests().is_empty());
        }
        let cas = Cas::open(&path).unwrap();
        assert!(path.join(OCI_LAYOUT_FILE).is_file());
    }

    #[test]
    fn open_rejects_non_layout_directory() {
        let td = tempfile::tempdir().unwrap();
        assert!(Cas::open(td.path()).is_err());
    }

    #[test]
    fn put_blob_is_idempotent_and_content_addressed() {
        let td = tempfile::tempdir().unwrap();
        let cas = Cas::create(td.path().join("layout")).unwrap();
        let (d1, size1) = cas.put_blob(&b"hello world"[..]).unwrap();
        let (d2, size2) = cas.put_blob(&b"hello world"[..]).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(size1, size2);
        assert!(cas.stat_blob(&d1));
    }

    #[test]
    fn get_blob_verifies_and_defaults_size_from_disk() {
        let td = tempfile::tempdir().unwrap();
        let cas = Cas::create(td.path().join("layout")).unwrap();
        let (digest, _) = cas.put_blob(&b"payload"[..]).unwrap();
        let mut reader = cas.get_blob(&digest, None).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        reader.close().unwrap();
        assert_eq!(out, b"payload");
    }

    #[test]
    fn delete_blob_is_idempotent() {
        let td = tempfile::tempdir().unwrap();
        let cas = Cas::create(td.path().join("layout")).unwrap();
        let (digest, _) = cas.put_blob(&b"x"[..]).unwrap();
        cas.delete_blob(&digest).unwrap();
        cas.delete_blob(&digest).unwrap();
        assert!(!cas.stat_blob(&digest));
    }

    #[test]
    fn list_blobs_reports_every_stored_digest() {
        let td = tempfile::tempdir().unwrap();
        let cas = Cas::create(td.path().join("layout")).unwrap();
        let (d1, _) = cas.put_blob(&b"a"[..]).unwrap();
        let (d2, _) = cas.put_blob(&b"b"[..]).unwrap();
        let listed = cas.list_blobs().unwrap();
        assert!(listed.contains(&d1));
        assert!(listed.contains(&d2));
    }

    #[test]
    fn clean_skips_the_live_scratch_dir() {
        let td = tempfile::tempdir().unwrap();
        let cas = Cas::create(td.path().join("layout")).unwrap();
        let removed = cas.clean().unwrap();
        assert_eq!(removed, 0);
    }
}
