//! Layer pipeline: orchestrates unpack/repack/insert against the CAS, the
//! compression and media-type registries, the tar codec, and the diff
//! engine.
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
use crate::bundle::{self, BundleMetadata};
use crate::cas::Cas;
use crate::compress;
use crate::config_ops::{self, ConfigEdit};
use crate::digest::{Digest, HashingWriter};
use crate::diff::{self, TimeGranularity};
use crate::error::OciRepackError;
use crate::mediatype::{self, ParsedBlob};
use crate::tar_extract;
use crate::tar_gen;
use crate::tar_model::{EntrySource, MapOptions, PlannedEntry};
use anyhow::{Context, Result};
use oci_spec::image::{
    Arch, Config, ConfigBuilder, Descriptor, DescriptorBuilder, ImageConfiguration,
    ImageConfigurationBuilder, ImageManifest, ImageManifestBuilder, MediaType, Os, RootFsBuilder,
    SCHEMA_VERSION,
};
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A cooperative cancellation flag threaded through unpack/repack/insert.
/// Checked at every suspension point: the start of each layer, and
/// before each blob put. Already-written scratch blobs are left for a
/// later [`Cas::clean`].
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Request cancellation. Visible to every clone of this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(OciRepackError::Cancelled.into());
        }
        Ok(())
    }
}

/// Open an existing OCI image layout.
pub fn open_layout(path: impl Into<std::path::PathBuf>) -> Result<Cas> {
    Cas::open(path)
}

/// Create a fresh, empty OCI image layout.
pub fn create_layout(path: impl Into<std::path::PathBuf>) -> Result<Cas> {
    Cas::create(path)
}

/// Build and store a manifest with no layers and an empty rootfs, tagged
/// with `tag`'s `org.opencontainers.image.ref.name` annotation, as a
/// starting point for `insert`/`repack` to build onto (`ocirepack new`).
pub fn new_empty_image(cas: &Cas, tag: &str) -> Result<Descriptor> {
    let rootfs = RootFsBuilder::default()
        .typ("layers")
        .diff_ids(Vec::<String>::new())
        .build()
        .expect("empty rootfs always builds");
    let config = ImageConfigurationBuilder::default()
        .architecture(Arch::Amd64)
        .os(Os::Linux)
        .rootfs(rootfs)
        .config(Config::default())
        .build()
        .expect("empty configuration always builds");
    let (config_digest, config_size) = cas.put_json_blob(&config)?;
    let config_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .digest(config_digest.to_string())
        .size(config_size as i64)
        .build()
        .expect("config descriptor always builds");

    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(Vec::<Descriptor>::new())
        .build()
        .expect("empty manifest always builds");
    let (manifest_digest, manifest_size) = cas.put_json_blob(&manifest)?;
    let mut manifest_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(manifest_digest.to_string())
        .size(manifest_size as i64)
        .build()
        .expect("manifest descriptor always builds");
    manifest_descriptor.set_annotations(Some(tag_annotation(tag)));

    let mut index = cas.get_index()?;
    let mut manifests = index.manifests().clone();
    manifests.push(manifest_descriptor.clone());
    index.set_manifests(manifests);
    cas.put_index(&index)?;

    Ok(manifest_descriptor)
}

/// Apply a batch of image-config edits with no new layer: fetch the
/// manifest and config, mutate the config in place, and commit a new
/// config/manifest pair, repointing whichever index entry named the old
/// manifest.
pub fn update_config(
    cas: &Cas,
    manifest_descriptor: &Descriptor,
    edits: &[ConfigEdit],
) -> Result<Descriptor> {
    let old_digest = Digest::parse(&manifest_descriptor.digest().to_string())?;
    let mut manifest = fetch_manifest(cas, manifest_descriptor)?;
    let mut config = fetch_config(cas, manifest.config())?;
    config_ops::apply_edits(&mut config, edits);

    let (config_digest, config_size) = cas.put_json_blob(&config)?;
    let config_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .digest(config_digest.to_string())
        .size(config_size as i64)
        .build()
        .expect("config descriptor always builds");
    manifest.set_config(config_descriptor);

    let (manifest_digest, manifest_size) = cas.put_json_blob(&manifest)?;
    let manifest_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(manifest_digest.to_string())
        .size(manifest_size as i64)
        .build()
        .expect("manifest descriptor always builds");

    replace_manifest_in_index(cas, &old_digest, &manifest_descriptor)?;
    Ok(manifest_descriptor)
}

/// Point a new tag at the same manifest an existing tag names, without
/// disturbing the existing tag's own index entry.
pub fn tag_manifest(cas: &Cas, manifest_descriptor: &Descriptor, new_tag: &str) -> Result<()> {
    let mut index = cas.get_index()?;
    let mut manifests = index.manifests().clone();
    let mut retagged = manifest_descriptor.clone();
    retagged.set_annotations(Some(tag_annotation(new_tag)));
    manifests.push(retagged);
    index.set_manifests(manifests);
    cas.put_index(&index)
}

const TAG_ANNOTATION_KEY: &str = "org.opencontainers.image.ref.name";

fn tag_annotation(tag: &str) -> std::collections::HashMap<String, String> {
    std::collections::HashMap::from([(TAG_ANNOTATION_KEY.to_string(), tag.to_string())])
}

/// Find the manifest descriptor whose `org.opencontainers.image.ref.name`
/// annotation equals `tag`.
pub fn find_manifest_by_tag(cas: &Cas, tag: &str) -> Result<Descriptor> {
    let index = cas.get_index()?;
    index
        .manifests()
        .iter()
        .find(|desc| {
            desc.annotations()
                .as_ref()
                .and_then(|a| a.get(TAG_ANNOTATION_KEY))
                .map(|v| v == tag)
                .unwrap_or(false)
        })
        .cloned()
        .ok_or_else(|| OciRepackError::NotFound(format!("no manifest tagged `{tag}`")).into())
}

fn fetch_manifest(cas: &Cas, descriptor: &Descriptor) -> Result<ImageManifest> {
    let digest = Digest::parse(&descriptor.digest().to_string())?;
    let expected_size = u64::try_from(descriptor.size()).ok();
    let mut reader = cas.get_blob(&digest, expected_size)?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    reader.close()?;
    match mediatype::registry().parse(&descriptor.media_type().to_string(), &bytes)? {
        ParsedBlob::Manifest(m) => Ok(m),
        _ => Err(OciRepackError::UnsupportedMediaType(format!(
            "descriptor `{}` is not an image manifest",
            descriptor.digest()
        ))
        .into()),
    }
}

fn fetch_config(cas: &Cas, descriptor: &Descriptor) -> Result<ImageConfiguration> {
    let digest = Digest::parse(&descriptor.digest().to_string())?;
    let expected_size = u64::try_from(descriptor.size()).ok();
    let mut reader = cas.get_blob(&digest, expected_size)?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    reader.close()?;
    match mediatype::registry().parse(&descriptor.media_type().to_string(), &bytes)? {
        ParsedBlob::Config(c) => Ok(c),
        _ => Err(OciRepackError::UnsupportedMediaType(format!(
            "descriptor `{}` is not an image config",
            descriptor.digest()
        ))
        .into()),
    }
}

fn layer_media_type(suffix: &str) -> Result<MediaType> {
    Ok(match suffix {
        "" => MediaType::ImageLayer,
        "gzip" => MediaType::ImageLayerGzip,
        "zstd" => MediaType::ImageLayerZstd,
        other => {
            return Err(OciRepackError::UnsupportedCompression(format!(
                "no layer media-type for compression suffix `{other}`"
            ))
            .into())
        }
    })
}

fn push_clone<T: Clone>(existing: &[T], item: T) -> Vec<T> {
    let mut out = existing.to_vec();
    out.push(item);
    out
}

/// Replace the index entry for `old_digest` with `new_descriptor`,
/// carrying over whatever annotations (including a tag's
/// `org.opencontainers.image.ref.name`) the old entry had. If no entry
/// matches `old_digest` — a bundle repacked from a manifest that was
/// never indexed — the new descriptor is appended untagged.
fn replace_manifest_in_index(
    cas: &Cas,
    old_digest: &Digest,
    new_descriptor: &Descriptor,
) -> Result<()> {
    let mut index = cas.get_index()?;
    let mut replaced = false;
    let mut manifests: Vec<Descriptor> = index
        .manifests()
        .iter()
        .cloned()
        .map(|desc| {
            if Digest::parse(&desc.digest().to_string()).ok().as_ref() == Some(old_digest) {
                replaced = true;
                let mut updated = new_descriptor.clone();
                updated.set_annotations(desc.annotations().clone());
                updated
            } else {
                desc
            }
        })
        .collect();
    if !replaced {
        manifests.push(new_descriptor.clone());
    }
    index.set_manifests(manifests);
    cas.put_index(&index)
}

/// Unpack a manifest's rootfs into `<bundle_path>/rootfs`, verifying every
/// layer's uncompressed digest against the config's recorded diff-id.
pub fn unpack_manifest(
    cas: &Cas,
    manifest_descriptor: &Descriptor,
    bundle_path: &Path,
    map: &MapOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    cancel.check()?;
    let manifest = fetch_manifest(cas, manifest_descriptor)?;
    let config = fetch_config(cas, manifest.config())?;
    let rootfs = config.rootfs();
    if rootfs.typ() != "layers" {
        return Err(OciRepackError::UnsupportedMediaType(format!(
            "unsupported rootfs type `{}`",
            rootfs.typ()
        ))
        .into());
    }
    let diff_ids = rootfs.diff_ids();
    if diff_ids.len() != manifest.layers().len() {
        return Err(OciRepackError::InvalidLayout(
            "manifest layer count does not match config diff-id count".to_string(),
        )
        .into());
    }

    let rootfs_path = bundle_path.join("rootfs");
    fs::create_dir_all(&rootfs_path)
        .with_context(|| format!("creating rootfs `{}`", rootfs_path.display()))?;

    for (layer_descriptor, expected_diff_id) in manifest.layers().iter().zip(diff_ids.iter()) {
        cancel.check()?;
        let digest = Digest::parse(&layer_descriptor.digest().to_string())?;
        let expected_size = u64::try_from(layer_descriptor.size()).ok();
        let compressed = cas.get_blob(&digest, expected_size)?;
        let suffix = compress::suffix_of_media_type(&layer_descriptor.media_type().to_string());
        let mut decompressed = compress::registry()
            .decompress(suffix, Box::new(compressed))
            .ok_or_else(|| {
                OciRepackError::UnsupportedCompression(format!(
                    "no decompressor registered for suffix `{suffix}`"
                ))
            })??;
        let mut uncompressed = Vec::new();
        decompressed.read_to_end(&mut uncompressed)?;

        let actual_diff_id = Digest::sha256_of(&uncompressed);
        let expected = Digest::parse(expected_diff_id)?;
        if actual_diff_id != expected {
            return Err(OciRepackError::BlobDigestMismatch {
                expected: expected.to_string(),
                actual: actual_diff_id.to_string(),
            }
            .into());
        }

        tar_extract::extract(Cursor::new(uncompressed), &rootfs_path, map)?;
    }

    let manifest_digest = Digest::parse(&manifest_descriptor.digest().to_string())?;
    bundle::save(
        bundle_path,
        &BundleMetadata {
            source_manifest_digest: manifest_digest.clone(),
            uid_map: map.uid_map.clone(),
            gid_map: map.gid_map.clone(),
            rootless: map.rootless,
        },
    )?;
    let snapshot = diff::snapshot(&rootfs_path)?;
    bundle::save_mtree(bundle_path, &manifest_digest, &snapshot)?;
    Ok(())
}

/// Walk the bundle's rootfs for changes since its last recorded snapshot,
/// append a new layer blob (and updated config/manifest/index) to the
/// layout, and refresh the bundle's recorded source digest and mtree so a
/// subsequent repack diffs against this image rather than the original.
pub fn repack_bundle(
    cas: &Cas,
    bundle_path: &Path,
    map: &MapOptions,
    cancel: &CancellationToken,
) -> Result<Descriptor> {
    cancel.check()?;
    let meta = bundle::load(bundle_path)?.ok_or_else(|| {
        OciRepackError::InvalidLayout(
            "bundle has no umoci.json; run unpack before repack".to_string(),
        )
    })?;

    let rootfs_path = bundle_path.join("rootfs");
    let old_entries = bundle::load_mtree(bundle_path, &meta.source_manifest_digest)?;
    let new_entries = diff::snapshot(&rootfs_path)?;
    let deltas = diff::simplify(diff::diff(
        &old_entries,
        &new_entries,
        TimeGranularity::TarSeconds,
    ));
    let planned = tar_gen::plan_from_deltas(&deltas);

    let manifest: ImageManifest = cas.get_json_blob(&meta.source_manifest_digest)?;
    let config: ImageConfiguration =
        cas.get_json_blob(&Digest::parse(&manifest.config().digest().to_string())?)?;

    cancel.check()?;
    let hashing = HashingWriter::new(Vec::new());
    let hashing = tar_gen::generate(&rootfs_path, &planned, map, hashing)?;
    let (diff_id, uncompressed) = hashing.finish();

    let new_manifest_descriptor = commit_new_layer(
        cas,
        &meta.source_manifest_digest,
        manifest,
        config,
        uncompressed,
        diff_id,
        "gzip",
    )?;

    let new_manifest_digest = Digest::parse(&new_manifest_descriptor.digest().to_string())?;
    bundle::save(
        bundle_path,
        &BundleMetadata {
            source_manifest_digest: new_manifest_digest.clone(),
            ..meta
        },
    )?;
    bundle::save_mtree(bundle_path, &new_manifest_digest, &new_entries)?;

    Ok(new_manifest_descriptor)
}

/// Insert a single file or directory tree from `source_path` on the host
/// filesystem directly into a new layer at `target_path` inside the
/// image, without an intervening unpack/repack cycle. `opaque` emits an
/// opaque-whiteout marker at `target_path` first, clearing whatever that
/// directory held in earlier layers.
pub fn insert_layer(
    cas: &Cas,
    manifest_descriptor: &Descriptor,
    source_path: &Path,
    target_path: &Path,
    opaque: bool,
    map: &MapOptions,
    cancel: &CancellationToken,
) -> Result<Descriptor> {
    cancel.check()?;
    let manifest_digest = Digest::parse(&manifest_descriptor.digest().to_string())?;
    let manifest = fetch_manifest(cas, manifest_descriptor)?;
    let config = fetch_config(cas, manifest.config())?;

    let mut planned = Vec::new();
    if opaque {
        planned.push(PlannedEntry {
            archive_path: target_path.to_path_buf(),
            source: EntrySource::OpaqueWhiteout,
        });
    }
    planned.push(PlannedEntry {
        archive_path: target_path.to_path_buf(),
        // `tar_gen::generate` resolves disk sources via `root.join(rel)`;
        // joining an absolute path onto any root simply replaces it, so
        // passing the host's absolute `source_path` here with `root = /`
        // reads directly from the host tree with no rootless bundle in
        // between.
        source: EntrySource::Disk(source_path.to_path_buf()),
    });

    let hashing = HashingWriter::new(Vec::new());
    let hashing = tar_gen::generate(Path::new("/"), &planned, map, hashing)?;
    let (diff_id, uncompressed) = hashing.finish();

    commit_new_layer(
        cas,
        &manifest_digest,
        manifest,
        config,
        uncompressed,
        diff_id,
        "gzip",
    )
}

/// Shared tail of `repack_bundle` and `insert_layer`: compress the new
/// layer's uncompressed bytes, store it, append it to the manifest and
/// the config's diff-id chain, store the updated config and manifest, and
/// repoint the index entry that named `old_manifest_digest` at the new
/// manifest.
fn commit_new_layer(
    cas: &Cas,
    old_manifest_digest: &Digest,
    mut manifest: ImageManifest,
    mut config: ImageConfiguration,
    uncompressed: Vec<u8>,
    diff_id: Digest,
    compression_suffix: &str,
) -> Result<Descriptor> {
    let compressed = compress::registry()
        .compress(compression_suffix, Box::new(Cursor::new(uncompressed)))
        .ok_or_else(|| {
            OciRepackError::UnsupportedCompression(format!(
                "no compressor registered for suffix `{compression_suffix}`"
            ))
        })??;
    let (compressed_digest, compressed_size) = cas.put_blob(compressed)?;

    let layer_descriptor = DescriptorBuilder::default()
        .media_type(layer_media_type(compression_suffix)?)
        .digest(compressed_digest.to_string())
        .size(compressed_size as i64)
        .build()
        .expect("layer descriptor always builds");
    manifest.set_layers(push_clone(manifest.layers(), layer_descriptor));

    let mut rootfs = config.rootfs().clone();
    rootfs.set_diff_ids(push_clone(rootfs.diff_ids(), diff_id.to_string()));
    config.set_rootfs(rootfs);

    let (config_digest, config_size) = cas.put_json_blob(&config)?;
    let config_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .digest(config_digest.to_string())
        .size(config_size as i64)
        .build()
        .expect("config descriptor always builds");
    manifest.set_config(config_descriptor);

    let (manifest_digest, manifest_size) = cas.put_json_blob(&manifest)?;
    let manifest_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(manifest_digest.to_string())
        .size(manifest_size as i64)
        .build()
        .expect("manifest descriptor always builds");

    replace_manifest_in_index(cas, old_manifest_digest, &manifest_descriptor)?;
    Ok(manifest_descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar_model::IdMapping;
    use oci_spec::image::ConfigBuilder;
    use std::fs;
    use std::io::Write;

    fn put_json(cas: &Cas, media_type: MediaType, value: &impl serde::Serialize) -> Descriptor {
        let (digest, size) = cas.put_json_blob(value).unwrap();
        DescriptorBuilder::default()
            .media_type(media_type)
            .digest(digest.to_string())
            .size(size as i64)
            .build()
            .unwrap()
    }

    fn build_manifest_with_no_layers(cas: &Cas) -> Descriptor {
        let rootfs = RootFsBuilder::default()
            .typ("layers")
            .diff_ids(Vec::<String>::new())
            .build()
            .unwrap();
        let config = ImageConfigurationBuilder::default()
            .architecture(oci_spec::image::Arch::Amd64)
            .os(oci_spec::image::Os::Linux)
            .rootfs(rootfs)
            .config(ConfigBuilder::default().build().unwrap())
            .build()
            .unwrap();
        let config_desc = put_json(cas, MediaType::ImageConfig, &config);

        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(config_desc)
            .layers(Vec::<Descriptor>::new())
            .build()
            .unwrap();
        let manifest_desc = put_json(cas, MediaType::ImageManifest, &manifest);

        let mut index = cas.get_index().unwrap();
        index.set_manifests(vec![manifest_desc.clone()]);
        cas.put_index(&index).unwrap();

        manifest_desc
    }

    #[test]
    fn unpack_empty_manifest_creates_rootfs() {
        let td = tempfile::tempdir().unwrap();
        let cas = Cas::create(td.path().join("layout")).unwrap();
        let manifest_desc = build_manifest_with_no_layers(&cas);
        let bundle = td.path().join("bundle");
        unpack_manifest(
            &cas,
            &manifest_desc,
            &bundle,
            &MapOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(bundle.join("rootfs").is_dir());
        assert!(bundle::load(&bundle).unwrap().is_some());
    }

    #[test]
    fn repack_appends_one_layer_for_one_new_file() {
        let td = tempfile::tempdir().unwrap();
        let cas = Cas::create(td.path().join("layout")).unwrap();
        let manifest_desc = build_manifest_with_no_layers(&cas);
        let bundle = td.path().join("bundle");
        unpack_manifest(
            &cas,
            &manifest_desc,
            &bundle,
            &MapOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        let mut f = fs::File::create(bundle.join("rootfs").join("hello")).unwrap();
        f.write_all(b"hi").unwrap();
        drop(f);

        let new_desc = repack_bundle(
            &cas,
            &bundle,
            &MapOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        let manifest: ImageManifest = cas
            .get_json_blob(&Digest::parse(&new_desc.digest().to_string()).unwrap())
            .unwrap();
        assert_eq!(manifest.layers().len(), 1);

        let index = cas.get_index().unwrap();
        assert_eq!(index.manifests().len(), 1);
        assert_eq!(index.manifests()[0].digest(), new_desc.digest());
    }

    #[test]
    fn insert_layer_adds_arbitrary_host_file() {
        let td = tempfile::tempdir().unwrap();
        let cas = Cas::create(td.path().join("layout")).unwrap();
        let manifest_desc = build_manifest_with_no_layers(&cas);

        let host_file = td.path().join("payload.txt");
        fs::write(&host_file, b"payload").unwrap();

        let new_desc = insert_layer(
            &cas,
            &manifest_desc,
            &host_file,
            Path::new("inserted/payload.txt"),
            false,
            &MapOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        let manifest: ImageManifest = cas
            .get_json_blob(&Digest::parse(&new_desc.digest().to_string()).unwrap())
            .unwrap();
        assert_eq!(manifest.layers().len(), 1);
    }

    #[test]
    fn cancellation_token_aborts_before_work_starts() {
        let td = tempfile::tempdir().unwrap();
        let cas = Cas::create(td.path().join("layout")).unwrap();
        let manifest_desc = build_manifest_with_no_layers(&cas);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = unpack_manifest(
            &cas,
            &manifest_desc,
            &td.path().join("bundle"),
            &MapOptions::default(),
            &cancel,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unmapped_rootless_identity_roundtrips() {
        let map = MapOptions {
            uid_map: IdMapping::identity(),
            gid_map: IdMapping::identity(),
            rootless: true,
        };
        assert_eq!(map.uid_map.host_to_container(0).unwrap(), 0);
    }
}
