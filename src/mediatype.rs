//! Media-type parser registry.
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
//! Maps an OCI media-type string to either a typed-record parser or a
//! declaration that the blob is opaque (layers, and anything unrecognized).
//! Every typed parser runs a superset-schema check ahead of the strongly
//! typed `oci-spec` deserialization: `oci-spec`'s builders happily accept a
//! JSON object carrying fields that belong to a *different* blob kind, and
//! a handful of real-world CVEs have turned exactly that cross-type field
//! confusion into a path-escape or privilege bug downstream.
use crate::error::OciRepackError;
use anyhow::Result;
use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{OnceLock, RwLock};

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_DESCRIPTOR: &str = "application/vnd.oci.descriptor.v1+json";
pub const MEDIA_TYPE_EMPTY: &str = "application/vnd.oci.empty.v1+json";

/// The canonical, and only accepted, byte encoding of the empty-JSON
/// sentinel blob. Any other encoding that merely parses as `{}` (such as
/// one with a trailing newline) is rejected rather than normalized.
const EMPTY_BLOB_BYTES: &[u8] = b"{}";

/// A blob decoded by the registry.
pub enum ParsedBlob {
    Manifest(ImageManifest),
    Index(ImageIndex),
    Config(ImageConfiguration),
    Descriptor(Descriptor),
    Empty,
    /// Layer tars and anything unrecognized: the registry declines to
    /// inspect the bytes at all.
    Opaque,
}

impl ParsedBlob {
    /// Descriptors a parsed manifest/index directly reference (its layers
    /// and config, or its manifest list); used by [`crate::walker`].
    pub fn references(&self) -> Vec<Descriptor> {
        match self {
            ParsedBlob::Manifest(m) => {
                let mut refs = vec![m.config().clone()];
                refs.extend(m.layers().iter().cloned());
                refs
            }
            ParsedBlob::Index(i) => i.manifests().clone(),
            _ => Vec::new(),
        }
    }
}

type Parser = fn(&[u8]) -> Result<ParsedBlob>;

enum ParserKind {
    Opaque,
    Typed(Parser),
}

/// Process-wide registry of media-type parsers and terminal media-types.
pub struct MediaTypeRegistry {
    parsers: RwLock<HashMap<String, ParserKind>>,
    terminal: RwLock<HashSet<String>>,
}

static REGISTRY: OnceLock<MediaTypeRegistry> = OnceLock::new();

/// The process-wide registry, initialized on first access.
pub fn registry() -> &'static MediaTypeRegistry {
    REGISTRY.get_or_init(MediaTypeRegistry::with_defaults)
}

impl MediaTypeRegistry {
    fn with_defaults() -> Self {
        let reg = Self {
            parsers: RwLock::new(HashMap::new()),
            terminal: RwLock::new(HashSet::new()),
        };
        reg.register(MEDIA_TYPE_MANIFEST, ParserKind::Typed(parse_manifest))
            .expect("default parsers register once");
        reg.register(MEDIA_TYPE_INDEX, ParserKind::Typed(parse_index))
            .expect("default parsers register once");
        reg.register(MEDIA_TYPE_CONFIG, ParserKind::Typed(parse_config))
            .expect("default parsers register once");
        reg.register(MEDIA_TYPE_DESCRIPTOR, ParserKind::Typed(parse_descriptor))
            .expect("default parsers register once");
        reg.register(MEDIA_TYPE_EMPTY, ParserKind::Typed(parse_empty))
            .expect("default parsers register once");
        reg.terminal
            .write()
            .unwrap()
            .insert(MEDIA_TYPE_MANIFEST.to_string());
        reg
    }

    fn register(&self, media_type: &str, kind: ParserKind) -> Result<()> {
        let mut parsers = self.parsers.write().unwrap();
        if parsers.contains_key(media_type) {
            anyhow::bail!("media-type parser `{media_type}` already registered");
        }
        parsers.insert(media_type.to_string(), kind);
        Ok(())
    }

    /// Parse `bytes` according to `media_type`. Unregistered media-types,
    /// and media-types explicitly registered as opaque (layer tars), are
    /// never inspected and always yield [`ParsedBlob::Opaque`].
    pub fn parse(&self, media_type: &str, bytes: &[u8]) -> Result<ParsedBlob> {
        let parsers = self.parsers.read().unwrap();
        match parsers.get(media_type) {
            Some(ParserKind::Typed(f)) => f(bytes),
            Some(ParserKind::Opaque) | None => Ok(ParsedBlob::Opaque),
        }
    }

    /// Whether reference traversal halts at this media-type.
    pub fn is_terminal(&self, media_type: &str) -> bool {
        self.terminal.read().unwrap().contains(media_type)
    }
}

fn reject_forbidden_siblings(value: &Value, forbidden: &[&str]) -> Result<()> {
    let Value::Object(map) = value else {
        return Ok(());
    };
    for key in forbidden {
        if map.contains_key(*key) {
            return Err(OciRepackError::MaliciousBlob(format!(
                "blob carries forbidden field `{key}` for its media-type"
            ))
            .into());
        }
    }
    Ok(())
}

fn parse_manifest(bytes: &[u8]) -> Result<ParsedBlob> {
    let value: Value = serde_json::from_slice(bytes)?;
    reject_forbidden_siblings(&value, &["manifests"])?;
    Ok(ParsedBlob::Manifest(serde_json::from_value(value)?))
}

fn parse_index(bytes: &[u8]) -> Result<ParsedBlob> {
    let value: Value = serde_json::from_slice(bytes)?;
    reject_forbidden_siblings(&value, &["layers", "config"])?;
    Ok(ParsedBlob::Index(serde_json::from_value(value)?))
}

fn parse_config(bytes: &[u8]) -> Result<ParsedBlob> {
    let value: Value = serde_json::from_slice(bytes)?;
    reject_forbidden_siblings(&value, &["manifests", "layers"])?;
    Ok(ParsedBlob::Config(serde_json::from_value(value)?))
}

fn parse_descriptor(bytes: &[u8]) -> Result<ParsedBlob> {
    let value: Value = serde_json::from_slice(bytes)?;
    reject_forbidden_siblings(&value, &["manifests", "layers", "rootfs"])?;
    Ok(ParsedBlob::Descriptor(serde_json::from_value(value)?))
}

fn parse_empty(bytes: &[u8]) -> Result<ParsedBlob> {
    if bytes != EMPTY_BLOB_BYTES {
        return Err(OciRepackError::MaliciousBlob(
            "empty-JSON sentinel did not match the canonical two-byte encoding".to_string(),
        )
        .into());
    }
    Ok(ParsedBlob::Empty)
}
