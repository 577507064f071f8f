//! Pluggable compression registry, keyed by media-type suffix.
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
use anyhow::Result;
use flate2::{read::GzDecoder, read::GzEncoder, Compression};
use std::collections::HashMap;
use std::io::Read;
use std::sync::{OnceLock, RwLock};

/// A boxed, streaming `Read -> Read` transform.
type Stream = Box<dyn Read + Send>;
type Transform = Box<dyn Fn(Stream) -> Result<Stream> + Send + Sync>;

/// One registry entry: a pair of streaming transforms for a media-type
/// suffix (the part after the last `+`, e.g. `gzip`, `zstd`, or empty for
/// an uncompressed layer).
struct Codec {
    compress: Transform,
    decompress: Transform,
}

/// Process-wide compression registry. Read-mostly; registration is
/// restricted to process bring-up (see [`registry`]).
pub struct CompressionRegistry {
    codecs: RwLock<HashMap<String, Codec>>,
}

static REGISTRY: OnceLock<CompressionRegistry> = OnceLock::new();

/// The process-wide registry, initialized on first access with the three
/// built-in codecs (passthrough, gzip, zstd).
pub fn registry() -> &'static CompressionRegistry {
    REGISTRY.get_or_init(CompressionRegistry::with_defaults)
}

impl CompressionRegistry {
    fn with_defaults() -> Self {
        let reg = Self {
            codecs: RwLock::new(HashMap::new()),
        };
        reg.register(
            "",
            Box::new(|r: Stream| Ok(r)),
            Box::new(|r: Stream| Ok(r)),
        )
        .expect("default codecs register once");
        reg.register(
            "gzip",
            Box::new(|r: Stream| Ok(Box::new(GzEncoder::new(r, Compression::default())) as Stream)),
            Box::new(|r: Stream| Ok(Box::new(GzDecoder::new(r)) as Stream)),
        )
        .expect("default codecs register once");
        reg.register(
            "zstd",
            Box::new(|r: Stream| {
                Ok(Box::new(zstd::stream::read::Encoder::new(r, 0)?) as Stream)
            }),
            Box::new(|r: Stream| Ok(Box::new(zstd::stream::read::Decoder::new(r)?) as Stream)),
        )
        .expect("default codecs register once");
        reg
    }

    /// Register a new codec under `suffix`. Errors if one is already
    /// registered for that suffix (a one-shot contract).
    pub fn register(&self, suffix: &str, compress: Transform, decompress: Transform) -> Result<()> {
        let mut codecs = self.codecs.write().unwrap();
        if codecs.contains_key(suffix) {
            anyhow::bail!("compression codec `{suffix}` already registered");
        }
        codecs.insert(suffix.to_string(), Codec { compress, decompress });
        Ok(())
    }

    /// Wrap `reader` in the compressor for `suffix`, if registered.
    pub fn compress(&self, suffix: &str, reader: Stream) -> Option<Result<Stream>> {
        let codecs = self.codecs.read().unwrap();
        codecs.get(suffix).map(|c| (c.compress)(reader))
    }

    /// Wrap `reader` in the decompressor for `suffix`, if registered.
    pub fn decompress(&self, suffix: &str, reader: Stream) -> Option<Result<Stream>> {
        let codecs = self.codecs.read().unwrap();
        codecs.get(suffix).map(|c| (c.decompress)(reader))
    }

    /// Whether a codec is registered for `suffix`.
    pub fn supports(&self, suffix: &str) -> bool {
        self.codecs.read().unwrap().contains_key(suffix)
    }
}

/// Extract the compression suffix from a layer media-type, e.g.
/// `application/vnd.oci.image.layer.v1.tar+gzip` -> `gzip`, and a bare
/// `application/vnd.oci.image.layer.v1.tar` -> `""`.
pub fn suffix_of_media_type(media_type: &str) -> &str {
    media_type.rsplit_once('+').map(|(_, s)| s).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn passthrough_roundtrip() {
        let data = b"unchanged".to_vec();
        let r: Stream = Box::new(Cursor::new(data.clone()));
        let mut out = Vec::new();
        registry()
            .decompress("", r)
            .unwrap()
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn gzip_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let r: Stream = Box::new(Cursor::new(data.clone()));
        let compressed = registry().compress("gzip", r).unwrap().unwrap();
        let mut compressed_bytes = Vec::new();
        let mut compressed = compressed;
        compressed.read_to_end(&mut compressed_bytes).unwrap();
        assert_ne!(compressed_bytes, data);

        let r: Stream = Box::new(Cursor::new(compressed_bytes));
        let mut out = Vec::new();
        registry()
            .decompress("gzip", r)
            .unwrap()
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn zstd_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let r: Stream = Box::new(Cursor::new(data.clone()));
        let mut compressed_bytes = Vec::new();
        registry()
            .compress("zstd", r)
            .unwrap()
            .unwrap()
            .read_to_end(&mut compressed_bytes)
            .unwrap();

        let r: Stream = Box::new(Cursor::new(compressed_bytes));
        let mut out = Vec::new();
        registry()
            .decompress("zstd", r)
            .unwrap()
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn unknown_suffix_is_none() {
        assert!(registry().compress("brotli", Box::new(Cursor::new(Vec::new()))).is_none());
    }

    #[test]
    fn suffix_parsing() {
        assert_eq!(
            suffix_of_media_type("application/vnd.oci.image.layer.v1.tar+gzip"),
            "gzip"
        );
        assert_eq!(
            suffix_of_media_type("application/vnd.oci.image.layer.v1.tar"),
            ""
        );
    }
}
