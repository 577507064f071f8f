//! Content digests.
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
use crate::error::OciRepackError;
use anyhow::Result;
use openssl::sha::Sha256;
use std::fmt;
use std::io::{self, Read, Write};

/// The only digest algorithm this crate writes; recognized on read as well.
pub const SHA256: &str = "sha256";

/// An algorithm-labelled, lowercase-hex digest, e.g. `sha256:deadbeef...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Build a digest from its parts without validating the hex length.
    pub fn new(algorithm: impl Into<String>, hex: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hex: hex.into(),
        }
    }

    /// Parse `"<algorithm>:<hex>"`, e.g. as found in a `Descriptor`.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| OciRepackError::InvalidLayout(format!("malformed digest `{s}`")))?;
        if algorithm != SHA256 {
            return Err(OciRepackError::UnsupportedMediaType(format!(
                "unsupported digest algorithm `{algorithm}`"
            ))
            .into());
        }
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(OciRepackError::InvalidLayout(format!("malformed digest `{s}`")).into());
        }
        Ok(Self::new(algorithm, hex.to_ascii_lowercase()))
    }

    /// The algorithm label, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The lowercase hex digest, with no algorithm prefix: this is also the
    /// blob's filename on disk under `blobs/<algorithm>/`.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Compute the sha256 digest of a complete in-memory buffer.
    pub fn sha256_of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::new(SHA256, hex::encode(hasher.finish()))
    }

    /// Compute the sha256 digest of everything remaining in a reader.
    pub fn sha256_of_reader(mut r: impl Read) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::new(SHA256, hex::encode(hasher.finish())))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// A running sha256 hasher, used by writers/readers that need to compute a
/// digest incrementally (e.g. [`crate::verify::VerifiedReader`], the tar
/// generator's uncompressed-layer digest).
#[derive(Clone, Default)]
pub struct Sha256Accumulator(Sha256);

impl Sha256Accumulator {
    /// Start a new accumulator.
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    /// Feed more bytes into the running hash.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finish and return the digest.
    pub fn finish(self) -> Digest {
        Digest::new(SHA256, hex::encode(self.0.finish()))
    }
}

/// Generalizes the hashing-writer pattern to the write side: every byte
/// written to the inner writer is folded into a running sha256 digest.
/// Used by the tar generator to compute a layer's uncompressed diff-id
/// while streaming it straight through to the compressor.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256Accumulator,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap `inner`, hashing everything written to it.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256Accumulator::new(),
        }
    }

    /// Consume the writer, returning the digest of everything written and
    /// the inner writer.
    pub fn finish(self) -> (Digest, W) {
        (self.hasher.finish(), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The read-side counterpart of [`HashingWriter`]: tees every byte read
/// from the inner reader into a running sha256 digest, used by the layer
/// pipeline to compute an uncompressed layer's diff-id while it is being
/// piped straight into the extractor.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256Accumulator,
}

impl<R: Read> HashingReader<R> {
    /// Wrap `inner`, hashing everything read from it.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256Accumulator::new(),
        }
    }

    /// Consume the reader, returning the digest of everything read so far
    /// and the inner reader.
    pub fn finish(self) -> (Digest, R) {
        (self.hasher.finish(), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let d = Digest::sha256_of(b"hello");
        let s = d.to_string();
        let parsed = Digest::parse(&s).unwrap();
        assert_eq!(d, parsed);
        assert_eq!(d.algorithm(), "sha256");
    }

    #[test]
    fn parse_rejects_bad_algorithm() {
        assert!(Digest::parse("sha512:abcd").is_err());
    }

    #[test]
    fn parse_rejects_short_hex() {
        assert!(Digest::parse("sha256:abcd").is_err());
    }

    #[test]
    fn reader_matches_buffer() {
        let a = Digest::sha256_of(b"the quick brown fox");
        let b = Digest::sha256_of_reader(&b"the quick brown fox"[..]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hashing_writer_matches_direct_digest() {
        let mut out = Vec::new();
        let mut w = HashingWriter::new(&mut out);
        w.write_all(b"hello world").unwrap();
        let (digest, _) = w.finish();
        assert_eq!(digest, Digest::sha256_of(b"hello world"));
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn hashing_reader_matches_direct_digest() {
        let data = b"the quick brown fox";
        let mut r = HashingReader::new(&data[..]);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        let (digest, _) = r.finish();
        assert_eq!(digest, Digest::sha256_of(data));
    }
}
