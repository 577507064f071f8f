//! Streaming digest- and size-verified reader.
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
//! Generalizes the hashing-writer pattern of a plain sha256-writer to a
//! hashing, size-checked reader decorator: every byte read is folded into a
//! running digest, and end-of-stream is gated on that digest (and, if
//! known, the byte count) matching what the caller expected.
use crate::digest::Digest;
use crate::error::OciRepackError;
use std::io::{self, Read};

/// Wraps a byte source with an expected digest and an expected size (`None`
/// meaning "unknown", e.g. when sizing from descriptor metadata is not
/// available and the disk size is used as a DoS ceiling instead).
pub struct VerifiedReader<R> {
    inner: R,
    expected_digest: Digest,
    expected_size: Option<u64>,
    hasher: crate::digest::Sha256Accumulator,
    bytes_seen: u64,
    verified: bool,
    delegated: bool,
    /// Number of times bytes were folded into `hasher`; a delegated reader
    /// never increments this, which is the test-only hook for the
    /// no-double-hashing optimization.
    hash_update_count: u64,
}

impl<R: Read> VerifiedReader<R> {
    /// Wrap `inner`, verifying against `expected_digest` and `expected_size`.
    pub fn new(inner: R, expected_digest: Digest, expected_size: Option<u64>) -> Self {
        Self {
            inner,
            expected_digest,
            expected_size,
            hasher: crate::digest::Sha256Accumulator::new(),
            bytes_seen: 0,
            verified: false,
            delegated: false,
            hash_update_count: 0,
        }
    }

    /// Number of times this reader folded bytes into its own running hash.
    /// Test-only observability hook for the delegation optimization.
    pub fn hash_update_count(&self) -> u64 {
        self.hash_update_count
    }

    /// Whether this instance is delegating verification to its inner reader.
    pub fn is_delegated(&self) -> bool {
        self.delegated
    }

    /// Drain any remaining bytes and verify. Idempotent if already verified.
    pub fn close(mut self) -> io::Result<()> {
        let mut scratch = [0u8; 8192];
        loop {
            match self.read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn fail(&mut self, e: OciRepackError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }

    fn finalize(&mut self) -> io::Result<usize> {
        if self.verified {
            return Ok(0);
        }
        let digest = self.hasher.clone().finish();
        if digest != self.expected_digest {
            let expected = self.expected_digest.to_string();
            return Err(self.fail(OciRepackError::BlobDigestMismatch {
                expected,
                actual: digest.to_string(),
            }));
        }
        if let Some(expected) = self.expected_size {
            if self.bytes_seen != expected {
                let actual = self.bytes_seen;
                return Err(self.fail(OciRepackError::BlobSizeMismatch { expected, actual }));
            }
        }
        self.verified = true;
        Ok(0)
    }
}

/// Construct a `VerifiedReader` whose inner source is itself a
/// `VerifiedReader`. When the digest and size match exactly, verification
/// is delegated entirely to the inner reader and this layer never hashes a
/// byte (the nested-decorator optimization).
impl<R: Read> VerifiedReader<VerifiedReader<R>> {
    /// Wrap an already-verified reader, collapsing the check if redundant.
    pub fn wrap(inner: VerifiedReader<R>, expected_digest: Digest, expected_size: Option<u64>) -> Self {
        let delegated =
            inner.expected_digest == expected_digest && inner.expected_size == expected_size;
        Self {
            verified: false,
            delegated,
            hasher: crate::digest::Sha256Accumulator::new(),
            bytes_seen: 0,
            hash_update_count: 0,
            expected_digest,
            expected_size,
            inner,
        }
    }
}

impl<R: Read> Read for VerifiedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.verified {
            return Ok(0);
        }
        if self.delegated {
            let n = self.inner.read(buf)?;
            if n == 0 {
                self.verified = true;
            }
            return Ok(n);
        }

        let remaining = self
            .expected_size
            .map(|sz| sz.saturating_sub(self.bytes_seen));
        let cap = remaining
            .map(|r| (r.min(buf.len() as u64)) as usize)
            .unwrap_or(buf.len());

        if cap == 0 {
            // At the byte-count boundary: any further byte from the source
            // means the source is longer than the expected size.
            let mut probe = [0u8; 1];
            let n = self.inner.read(&mut probe)?;
            if n > 0 {
                let expected = self.expected_size.unwrap();
                let actual = self.bytes_seen + 1;
                return Err(self.fail(OciRepackError::BlobSizeMismatch { expected, actual }));
            }
            return self.finalize();
        }

        let n = self.inner.read(&mut buf[..cap])?;
        if n == 0 {
            return self.finalize();
        }
        self.hasher.update(&buf[..n]);
        self.hash_update_count += 1;
        self.bytes_seen += n as u64;
        Ok(n)
    }
}
