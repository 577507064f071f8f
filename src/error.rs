//! Error kind taxonomy.
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
//! These are the kinds a caller is expected to match on; everything else
//! (a bad path, a transient I/O failure with no special handling) stays an
//! opaque `anyhow::Error` wrapping `std::io::Error` or similar.

/// A recognized failure kind.
///
/// Verification failures (`BlobDigestMismatch`, `BlobSizeMismatch`,
/// `PathEscape`, `MaliciousBlob`) are never recovered locally; they abort
/// the containing operation. `PermissionDenied` is only recovered inside
/// [`crate::fsutil`]'s own retry; outside of it, it is fatal.
#[derive(thiserror::Error, Debug)]
pub enum OciRepackError {
    /// The layout marker is missing, unreadable, or at an unsupported version.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// A blob, index entry, or other named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A blob's streamed content did not hash to its expected digest.
    #[error("blob digest mismatch: expected {expected}, got {actual}")]
    BlobDigestMismatch {
        /// The digest recorded in the descriptor.
        expected: String,
        /// The digest actually observed while streaming.
        actual: String,
    },

    /// A blob read more or fewer bytes than its expected size.
    #[error("blob size mismatch: expected {expected}, got {actual}")]
    BlobSizeMismatch {
        /// The size recorded in the descriptor.
        expected: u64,
        /// The size actually observed while streaming.
        actual: u64,
    },

    /// A tar entry's path would resolve outside the extraction root.
    #[error("path escape: {0}")]
    PathEscape(String),

    /// No parser or decoder is registered for a media-type.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// No decompressor is registered for a compression suffix.
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),

    /// A blob carries a field forbidden for its declared media-type.
    #[error("malicious blob: {0}")]
    MaliciousBlob(String),

    /// A uid/gid fell outside the configured id-mapping range.
    #[error("id out of range: {0}")]
    IdOutOfRange(String),

    /// An ancestor directory's permissions could not be relaxed or restored.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The operation was cancelled via its cancellation token.
    #[error("cancelled")]
    Cancelled,

    /// A tar stream was truncated or structurally invalid.
    #[error("corrupt tar: {0}")]
    CorruptTar(String),
}

impl OciRepackError {
    /// The CLI exit code a caller should use for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            OciRepackError::Cancelled => 130,
            _ => 1,
        }
    }
}
