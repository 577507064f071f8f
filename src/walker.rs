//! Descriptor reference walker.
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
//! Not a core algorithmic hot-spot: a thin recursive walk over parsed-blob
//! references, collaborating with the CAS engine (fetch) and the
//! media-type registry (parse/terminal) to
//! locate every manifest reachable from an index.
use crate::cas::Cas;
use crate::digest::Digest;
use crate::mediatype::{self, ParsedBlob};
use anyhow::{Context, Result};
use oci_spec::image::Descriptor;
use std::io::Read;

/// Resolve every terminal descriptor (manifest) reachable from `root`,
/// recursing through intermediate index/manifest-list blobs.
pub fn resolve_manifests(cas: &Cas, root: &Descriptor) -> Result<Vec<Descriptor>> {
    let mut collected = Vec::new();
    visit(cas, root, &mut collected)?;
    Ok(collected)
}

fn visit(cas: &Cas, desc: &Descriptor, out: &mut Vec<Descriptor>) -> Result<()> {
    let media_type = desc.media_type().to_string();
    if mediatype::registry().is_terminal(&media_type) {
        out.push(desc.clone());
        return Ok(());
    }

    let digest = Digest::parse(&desc.digest().to_string())
        .with_context(|| format!("descriptor digest `{}`", desc.digest()))?;
    let expected_size = u64::try_from(desc.size()).ok();
    let mut reader = cas.get_blob(&digest, expected_size)?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    reader.close()?;

    let parsed = mediatype::registry().parse(&media_type, &bytes)?;
    for child in parsed.references() {
        visit(cas, &child, out)?;
    }
    Ok(())
}
