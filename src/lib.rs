#![deny(missing_docs)]
//! Unpack and repack OCI image layouts on local disk, without a container
//! engine, including as an unprivileged user.
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
use oci_spec::image::{ImageConfiguration, ImageManifest};

pub mod bundle;
pub mod cas;
pub mod cli;
pub mod compress;
pub mod config_ops;
pub mod diff;
pub mod digest;
pub mod error;
pub mod fsutil;
pub mod mediatype;
pub mod pipeline;
pub mod tar_extract;
pub mod tar_gen;
pub mod tar_model;
pub mod verify;
pub mod walker;
pub mod write;

use cli::Command;
use pipeline::CancellationToken;

/// Run ocirepack.
pub fn main(command: Command) -> Result<()> {
    let cancel = CancellationToken::new();
    match command {
        Command::Init { image } => {
            pipeline::create_layout(&image)?;
            write::ok("Created", format!("OCI layout at `{}`", image.display()))?;
        }
        Command::New { image, tag } => {
            let cas = pipeline::open_layout(&image)?;
            pipeline::new_empty_image(&cas, &tag)?;
            write::ok("Created", format!("empty image tagged `{tag}`"))?;
        }
        Command::Unpack {
            image,
            tag,
            bundle,
            map,
        } => {
            let cas = pipeline::open_layout(&image)?;
            let manifest_descriptor = pipeline::find_manifest_by_tag(&cas, &tag)?;
            pipeline::unpack_manifest(
                &cas,
                &manifest_descriptor,
                &bundle,
                &map.into_map_options(),
                &cancel,
            )?;
            write::ok(
                "Unpacked",
                format!("`{tag}` into bundle `{}`", bundle.display()),
            )?;
        }
        Command::Repack { image, bundle, map } => {
            let cas = pipeline::open_layout(&image)?;
            let new_descriptor =
                pipeline::repack_bundle(&cas, &bundle, &map.into_map_options(), &cancel)?;
            write::ok(
                "Repacked",
                format!(
                    "bundle `{}` as manifest `{}`",
                    bundle.display(),
                    new_descriptor.digest()
                ),
            )?;
        }
        Command::Tag { image, from, to } => {
            let cas = pipeline::open_layout(&image)?;
            let manifest_descriptor = pipeline::find_manifest_by_tag(&cas, &from)?;
            pipeline::tag_manifest(&cas, &manifest_descriptor, &to)?;
            write::ok("Tagged", format!("`{from}` as `{to}`"))?;
        }
        Command::Insert {
            image,
            tag,
            source,
            target,
            opaque,
            map,
        } => {
            let cas = pipeline::open_layout(&image)?;
            let manifest_descriptor = pipeline::find_manifest_by_tag(&cas, &tag)?;
            let new_descriptor = pipeline::insert_layer(
                &cas,
                &manifest_descriptor,
                &source,
                &target,
                opaque,
                &map.into_map_options(),
                &cancel,
            )?;
            write::ok(
                "Inserted",
                format!(
                    "`{}` at `{}` as manifest `{}`",
                    source.display(),
                    target.display(),
                    new_descriptor.digest()
                ),
            )?;
        }
        Command::Config {
            image,
            tag,
            entrypoint,
            clear_entrypoint,
            cmd,
            clear_cmd,
            user,
            working_dir,
            stop_signal,
            env,
            remove_env,
            label,
            remove_label,
            expose,
            volume,
        } => {
            let cas = pipeline::open_layout(&image)?;
            let manifest_descriptor = pipeline::find_manifest_by_tag(&cas, &tag)?;
            let edits = build_config_edits(
                entrypoint,
                clear_entrypoint,
                cmd,
                clear_cmd,
                user,
                working_dir,
                stop_signal,
                env,
                remove_env,
                label,
                remove_label,
                expose,
                volume,
            );
            let new_descriptor = pipeline::update_config(&cas, &manifest_descriptor, &edits)?;
            write::ok(
                "Reconfigured",
                format!("`{tag}` as manifest `{}`", new_descriptor.digest()),
            )?;
        }
        Command::Gc { image } => {
            let cas = pipeline::open_layout(&image)?;
            let removed = cas.clean()?;
            write::ok("Collected", format!("{removed} stale scratch director{}", if removed == 1 { "y" } else { "ies" }))?;
        }
        Command::Stat { image, tag } => {
            let cas = pipeline::open_layout(&image)?;
            let manifest_descriptor = pipeline::find_manifest_by_tag(&cas, &tag)?;
            print_stat(&cas, &manifest_descriptor)?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_config_edits(
    entrypoint: Vec<String>,
    clear_entrypoint: bool,
    cmd: Vec<String>,
    clear_cmd: bool,
    user: Option<String>,
    working_dir: Option<String>,
    stop_signal: Option<String>,
    env: Vec<(String, String)>,
    remove_env: Vec<String>,
    label: Vec<(String, String)>,
    remove_label: Vec<String>,
    expose: Vec<String>,
    volume: Vec<String>,
) -> Vec<config_ops::ConfigEdit> {
    use config_ops::ConfigEdit;
    let mut edits = Vec::new();
    if clear_entrypoint {
        edits.push(ConfigEdit::ClearEntrypoint);
    } else if !entrypoint.is_empty() {
        edits.push(ConfigEdit::SetEntrypoint(entrypoint));
    }
    if clear_cmd {
        edits.push(ConfigEdit::ClearCmd);
    } else if !cmd.is_empty() {
        edits.push(ConfigEdit::SetCmd(cmd));
    }
    if let Some(user) = user {
        edits.push(ConfigEdit::SetUser(user));
    }
    if let Some(dir) = working_dir {
        edits.push(ConfigEdit::SetWorkingDir(dir));
    }
    if let Some(sig) = stop_signal {
        edits.push(ConfigEdit::SetStopSignal(sig));
    }
    for (k, v) in env {
        edits.push(ConfigEdit::AddEnv(k, v));
    }
    for k in remove_env {
        edits.push(ConfigEdit::RemoveEnv(k));
    }
    for (k, v) in label {
        edits.push(ConfigEdit::SetLabel(k, v));
    }
    for k in remove_label {
        edits.push(ConfigEdit::RemoveLabel(k));
    }
    for p in expose {
        edits.push(ConfigEdit::AddExposedPort(p));
    }
    for v in volume {
        edits.push(ConfigEdit::AddVolume(v));
    }
    edits
}

fn print_stat(cas: &cas::Cas, manifest_descriptor: &oci_spec::image::Descriptor) -> Result<()> {
    let digest = digest::Digest::parse(&manifest_descriptor.digest().to_string())?;
    let manifest: ImageManifest = cas.get_json_blob(&digest)?;
    let config: ImageConfiguration = cas.get_json_blob(&digest::Digest::parse(
        &manifest.config().digest().to_string(),
    )?)?;

    println!("manifest: {}", manifest_descriptor.digest());
    println!("layers:");
    for (layer, diff_id) in manifest.layers().iter().zip(config.rootfs().diff_ids()) {
        println!(
            "  {} ({} bytes, diff-id {diff_id})",
            layer.digest(),
            layer.size()
        );
    }
    println!("architecture: {}", config.architecture());
    println!("os: {}", config.os());
    Ok(())
}
