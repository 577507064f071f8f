//! ocirepack CLI.
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
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::Verbosity;

/// Main CLI struct
#[derive(Debug, Parser)]
#[clap(
    about = "Unpack and repack OCI image layouts without a container engine",
    long_about = "See 'ocirepack help <subcommand>' for more information on a specific subcommand",
    version
)]
pub struct Cli {
    #[clap(subcommand)]
    /// The available subcommand
    pub command: Command,
    /// Verbosity
    #[clap(flatten)]
    pub verbose: Verbosity,
}

fn kv_parser(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("`{}` should be of the form KEY=VALUE.", s)),
    }
}

/// Parses `CONTAINER:HOST:SIZE`, the same triple `newuidmap`/`newgidmap` take.
fn id_map_range_parser(s: &str) -> Result<crate::tar_model::IdMapRange, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [container_id, host_id, size] = parts.as_slice() else {
        return Err(format!(
            "`{}` should be of the form CONTAINER:HOST:SIZE.",
            s
        ));
    };
    Ok(crate::tar_model::IdMapRange {
        container_id: container_id.parse().map_err(|e| format!("{e}"))?,
        host_id: host_id.parse().map_err(|e| format!("{e}"))?,
        size: size.parse().map_err(|e| format!("{e}"))?,
    })
}

/// Shared bundle-unpack/repack flags: the id-mapping tables and rootless
/// flag making up `MapOptions`, shared by the tar generator and extractor.
#[derive(Debug, clap::Args)]
pub struct MapArgs {
    /// Add a container:host:size uid mapping range. May be repeated.
    #[clap(long = "uid-map", value_parser = id_map_range_parser)]
    pub uid_map: Vec<crate::tar_model::IdMapRange>,
    /// Add a container:host:size gid mapping range. May be repeated.
    #[clap(long = "gid-map", value_parser = id_map_range_parser)]
    pub gid_map: Vec<crate::tar_model::IdMapRange>,
    /// Run as an unprivileged user: skip device-node creation and downgrade
    /// privileged-xattr failures to warnings.
    #[clap(long = "rootless")]
    pub rootless: bool,
}

impl MapArgs {
    /// Build the `MapOptions` this CLI invocation requested.
    pub fn into_map_options(self) -> crate::tar_model::MapOptions {
        crate::tar_model::MapOptions {
            uid_map: crate::tar_model::IdMapping::new(self.uid_map),
            gid_map: crate::tar_model::IdMapping::new(self.gid_map),
            rootless: self.rootless,
        }
    }
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a new, empty OCI image layout
    Init {
        /// Path to the OCI image layout to create
        #[clap(long = "image")]
        image: PathBuf,
    },
    /// Create a new, empty, tagged manifest in an existing layout
    New {
        /// Path to the OCI image layout
        #[clap(long = "image")]
        image: PathBuf,
        /// Tag to give the new manifest
        #[clap(long = "tag")]
        tag: String,
    },
    /// Unpack a tagged manifest into a runtime bundle
    Unpack {
        /// Path to the OCI image layout
        #[clap(long = "image")]
        image: PathBuf,
        /// Tag of the manifest to unpack
        #[clap(long = "tag")]
        tag: String,
        /// Path of the bundle to create
        #[clap(long = "bundle")]
        bundle: PathBuf,
        #[clap(flatten)]
        map: MapArgs,
    },
    /// Repack a bundle's modified rootfs as a new layer
    Repack {
        /// Path to the OCI image layout
        #[clap(long = "image")]
        image: PathBuf,
        /// Path of the bundle to repack
        #[clap(long = "bundle")]
        bundle: PathBuf,
        #[clap(flatten)]
        map: MapArgs,
    },
    /// Point a new tag at the manifest an existing tag names
    Tag {
        /// Path to the OCI image layout
        #[clap(long = "image")]
        image: PathBuf,
        /// Existing tag to read the manifest from
        #[clap(long = "from")]
        from: String,
        /// New tag to create
        #[clap(long = "to")]
        to: String,
    },
    /// Insert a file or directory tree from the host directly into a new layer
    Insert {
        /// Path to the OCI image layout
        #[clap(long = "image")]
        image: PathBuf,
        /// Tag of the manifest to append the new layer to
        #[clap(long = "tag")]
        tag: String,
        /// Path on the host to insert
        source: PathBuf,
        /// Path inside the image to insert it at
        target: PathBuf,
        /// Emit an opaque whiteout at `target` first, clearing whatever
        /// earlier layers placed there
        #[clap(long = "opaque")]
        opaque: bool,
        #[clap(flatten)]
        map: MapArgs,
    },
    /// Edit a tagged image's runtime configuration
    Config {
        /// Path to the OCI image layout
        #[clap(long = "image")]
        image: PathBuf,
        /// Tag of the manifest to edit
        #[clap(long = "tag")]
        tag: String,
        /// Set the entrypoint, e.g. `--entrypoint /bin/sh --entrypoint -c`
        #[clap(long = "entrypoint")]
        entrypoint: Vec<String>,
        /// Clear any existing entrypoint
        #[clap(long = "clear-entrypoint")]
        clear_entrypoint: bool,
        /// Set the command, e.g. `--cmd /bin/sh --cmd -c`
        #[clap(long = "cmd")]
        cmd: Vec<String>,
        /// Clear any existing command
        #[clap(long = "clear-cmd")]
        clear_cmd: bool,
        /// Set the user to run as
        #[clap(long = "user")]
        user: Option<String>,
        /// Set the working directory
        #[clap(long = "workingdir")]
        working_dir: Option<String>,
        /// Set the stop signal
        #[clap(long = "stop-signal")]
        stop_signal: Option<String>,
        /// Add an environment variable, specified as KEY=VALUE. May be repeated.
        #[clap(long = "env", value_parser = kv_parser)]
        env: Vec<(String, String)>,
        /// Remove an environment variable by key. May be repeated.
        #[clap(long = "remove-env")]
        remove_env: Vec<String>,
        /// Add a label, specified as KEY=VALUE. May be repeated.
        #[clap(long = "label", value_parser = kv_parser)]
        label: Vec<(String, String)>,
        /// Remove a label by key. May be repeated.
        #[clap(long = "remove-label")]
        remove_label: Vec<String>,
        /// Add an exposed port, e.g. `8080/tcp`. May be repeated.
        #[clap(long = "expose")]
        expose: Vec<String>,
        /// Add a volume path. May be repeated.
        #[clap(long = "volume")]
        volume: Vec<String>,
    },
    /// Garbage-collect stale scratch directories left by dead processes
    Gc {
        /// Path to the OCI image layout
        #[clap(long = "image")]
        image: PathBuf,
    },
    /// Print a tagged manifest's layers and config summary
    Stat {
        /// Path to the OCI image layout
        #[clap(long = "image")]
        image: PathBuf,
        /// Tag of the manifest to inspect
        #[clap(long = "tag")]
        tag: String,
    },
}
