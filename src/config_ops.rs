//! Image-config mutation helpers.
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
//! `ocirepack config` edits an already-built `ImageConfiguration`'s
//! `config` object in place: entrypoint/cmd/env/labels/exposed-ports/
//! volumes/user/working-dir/stop-signal. Each helper takes ownership of
//! the existing `Config` (or builds a fresh default one), mutates the
//! field the caller asked for, and hands it back via `set_config`, the
//! same clone-mutate-replace shape used to fold CLI `--config.label`
//! flags into an image's OCI config.
use oci_spec::image::{Config, ImageConfiguration};
use std::collections::HashMap;

/// A single requested edit to an image's config object. One CLI
/// invocation of `ocirepack config` may carry several of these.
#[derive(Debug, Clone)]
pub enum ConfigEdit {
    SetEntrypoint(Vec<String>),
    ClearEntrypoint,
    SetCmd(Vec<String>),
    ClearCmd,
    SetUser(String),
    SetWorkingDir(String),
    SetStopSignal(String),
    AddEnv(String, String),
    RemoveEnv(String),
    SetLabel(String, String),
    RemoveLabel(String),
    AddExposedPort(String),
    AddVolume(String),
}

fn current_config(image_config: &ImageConfiguration) -> Config {
    image_config.config().clone().unwrap_or_default()
}

fn env_map(config: &Config) -> HashMap<String, String> {
    config
        .env()
        .clone()
        .unwrap_or_default()
        .iter()
        .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

fn env_vec(map: &HashMap<String, String>) -> Vec<String> {
    let mut pairs: Vec<String> = map.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs
}

/// Apply one edit to `image_config`'s embedded `Config`, replacing it.
pub fn apply_edit(image_config: &mut ImageConfiguration, edit: &ConfigEdit) {
    let mut config = current_config(image_config);
    match edit {
        ConfigEdit::SetEntrypoint(v) => {
            config.set_entrypoint(Some(v.clone()));
        }
        ConfigEdit::ClearEntrypoint => {
            config.set_entrypoint(None);
        }
        ConfigEdit::SetCmd(v) => {
            config.set_cmd(Some(v.clone()));
        }
        ConfigEdit::ClearCmd => {
            config.set_cmd(None);
        }
        ConfigEdit::SetUser(user) => {
            config.set_user(Some(user.clone()));
        }
        ConfigEdit::SetWorkingDir(dir) => {
            config.set_working_dir(Some(dir.clone()));
        }
        ConfigEdit::SetStopSignal(sig) => {
            config.set_stop_signal(Some(sig.clone()));
        }
        ConfigEdit::AddEnv(key, value) => {
            let mut env = env_map(&config);
            env.insert(key.clone(), value.clone());
            config.set_env(Some(env_vec(&env)));
        }
        ConfigEdit::RemoveEnv(key) => {
            let mut env = env_map(&config);
            env.remove(key);
            config.set_env(Some(env_vec(&env)));
        }
        ConfigEdit::SetLabel(key, value) => {
            let mut labels = config.labels().clone().unwrap_or_default();
            labels.insert(key.clone(), value.clone());
            config.set_labels(Some(labels));
        }
        ConfigEdit::RemoveLabel(key) => {
            if let Some(mut labels) = config.labels().clone() {
                labels.remove(key);
                config.set_labels(Some(labels));
            }
        }
        ConfigEdit::AddExposedPort(port) => {
            let mut ports = config.exposed_ports().clone().unwrap_or_default();
            if !ports.contains(port) {
                ports.push(port.clone());
            }
            config.set_exposed_ports(Some(ports));
        }
        ConfigEdit::AddVolume(volume) => {
            let mut volumes = config.volumes().clone().unwrap_or_default();
            if !volumes.contains(volume) {
                volumes.push(volume.clone());
            }
            config.set_volumes(Some(volumes));
        }
    }
    image_config.set_config(Some(config));
}

/// Apply a batch of edits in order.
pub fn apply_edits(image_config: &mut ImageConfiguration, edits: &[ConfigEdit]) {
    for edit in edits {
        apply_edit(image_config, edit);
    }
}
