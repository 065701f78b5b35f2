// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ConfigError;

/// The persisted channel to sound assignments.
///
/// Channel keys are kept as strings so that a hand-edited file with a bad
/// channel still parses; the bad entry is dropped when the config is applied.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    /// The directory sounds are scanned from.
    #[serde(default)]
    sounds_dir: Option<PathBuf>,

    /// Sound names by channel.
    #[serde(default)]
    channel_sounds: BTreeMap<String, String>,
}

impl ChannelConfig {
    /// Creates an empty config for the given sounds directory.
    pub fn new(sounds_dir: Option<PathBuf>) -> ChannelConfig {
        ChannelConfig {
            sounds_dir,
            channel_sounds: BTreeMap::new(),
        }
    }

    /// Reads a config from a JSON file.
    pub fn from_file(path: &Path) -> Result<ChannelConfig, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        info!(path = ?path, "Loaded channel config");
        Ok(config)
    }

    /// Writes the config as pretty JSON.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        info!(path = ?path, "Saved channel config");
        Ok(())
    }

    pub fn sounds_dir(&self) -> Option<&Path> {
        self.sounds_dir.as_deref()
    }

    pub fn set_sounds_dir(&mut self, sounds_dir: Option<PathBuf>) {
        self.sounds_dir = sounds_dir;
    }

    /// Sets the sound for a channel.
    pub fn set(&mut self, channel: u8, name: &str) {
        self.channel_sounds
            .insert(channel.to_string(), name.to_string());
    }

    /// Returns the sound for a channel.
    pub fn get(&self, channel: u8) -> Option<&str> {
        self.channel_sounds
            .get(&channel.to_string())
            .map(String::as_str)
    }

    /// Raw entries as written in the file, channel keys unparsed.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.channel_sounds
            .iter()
            .map(|(channel, name)| (channel.as_str(), name.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.channel_sounds.is_empty()
    }
}
