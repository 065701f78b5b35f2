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
use std::collections::HashMap;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use tracing::info;

use super::error::ConfigError;
use crate::pitch::{Interpolation, A4_NOTE};
use crate::samples::SoundOptions;

/// Prefix for environment overrides, e.g. `SOUNDKEYS__AUDIO__SAMPLE_RATE=48000`.
const ENV_PREFIX: &str = "SOUNDKEYS";
const ENV_SEPARATOR: &str = "__";

const DEFAULT_DEVICE: &str = "default";
const DEFAULT_SAMPLE_RATE: u32 = 44100;
const DEFAULT_BLOCK_SIZE: usize = 256;
const DEFAULT_MAX_VOICES: usize = 128;
const DEFAULT_COMMAND_CAPACITY: usize = 1024;

/// The full settings file.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    audio: AudioSettings,

    #[serde(default)]
    engine: EngineSettings,

    #[serde(default)]
    sounds: SoundSettings,
}

impl Settings {
    /// Loads settings from an optional YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = ?path, "Loading settings");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Parses settings from a YAML string without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Settings, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?)
    }

    pub fn audio(&self) -> &AudioSettings {
        &self.audio
    }

    pub fn engine(&self) -> &EngineSettings {
        &self.engine
    }

    pub fn sounds(&self) -> &SoundSettings {
        &self.sounds
    }

    /// Replaces the audio device, as when it is given on the command line.
    pub fn set_device(&mut self, device: &str) {
        self.audio.device = Some(device.to_string());
    }
}

/// Audio output settings.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct AudioSettings {
    /// The output device: a name, an index, or a name starting with "mock".
    device: Option<String>,

    /// Engine and output sample rate in Hz (default: 44100).
    sample_rate: Option<u32>,

    /// Frames rendered per block (default: 256).
    block_size: Option<usize>,
}

impl AudioSettings {
    pub fn device(&self) -> &str {
        self.device.as_deref().unwrap_or(DEFAULT_DEVICE)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    pub fn block_size(&self) -> usize {
        self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE).max(1)
    }
}

/// Voice engine settings.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct EngineSettings {
    /// Maximum number of simultaneous voices (default: 128).
    max_voices: Option<usize>,

    /// Resampling quality (default: sinc).
    interpolation: Option<Interpolation>,

    /// Capacity of the command channel into the mixer (default: 1024).
    command_capacity: Option<usize>,
}

impl EngineSettings {
    pub fn max_voices(&self) -> usize {
        self.max_voices.unwrap_or(DEFAULT_MAX_VOICES).max(1)
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation.unwrap_or_default()
    }

    pub fn command_capacity(&self) -> usize {
        self.command_capacity
            .unwrap_or(DEFAULT_COMMAND_CAPACITY)
            .max(1)
    }
}

/// Per-sound playback options.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct SoundSettings {
    /// Base note for sounds without an override (default: 69).
    default_base_note: Option<u8>,

    /// Whether sounds loop while held (default: true).
    default_loop: Option<bool>,

    /// Overrides by sound name.
    #[serde(default)]
    overrides: HashMap<String, SoundOverride>,
}

/// Options for a single sound. Unset fields fall back to the defaults.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct SoundOverride {
    base_note: Option<u8>,

    #[serde(rename = "loop")]
    looping: Option<bool>,
}

impl SoundSettings {
    /// The options used by sounds without an override.
    pub fn default_options(&self) -> SoundOptions {
        SoundOptions {
            base_note: self.default_base_note.unwrap_or(A4_NOTE).min(127),
            looping: self.default_loop.unwrap_or(true),
        }
    }

    /// Returns each override resolved against the defaults.
    pub fn overrides(&self) -> Vec<(String, SoundOptions)> {
        let defaults = self.default_options();
        let mut overrides: Vec<(String, SoundOptions)> = self
            .overrides
            .iter()
            .map(|(name, sound)| {
                (
                    name.clone(),
                    SoundOptions {
                        base_note: sound.base_note.unwrap_or(defaults.base_note).min(127),
                        looping: sound.looping.unwrap_or(defaults.looping),
                    },
                )
            })
            .collect();
        overrides.sort_by(|a, b| a.0.cmp(&b.0));
        overrides
    }
}
