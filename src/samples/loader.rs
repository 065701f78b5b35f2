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

//! Sound discovery, decoding and caching.
//!
//! Sounds are decoded entirely into memory, converted to the engine sample rate
//! and kept behind an `Arc` so that any number of voices can read them.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::error::SampleError;
use crate::audio::decode;
use crate::pitch::{self, Interpolation, A4_NOTE};

/// File extensions picked up when scanning a sounds directory.
const AUDIO_EXTENSIONS: [&str; 6] = ["wav", "flac", "ogg", "mp3", "aif", "aiff"];

/// An immutable decoded sound.
#[derive(Debug)]
pub struct Sample {
    /// The logical name of the sound.
    name: String,
    /// Mono frames normalized to [-1, 1].
    frames: Vec<f32>,
    /// Sample rate of the frames.
    sample_rate: u32,
    /// The note at which the recording plays at its natural pitch.
    base_note: u8,
    /// Whether voices of this sound loop until released.
    looping: bool,
}

impl Sample {
    /// Creates a new sample.
    pub fn new(
        name: &str,
        frames: Vec<f32>,
        sample_rate: u32,
        base_note: u8,
        looping: bool,
    ) -> Sample {
        Sample {
            name: name.to_string(),
            frames,
            sample_rate,
            base_note,
            looping,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frames(&self) -> &[f32] {
        &self.frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn base_note(&self) -> u8 {
        self.base_note
    }

    /// The frequency of the base note.
    pub fn base_freq(&self) -> f64 {
        pitch::note_to_freq(self.base_note)
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames.len() as f64 / self.sample_rate.max(1) as f64)
    }

    /// Returns the memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.frames.len() * std::mem::size_of::<f32>()
    }
}

/// Per-sound playback options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SoundOptions {
    /// The note the recording was made at.
    pub base_note: u8,
    /// Whether the sound loops while the key is held.
    pub looping: bool,
}

impl Default for SoundOptions {
    fn default() -> Self {
        // Recordings are assumed to sit at A4 and to sustain while held.
        SoundOptions {
            base_note: A4_NOTE,
            looping: true,
        }
    }
}

/// Indexes a sounds directory and caches decoded sounds by path.
pub struct SampleStore {
    /// The directory last scanned.
    sounds_dir: Option<PathBuf>,
    /// Known sounds by name.
    index: BTreeMap<String, PathBuf>,
    /// Cache of decoded sounds by file path.
    cache: HashMap<PathBuf, Arc<Sample>>,
    /// Target sample rate (matches audio output).
    target_sample_rate: u32,
    /// Interpolation used for sample rate conversion.
    interpolation: Interpolation,
    /// Options for sounds without an override.
    default_options: SoundOptions,
    /// Per-sound overrides by name.
    sound_options: HashMap<String, SoundOptions>,
}

impl SampleStore {
    /// Creates a new, empty store.
    pub fn new(target_sample_rate: u32, interpolation: Interpolation) -> SampleStore {
        SampleStore {
            sounds_dir: None,
            index: BTreeMap::new(),
            cache: HashMap::new(),
            target_sample_rate,
            interpolation,
            default_options: SoundOptions::default(),
            sound_options: HashMap::new(),
        }
    }

    /// Scans a directory recursively for sound files, replacing the current index.
    /// Sounds that disappeared from disk are evicted from the cache.
    pub fn scan(&mut self, dir: &Path) -> Result<usize, SampleError> {
        if !dir.is_dir() {
            return Err(SampleError::InvalidDirectory(dir.to_path_buf()));
        }

        let mut index = BTreeMap::new();
        scan_dir(dir, dir, &mut index)?;

        let before = self.cache.len();
        self.cache
            .retain(|path, _| index.values().any(|indexed| indexed == path));
        let evicted = before - self.cache.len();

        self.index = index;
        self.sounds_dir = Some(dir.to_path_buf());

        info!(
            dir = ?dir,
            sounds = self.index.len(),
            evicted,
            "Scanned sounds directory"
        );
        Ok(self.index.len())
    }

    /// Loads a sound from a file into memory.
    /// Returns the cached sound if it was already loaded.
    pub fn load(&mut self, path: &Path) -> Result<Arc<Sample>, SampleError> {
        if let Some(sample) = self.cache.get(path) {
            debug!(path = ?path, "Using cached sample");
            return Ok(sample.clone());
        }

        if !path.exists() {
            return Err(SampleError::NotFound(path.to_path_buf()));
        }

        info!(path = ?path, "Loading sample into memory");

        let decoded = decode::decode_mono(path).map_err(|e| SampleError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let frames = if decoded.sample_rate != self.target_sample_rate {
            info!(
                source_rate = decoded.sample_rate,
                target_rate = self.target_sample_rate,
                "Transcoding sample"
            );
            let ratio = decoded.sample_rate as f64 / self.target_sample_rate as f64;
            pitch::resample(&decoded.frames, ratio, self.interpolation)?
        } else {
            decoded.frames
        };

        let name = self.name_for_path(path);
        let options = self.options_for(&name);
        let sample = Arc::new(Sample::new(
            &name,
            frames,
            self.target_sample_rate,
            options.base_note,
            options.looping,
        ));

        info!(
            path = ?path,
            name,
            source_channels = decoded.source_channels,
            sample_rate = sample.sample_rate(),
            base_note = sample.base_note(),
            looping = sample.looping(),
            duration_ms = sample.duration().as_millis(),
            memory_kb = sample.memory_size() / 1024,
            "Sample loaded"
        );

        self.cache.insert(path.to_path_buf(), sample.clone());
        Ok(sample)
    }

    /// Loads a sound by its logical name.
    pub fn load_named(&mut self, name: &str) -> Result<Arc<Sample>, SampleError> {
        let path = self
            .path_for(name)
            .map(Path::to_path_buf)
            .ok_or_else(|| SampleError::UnknownSound(name.to_string()))?;
        self.load(&path)
    }

    /// Returns the names of all known sounds, sorted.
    pub fn list_names(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    /// Returns true if the store knows a sound by this name.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Returns the file backing a sound.
    pub fn path_for(&self, name: &str) -> Option<&Path> {
        self.index.get(name).map(PathBuf::as_path)
    }

    /// The directory last scanned.
    pub fn sounds_dir(&self) -> Option<&Path> {
        self.sounds_dir.as_deref()
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    /// Sets the options used by sounds without an override. Clears the cache so
    /// sounds are rebuilt with the new options on next load.
    pub fn set_default_options(&mut self, options: SoundOptions) {
        if self.default_options != options {
            self.default_options = options;
            self.cache.clear();
        }
    }

    /// Overrides the options of a single sound.
    pub fn set_sound_options(&mut self, name: &str, options: SoundOptions) {
        self.sound_options.insert(name.to_string(), options);
        if let Some(path) = self.index.get(name) {
            self.cache.remove(path);
        }
    }

    /// Returns the effective options for a sound.
    pub fn options_for(&self, name: &str) -> SoundOptions {
        self.sound_options
            .get(name)
            .copied()
            .unwrap_or(self.default_options)
    }

    /// Returns the total memory used by cached sounds.
    pub fn memory_usage(&self) -> usize {
        self.cache.values().map(|s| s.memory_size()).sum()
    }

    /// Finds the logical name of a path, falling back to the file stem for
    /// paths outside the scanned directory.
    fn name_for_path(&self, path: &Path) -> String {
        self.index
            .iter()
            .find(|(_, indexed)| indexed.as_path() == path)
            .map(|(name, _)| name.clone())
            .or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
            })
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleStore")
            .field("sounds_dir", &self.sounds_dir)
            .field("sounds", &self.index.len())
            .field("cached_samples", &self.cache.len())
            .field("target_sample_rate", &self.target_sample_rate)
            .field("total_memory_kb", &(self.memory_usage() / 1024))
            .finish()
    }
}

/// Recursively collects audio files below `dir` into `index`.
fn scan_dir(
    root: &Path,
    dir: &Path,
    index: &mut BTreeMap<String, PathBuf>,
) -> Result<(), SampleError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();

        if path.is_dir() {
            scan_dir(root, &path, index)?;
            continue;
        }

        if !is_audio_file(&path) {
            continue;
        }

        if let Some(name) = sound_name(root, &path) {
            debug!(name, path = ?path, "Found sound");
            index.insert(name, path);
        }
    }
    Ok(())
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            AUDIO_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// The path relative to the sounds directory, without extension, `/` separated.
fn sound_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
