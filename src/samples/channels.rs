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
use std::sync::Arc;

use tracing::{info, warn};

use super::error::SampleError;
use super::loader::{Sample, SampleStore};
use crate::config::ChannelConfig;

/// Number of MIDI channels.
pub const NUM_CHANNELS: usize = 16;

/// A sound bound to a channel, decoded at assignment time.
struct Assignment {
    name: String,
    sample: Arc<Sample>,
}

/// Maps MIDI channels to sounds.
pub struct ChannelMap {
    store: SampleStore,
    assignments: [Option<Assignment>; NUM_CHANNELS],
    /// Bumped whenever any assignment changes.
    generation: u64,
}

impl ChannelMap {
    /// Creates an empty map over the given store.
    pub fn new(store: SampleStore) -> ChannelMap {
        ChannelMap {
            store,
            assignments: Default::default(),
            generation: 0,
        }
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SampleStore {
        &mut self.store
    }

    /// Assigns a sound to a channel, decoding it now so that resolving never decodes.
    pub fn assign(&mut self, channel: u8, name: &str) -> Result<(), SampleError> {
        let slot = channel_index(channel)?;
        if !self.store.contains(name) {
            return Err(SampleError::UnknownSound(name.to_string()));
        }

        let sample = self.store.load_named(name)?;
        info!(channel, sound = name, "Assigned sound to channel");
        self.assignments[slot] = Some(Assignment {
            name: name.to_string(),
            sample,
        });
        self.generation += 1;
        Ok(())
    }

    /// Removes the sound from a channel, returning its name.
    pub fn unassign(&mut self, channel: u8) -> Option<String> {
        let slot = channel_index(channel).ok()?;
        let removed = self.assignments[slot].take()?;
        info!(channel, sound = removed.name, "Unassigned channel");
        self.generation += 1;
        Some(removed.name)
    }

    /// Returns the sample assigned to a channel.
    pub fn resolve(&self, channel: u8) -> Option<Arc<Sample>> {
        self.assignment(channel).map(|a| a.sample.clone())
    }

    pub fn assigned_name(&self, channel: u8) -> Option<&str> {
        self.assignment(channel).map(|a| a.name.as_str())
    }

    /// All assignments, sorted by channel.
    pub fn assignments(&self) -> Vec<(u8, String)> {
        self.assignments
            .iter()
            .enumerate()
            .filter_map(|(channel, a)| a.as_ref().map(|a| (channel as u8, a.name.clone())))
            .collect()
    }

    /// Changes every time an assignment is added, replaced or removed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Assigns the first known sound to channel 0 when nothing is assigned yet.
    /// Returns the assigned name.
    pub fn assign_default(&mut self) -> Result<Option<String>, SampleError> {
        if self.assignments.iter().any(Option::is_some) {
            return Ok(None);
        }
        let Some(first) = self.store.list_names().into_iter().next() else {
            return Ok(None);
        };
        self.assign(0, &first)?;
        Ok(Some(first))
    }

    /// Applies a saved config. The configured sounds directory is rescanned and
    /// existing assignments are replaced. Entries with a bad channel, an unknown
    /// sound or an undecodable file are skipped with a warning.
    pub fn load(&mut self, config: &ChannelConfig) -> Result<(), SampleError> {
        if let Some(dir) = config.sounds_dir() {
            self.store.scan(dir)?;
        }

        self.assignments = Default::default();
        self.generation += 1;

        for (channel, name) in config.entries() {
            let channel = match channel.parse::<u8>() {
                Ok(channel) if (channel as usize) < NUM_CHANNELS => channel,
                _ => {
                    warn!(channel, sound = name, "Skipping invalid channel in config");
                    continue;
                }
            };
            if let Err(e) = self.assign(channel, name) {
                warn!(channel, sound = name, err = %e, "Skipping channel assignment");
            }
        }

        info!(assigned = self.assignments().len(), "Applied channel config");
        Ok(())
    }

    /// Captures the current assignments.
    pub fn save(&self) -> ChannelConfig {
        let mut config = ChannelConfig::new(self.store.sounds_dir().map(|d| d.to_path_buf()));
        for (channel, name) in self.assignments() {
            config.set(channel, &name);
        }
        config
    }

    fn assignment(&self, channel: u8) -> Option<&Assignment> {
        self.assignments.get(channel as usize)?.as_ref()
    }
}

impl std::fmt::Debug for ChannelMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMap")
            .field("store", &self.store)
            .field("assignments", &self.assignments())
            .finish()
    }
}

fn channel_index(channel: u8) -> Result<usize, SampleError> {
    if (channel as usize) < NUM_CHANNELS {
        Ok(channel as usize)
    } else {
        Err(SampleError::InvalidChannel(channel))
    }
}
