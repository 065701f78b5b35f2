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

//! The voice engine.
//!
//! Work is split across two timing domains:
//! - [`VoiceEngine`] runs on the event side. It resolves sounds, pitch-shifts
//!   them and sends fully prepared voices to the mixer.
//! - [`VoiceMixer`] runs on the render side and only mixes what it is sent.
//!
//! The two talk over a bounded command channel. Voices the mixer is done with
//! come back over a second bounded channel so that buffers are freed here.
//! Releases that find the channel full wait in an event-side queue and are
//! never dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::midi::{MidiEvent, MidiEventKind};
use crate::pitch::{self, Interpolation};
use crate::samples::{ChannelMap, Sample};

mod mixer;
mod voice;

pub use mixer::VoiceMixer;
pub use voice::{Voice, VoiceKey, VoiceState, NUM_NOTES};

/// Controller number for channel volume.
const CC_CHANNEL_VOLUME: u8 = 7;
/// Controller number for all sound off.
const CC_ALL_SOUND_OFF: u8 = 120;
/// Controller number for all notes off.
const CC_ALL_NOTES_OFF: u8 = 123;

/// Resampled buffers kept before the cache is cleared.
const MAX_CACHED_BUFFERS: usize = 256;

/// How many times shutdown waits for the mixer to take queued commands.
const SHUTDOWN_FLUSH_ATTEMPTS: usize = 50;

/// Instructions from the event side to the mixer.
pub(crate) enum EngineCommand {
    /// Start a voice, replacing any voice with the same key.
    Start(Voice),
    /// Stop the voice at a key.
    Stop(VoiceKey),
    /// Set the volume of the voice at a key.
    SetVolume { key: VoiceKey, volume: f32 },
    /// Set the volume of every voice on a channel.
    SetChannelVolume { channel: u8, volume: f32 },
    /// Stop every voice on a channel, or on all channels.
    AllNotesOff(Option<u8>),
}

/// Engine sizing and quality.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub max_voices: usize,
    pub block_size: usize,
    pub command_capacity: usize,
    pub interpolation: Interpolation,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> EngineConfig {
        EngineConfig {
            sample_rate: settings.audio().sample_rate(),
            max_voices: settings.engine().max_voices(),
            block_size: settings.audio().block_size(),
            command_capacity: settings.engine().command_capacity(),
            interpolation: settings.engine().interpolation(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::from_settings(&Settings::default())
    }
}

/// A resampled buffer, holding on to its source so the cache key stays unique.
struct CachedBuffer {
    _sample: Arc<Sample>,
    buffer: Arc<[f32]>,
}

/// Event-side handle to the voice engine.
pub struct VoiceEngine {
    channel_map: Arc<RwLock<ChannelMap>>,
    command_tx: Sender<EngineCommand>,
    /// Commands waiting for room in the command channel, in send order.
    pending: VecDeque<EngineCommand>,
    retire_rx: Receiver<Voice>,
    sample_rate: u32,
    interpolation: Interpolation,
    /// Resampled buffers by (sample address, note).
    cache: HashMap<(usize, u8), CachedBuffer>,
    /// Channel map generation the cache was filled under.
    cache_generation: u64,
    /// Start order of voices.
    sequence: u64,
    active_voices: Arc<AtomicUsize>,
}

impl VoiceEngine {
    /// Creates an engine and the mixer it drives.
    pub fn new(
        channel_map: Arc<RwLock<ChannelMap>>,
        config: EngineConfig,
    ) -> (VoiceEngine, VoiceMixer) {
        let command_capacity = config.command_capacity.max(1);
        let (command_tx, command_rx) = bounded(command_capacity);
        // Enough room for every voice to be retired at once, plus a block of churn.
        let (retire_tx, retire_rx) = bounded(config.max_voices.max(1) * 2);
        let active_voices = Arc::new(AtomicUsize::new(0));

        let mixer = VoiceMixer::new(
            command_rx,
            retire_tx,
            config.max_voices,
            config.block_size,
            config.sample_rate,
            active_voices.clone(),
        );

        info!(
            sample_rate = config.sample_rate,
            max_voices = config.max_voices,
            block_size = config.block_size,
            command_capacity,
            interpolation = ?config.interpolation,
            "Voice engine created"
        );

        let (cache_generation, store_rate) = {
            let channel_map = channel_map.read();
            (channel_map.generation(), channel_map.store().target_sample_rate())
        };
        if store_rate != config.sample_rate {
            warn!(
                store_rate,
                engine_rate = config.sample_rate,
                "Sounds are loaded at a different rate than the engine, pitch will be corrected per note"
            );
        }
        let engine = VoiceEngine {
            channel_map,
            command_tx,
            pending: VecDeque::new(),
            retire_rx,
            sample_rate: config.sample_rate,
            interpolation: config.interpolation,
            cache: HashMap::new(),
            cache_generation,
            sequence: 0,
            active_voices,
        };
        (engine, mixer)
    }

    pub fn channel_map(&self) -> &Arc<RwLock<ChannelMap>> {
        &self.channel_map
    }

    /// Voice count as of the last rendered block.
    pub fn active_voices(&self) -> usize {
        self.active_voices.load(Ordering::Relaxed)
    }

    /// Starts a voice for the channel's sound at the pitch of `note`.
    /// A velocity of zero is a note-off.
    pub fn note_on(&mut self, channel: u8, note: u8, velocity: u8) {
        if velocity == 0 {
            self.note_off(channel, note);
            return;
        }
        let Some(key) = VoiceKey::new(channel, note) else {
            debug!(channel, note, "Ignoring note on outside of range");
            return;
        };

        let (sample, generation) = {
            let channel_map = self.channel_map.read();
            (channel_map.resolve(channel), channel_map.generation())
        };
        let Some(sample) = sample else {
            debug!(channel, note, "No sound assigned to channel");
            return;
        };
        if generation != self.cache_generation {
            self.cache.clear();
            self.cache_generation = generation;
        }

        let buffer = match self.buffer_for(&sample, note) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(channel, note, sound = sample.name(), err = %e, "Unable to pitch shift sound");
                return;
            }
        };

        let volume = velocity.min(127) as f32 / 127.0;
        self.sequence += 1;
        debug!(
            channel,
            note,
            velocity,
            sound = sample.name(),
            frames = buffer.len(),
            "Note on"
        );
        let voice = Voice::new(key, sample, buffer, volume, self.sequence);
        self.send(EngineCommand::Start(voice));
    }

    /// Stops the voice at (channel, note), if any.
    pub fn note_off(&mut self, channel: u8, note: u8) {
        let Some(key) = VoiceKey::new(channel, note) else {
            return;
        };
        debug!(channel, note, "Note off");
        self.send(EngineCommand::Stop(key));
    }

    /// Sets the volume of every voice sounding on a channel.
    pub fn set_channel_volume(&mut self, channel: u8, volume: f32) {
        if channel as usize >= crate::samples::NUM_CHANNELS {
            return;
        }
        let volume = clamp_volume(volume);
        debug!(channel, volume, "Channel volume");
        self.send(EngineCommand::SetChannelVolume { channel, volume });
    }

    /// Sets the volume of a single voice.
    pub fn set_voice_volume(&mut self, channel: u8, note: u8, volume: f32) {
        let Some(key) = VoiceKey::new(channel, note) else {
            return;
        };
        self.send(EngineCommand::SetVolume {
            key,
            volume: clamp_volume(volume),
        });
    }

    /// Stops every voice on one channel, or on all channels.
    pub fn all_notes_off(&mut self, channel: Option<u8>) {
        if channel.is_some_and(|c| c as usize >= crate::samples::NUM_CHANNELS) {
            return;
        }
        debug!(channel = ?channel, "All notes off");
        if channel.is_none() {
            // Stopping everything supersedes whatever is still queued.
            self.pending.clear();
        }
        self.send(EngineCommand::AllNotesOff(channel));
    }

    /// Dispatches a MIDI event.
    pub fn handle_event(&mut self, event: &MidiEvent) {
        match event.kind {
            MidiEventKind::NoteOn => self.note_on(event.channel, event.data1, event.data2),
            MidiEventKind::NoteOff => self.note_off(event.channel, event.data1),
            MidiEventKind::ControlChange => match event.data1 {
                CC_CHANNEL_VOLUME => {
                    self.set_channel_volume(event.channel, event.data2 as f32 / 127.0)
                }
                CC_ALL_SOUND_OFF | CC_ALL_NOTES_OFF => self.all_notes_off(Some(event.channel)),
                controller => debug!(channel = event.channel, controller, "Ignoring controller"),
            },
        }
    }

    /// Drops voices the mixer is done with and retries queued commands.
    /// Returns how many voices were collected.
    pub fn collect_retired(&mut self) -> usize {
        self.flush_pending();
        let mut collected = 0;
        while let Ok(voice) = self.retire_rx.try_recv() {
            let key = voice.key();
            match voice.state() {
                VoiceState::Faulted => warn!(
                    channel = key.channel,
                    note = key.note,
                    sound = voice.sample().name(),
                    "Voice faulted and was dropped"
                ),
                state => debug!(
                    channel = key.channel,
                    note = key.note,
                    state = ?state,
                    "Voice retired"
                ),
            }
            collected += 1;
        }
        collected
    }

    /// Commands still waiting for room in the command channel.
    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    /// Stops every voice. Waits briefly for the mixer to take the stop if the
    /// command channel is full.
    pub fn shutdown(&mut self) {
        info!("Stopping all voices");
        self.all_notes_off(None);
        self.collect_retired();
        for _ in 0..SHUTDOWN_FLUSH_ATTEMPTS {
            if self.pending.is_empty() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
            self.collect_retired();
        }
        warn!(pending = self.pending.len(), "Mixer did not take the final stop");
    }

    /// Returns the pitch-shifted buffer for a sample at a note, resampling on first use.
    fn buffer_for(&mut self, sample: &Arc<Sample>, note: u8) -> Result<Arc<[f32]>, pitch::PitchError> {
        let cache_key = (Arc::as_ptr(sample) as usize, note);
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached.buffer.clone());
        }

        // Samples at another rate play back at the engine rate, so fold the
        // rate difference into the target pitch.
        let target_freq = pitch::note_to_freq(note) * sample.sample_rate() as f64
            / self.sample_rate.max(1) as f64;
        let shifted = pitch::shift(
            sample.frames(),
            sample.sample_rate(),
            sample.base_freq(),
            target_freq,
            self.interpolation,
        )?;
        let buffer: Arc<[f32]> = shifted.into();

        if self.cache.len() >= MAX_CACHED_BUFFERS {
            debug!(entries = self.cache.len(), "Clearing resample cache");
            self.cache.clear();
        }
        self.cache.insert(
            cache_key,
            CachedBuffer {
                _sample: sample.clone(),
                buffer: buffer.clone(),
            },
        );
        Ok(buffer)
    }

    /// Sends a command without blocking. Once anything is queued, later
    /// commands queue behind it so per-key order holds. Only voice starts are
    /// dropped when there is no room.
    fn send(&mut self, command: EngineCommand) {
        self.flush_pending();

        let command = if self.pending.is_empty() {
            match self.command_tx.try_send(command) {
                Ok(()) => return,
                Err(TrySendError::Disconnected(_)) => {
                    debug!("Mixer is gone, dropping command");
                    return;
                }
                Err(TrySendError::Full(command)) => command,
            }
        } else {
            command
        };

        if matches!(command, EngineCommand::Start(_)) {
            warn!("Mixer command channel is full, dropping note on");
            return;
        }
        debug!(pending = self.pending.len() + 1, "Mixer command channel is full, queueing command");
        self.pending.push_back(command);
    }

    /// Moves queued commands into the command channel while there is room.
    fn flush_pending(&mut self) {
        while let Some(command) = self.pending.pop_front() {
            match self.command_tx.try_send(command) {
                Ok(()) => {}
                Err(TrySendError::Full(command)) => {
                    self.pending.push_front(command);
                    return;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.pending.clear();
                    return;
                }
            }
        }
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}
