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

//! A single sounding note.
//!
//! Voices are built by the event side with their resampled buffer already in
//! place, then handed to the mixer which only reads and advances them.

use std::fmt;
use std::sync::Arc;

use crate::samples::{Sample, NUM_CHANNELS};

/// Number of MIDI notes per channel.
pub const NUM_NOTES: usize = 128;

/// Largest gain change applied per frame while ramping toward a new volume.
const GAIN_STEP: f32 = 1.0 / 64.0;

/// Identity of a voice. At most one voice sounds per key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VoiceKey {
    pub channel: u8,
    pub note: u8,
}

impl VoiceKey {
    /// Returns a key if the channel and note are in range.
    pub fn new(channel: u8, note: u8) -> Option<VoiceKey> {
        ((channel as usize) < NUM_CHANNELS && (note as usize) < NUM_NOTES)
            .then_some(VoiceKey { channel, note })
    }

    /// Position of this key in a channel-major table.
    pub(crate) fn index(&self) -> usize {
        self.channel as usize * NUM_NOTES + self.note as usize
    }
}

impl fmt::Display for VoiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}/n{}", self.channel, self.note)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceState {
    /// Sounding.
    Active,
    /// Released by note-off, all-notes-off, retrigger or stealing.
    Stopped,
    /// A non-looping voice reached the end of its buffer.
    Exhausted,
    /// Dropped because its buffer was empty or produced a non-finite value.
    Faulted,
}

pub struct Voice {
    key: VoiceKey,
    sample: Arc<Sample>,
    /// Pitch-shifted frames at the engine rate.
    buffer: Arc<[f32]>,
    /// Next frame to read.
    position: usize,
    /// Target volume, 0-1.
    volume: f32,
    /// Gain currently applied, ramps toward `volume`.
    gain: f32,
    looping: bool,
    state: VoiceState,
    /// Start order, used to pick a voice to steal.
    sequence: u64,
}

impl Voice {
    /// Creates an active voice. Looping follows the sample's options.
    pub fn new(
        key: VoiceKey,
        sample: Arc<Sample>,
        buffer: Arc<[f32]>,
        volume: f32,
        sequence: u64,
    ) -> Voice {
        let volume = clamp_volume(volume);
        Voice {
            key,
            looping: sample.looping(),
            sample,
            buffer,
            position: 0,
            volume,
            gain: volume,
            state: VoiceState::Active,
            sequence,
        }
    }

    pub fn key(&self) -> VoiceKey {
        self.key
    }

    pub fn sample(&self) -> &Arc<Sample> {
        &self.sample
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_active(&self) -> bool {
        self.state == VoiceState::Active
    }

    /// Sets the target volume. The gain follows over the next frames.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = clamp_volume(volume);
    }

    /// Writes this voice's next `out.len()` frames into `out`, overwriting it.
    ///
    /// Returns false if the voice faulted, in which case `out` must be ignored.
    /// A non-looping voice that runs out writes silence for the rest of `out`
    /// and is exhausted afterwards.
    pub fn render(&mut self, out: &mut [f32]) -> bool {
        if self.state != VoiceState::Active {
            out.fill(0.0);
            return self.state != VoiceState::Faulted;
        }

        let len = self.buffer.len();
        if len == 0 {
            self.state = VoiceState::Faulted;
            return false;
        }

        for frame in out.iter_mut() {
            if self.position >= len {
                *frame = 0.0;
                continue;
            }

            self.step_gain();
            let value = self.buffer[self.position] * self.gain;
            if !value.is_finite() {
                self.state = VoiceState::Faulted;
                return false;
            }
            *frame = value;

            self.position += 1;
            if self.looping && self.position >= len {
                self.position = 0;
            }
        }

        if !self.looping && self.position >= len {
            self.state = VoiceState::Exhausted;
        }
        true
    }

    pub(crate) fn set_state(&mut self, state: VoiceState) {
        self.state = state;
    }

    fn step_gain(&mut self) {
        let diff = self.volume - self.gain;
        if diff.abs() <= GAIN_STEP {
            self.gain = self.volume;
        } else {
            self.gain += GAIN_STEP.copysign(diff);
        }
    }
}

impl fmt::Debug for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Voice")
            .field("key", &self.key)
            .field("sample", &self.sample.name())
            .field("frames", &self.buffer.len())
            .field("position", &self.position)
            .field("volume", &self.volume)
            .field("state", &self.state)
            .finish()
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::memory_sample;

    fn voice(frames: Vec<f32>, looping: bool, volume: f32) -> Voice {
        let buffer: Arc<[f32]> = frames.clone().into();
        let sample = memory_sample("test", frames, 69, looping);
        Voice::new(VoiceKey::new(0, 69).unwrap(), sample, buffer, volume, 1)
    }

    #[test]
    fn test_key_range() {
        assert!(VoiceKey::new(15, 127).is_some());
        assert!(VoiceKey::new(16, 0).is_none());
        assert!(VoiceKey::new(0, 128).is_none());
        assert_eq!(VoiceKey::new(1, 2).unwrap().index(), 130);
    }

    #[test]
    fn test_non_looping_zero_pads_and_exhausts() {
        let mut voice = voice(vec![0.1, 0.2, 0.3], false, 1.0);
        let mut out = [9.0f32; 5];

        assert!(voice.render(&mut out));
        assert_eq!(out, [0.1, 0.2, 0.3, 0.0, 0.0]);
        assert_eq!(voice.state(), VoiceState::Exhausted);
    }

    #[test]
    fn test_exhausts_after_block_that_reaches_end() {
        let mut voice = voice(vec![0.5; 4], false, 1.0);
        let mut out = [0.0f32; 2];

        voice.render(&mut out);
        assert!(voice.is_active());
        voice.render(&mut out);
        assert_eq!(out, [0.5, 0.5]);
        assert_eq!(voice.state(), VoiceState::Exhausted);
    }

    #[test]
    fn test_looping_wraps() {
        let mut voice = voice(vec![0.1, 0.2, 0.3], true, 1.0);
        let mut out = [0.0f32; 7];

        assert!(voice.render(&mut out));
        assert_eq!(out, [0.1, 0.2, 0.3, 0.1, 0.2, 0.3, 0.1]);
        assert!(voice.is_active());
        assert_eq!(voice.position(), 1);
    }

    #[test]
    fn test_volume_scales_and_ramps() {
        let mut voice = voice(vec![1.0; 256], true, 0.5);
        let mut out = [0.0f32; 4];
        voice.render(&mut out);
        assert_eq!(out, [0.5; 4]);

        voice.set_volume(0.0);
        let mut out = [0.0f32; 64];
        voice.render(&mut out);
        // Ramps down by one step per frame instead of jumping.
        assert_eq!(out[0], 0.5 - GAIN_STEP);
        assert!(out[0] > out[1]);
        assert_eq!(out[63], 0.0);
        assert_eq!(voice.gain(), 0.0);
    }

    #[test]
    fn test_volume_is_clamped() {
        let mut voice = voice(vec![1.0], true, 3.0);
        assert_eq!(voice.volume(), 1.0);
        voice.set_volume(-1.0);
        assert_eq!(voice.volume(), 0.0);
        voice.set_volume(f32::NAN);
        assert_eq!(voice.volume(), 0.0);
    }

    #[test]
    fn test_empty_buffer_faults() {
        let mut voice = voice(Vec::new(), true, 1.0);
        let mut out = [0.0f32; 4];
        assert!(!voice.render(&mut out));
        assert_eq!(voice.state(), VoiceState::Faulted);
    }

    #[test]
    fn test_non_finite_faults() {
        let mut voice = voice(vec![0.5, f32::NAN, 0.5], true, 1.0);
        let mut out = [0.0f32; 4];
        assert!(!voice.render(&mut out));
        assert_eq!(voice.state(), VoiceState::Faulted);
    }

    #[test]
    fn test_inactive_voice_renders_silence() {
        let mut voice = voice(vec![0.5], true, 1.0);
        voice.set_state(VoiceState::Stopped);

        let mut out = [1.0f32; 2];
        assert!(voice.render(&mut out));
        assert_eq!(out, [0.0, 0.0]);
        assert_eq!(voice.state(), VoiceState::Stopped);
    }
}
