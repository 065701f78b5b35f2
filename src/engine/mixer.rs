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

//! Render-side voice mixing.
//!
//! The mixer owns every playing voice. It is driven from the audio callback and
//! must not block, allocate, free voice buffers or log: commands arrive over a
//! bounded channel and removed voices are handed back over another one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use super::voice::{Voice, VoiceKey, VoiceState, NUM_NOTES};
use super::EngineCommand;
use crate::samples::NUM_CHANNELS;

/// Mixes active voices into mono blocks.
pub struct VoiceMixer {
    /// Fixed voice arena.
    slots: Vec<Option<Voice>>,
    /// (channel, note) to slot index, channel-major.
    table: Vec<Option<usize>>,
    /// Number of occupied slots.
    voice_count: usize,
    command_rx: Receiver<EngineCommand>,
    retire_tx: Sender<Voice>,
    /// Most commands applied per block.
    command_budget: usize,
    /// Per-voice render buffer. Blocks longer than this are rendered in pieces.
    scratch: Vec<f32>,
    /// Mono buffer for interleaved output.
    mono: Vec<f32>,
    /// Voice count visible to the event side.
    published_count: Arc<AtomicUsize>,
    sample_rate: u32,
}

impl VoiceMixer {
    pub(crate) fn new(
        command_rx: Receiver<EngineCommand>,
        retire_tx: Sender<Voice>,
        max_voices: usize,
        block_size: usize,
        sample_rate: u32,
        published_count: Arc<AtomicUsize>,
    ) -> VoiceMixer {
        let max_voices = max_voices.max(1);
        let block_size = block_size.max(1);
        VoiceMixer {
            slots: (0..max_voices).map(|_| None).collect(),
            table: vec![None; NUM_CHANNELS * NUM_NOTES],
            voice_count: 0,
            command_budget: command_rx.capacity().unwrap_or(max_voices).max(1),
            command_rx,
            retire_tx,
            scratch: vec![0.0; block_size],
            mono: vec![0.0; block_size],
            published_count,
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Maximum number of simultaneous voices.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of voices currently sounding.
    pub fn active_voices(&self) -> usize {
        self.voice_count
    }

    /// Fills `out` with the next `out.len()` mono frames.
    pub fn render_block(&mut self, out: &mut [f32]) {
        self.apply_commands();
        out.fill(0.0);

        let chunk_size = self.scratch.len();
        for chunk in out.chunks_mut(chunk_size) {
            self.mix_chunk(chunk);
        }

        for sample in out.iter_mut() {
            *sample = if sample.is_finite() {
                sample.clamp(-1.0, 1.0)
            } else {
                0.0
            };
        }

        self.published_count
            .store(self.voice_count, Ordering::Relaxed);
    }

    /// Renders `frames` mono frames into a new buffer.
    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        self.render_block(&mut out);
        out
    }

    /// Renders mono and copies each frame to every channel of an interleaved buffer.
    pub fn render_interleaved(&mut self, out: &mut [f32], channels: usize) {
        if channels <= 1 {
            self.render_block(out);
            return;
        }

        let mut mono = std::mem::take(&mut self.mono);
        let frames_per_chunk = mono.len().max(1);
        for chunk in out.chunks_mut(frames_per_chunk * channels) {
            let frames = chunk.len() / channels;
            let mono = &mut mono[..frames];
            self.render_block(mono);
            for (frame, value) in chunk.chunks_exact_mut(channels).zip(mono.iter()) {
                frame.fill(*value);
            }
            // A trailing partial frame gets silence.
            chunk[frames * channels..].fill(0.0);
        }
        self.mono = mono;
    }

    fn apply_commands(&mut self) {
        for _ in 0..self.command_budget {
            match self.command_rx.try_recv() {
                Ok(command) => self.apply(command),
                Err(_) => break,
            }
        }
    }

    fn apply(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Start(voice) => self.start(voice),
            EngineCommand::Stop(key) => {
                if let Some(slot) = self.table[key.index()] {
                    self.retire(slot, VoiceState::Stopped);
                }
            }
            EngineCommand::SetVolume { key, volume } => {
                if let Some(slot) = self.table[key.index()] {
                    if let Some(voice) = self.slots[slot].as_mut() {
                        voice.set_volume(volume);
                    }
                }
            }
            EngineCommand::SetChannelVolume { channel, volume } => {
                for note in 0..NUM_NOTES {
                    let Some(slot) = self.table[channel as usize * NUM_NOTES + note] else {
                        continue;
                    };
                    if let Some(voice) = self.slots[slot].as_mut() {
                        voice.set_volume(volume);
                    }
                }
            }
            EngineCommand::AllNotesOff(channel) => {
                for slot in 0..self.slots.len() {
                    let matches = self.slots[slot]
                        .as_ref()
                        .is_some_and(|voice| channel.map_or(true, |c| voice.key().channel == c));
                    if matches {
                        self.retire(slot, VoiceState::Stopped);
                    }
                }
            }
        }
    }

    /// Places a voice, replacing the voice at the same key or stealing the oldest.
    fn start(&mut self, voice: Voice) {
        let key = voice.key();
        let slot = match self.table[key.index()] {
            Some(slot) => {
                self.retire(slot, VoiceState::Stopped);
                slot
            }
            None => match self.slots.iter().position(Option::is_none) {
                Some(slot) => slot,
                None => {
                    let oldest = self.oldest_slot();
                    self.retire(oldest, VoiceState::Stopped);
                    oldest
                }
            },
        };

        self.slots[slot] = Some(voice);
        self.table[key.index()] = Some(slot);
        self.voice_count += 1;
    }

    fn oldest_slot(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, voice)| voice.as_ref().map(|v| (slot, v.sequence())))
            .min_by_key(|(_, sequence)| *sequence)
            .map(|(slot, _)| slot)
            .unwrap_or(0)
    }

    fn mix_chunk(&mut self, chunk: &mut [f32]) {
        for slot in 0..self.slots.len() {
            let Some(voice) = self.slots[slot].as_mut() else {
                continue;
            };

            let scratch = &mut self.scratch[..chunk.len()];
            if voice.render(scratch) {
                for (out, value) in chunk.iter_mut().zip(scratch.iter()) {
                    *out += *value;
                }
            }

            let state = voice.state();
            if state != VoiceState::Active {
                self.retire(slot, state);
            }
        }
    }

    /// Removes the voice in `slot` from the arena and the key table together and
    /// hands it back to the event side.
    fn retire(&mut self, slot: usize, state: VoiceState) {
        let Some(mut voice) = self.slots[slot].take() else {
            return;
        };
        if voice.is_active() {
            voice.set_state(state);
        }

        let index = voice.key().index();
        if self.table[index] == Some(slot) {
            self.table[index] = None;
        }
        self.voice_count -= 1;

        // A full return channel drops the voice here.
        let _ = self.retire_tx.try_send(voice);
    }

    /// The voice sounding at `key`.
    pub fn voice(&self, key: VoiceKey) -> Option<&Voice> {
        self.table[key.index()].and_then(|slot| self.slots[slot].as_ref())
    }

    /// Checks that every key in the table points at an active voice with that key.
    #[cfg(test)]
    pub(crate) fn check_table(&self) -> bool {
        let mapped = self.table.iter().flatten().count();
        mapped == self.voice_count
            && self.table.iter().enumerate().all(|(index, slot)| match slot {
                Some(slot) => self.slots[*slot]
                    .as_ref()
                    .is_some_and(|voice| voice.is_active() && voice.key().index() == index),
                None => true,
            })
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;

    use super::*;
    use crate::testutil::audio_test_utils::{generate_sine, peak};
    use crate::testutil::memory_sample;

    struct Harness {
        mixer: VoiceMixer,
        commands: Sender<EngineCommand>,
        retired: Receiver<Voice>,
        sequence: u64,
    }

    impl Harness {
        fn new(max_voices: usize, block_size: usize) -> Harness {
            let (commands, command_rx) = bounded(64);
            let (retire_tx, retired) = bounded(64);
            let mixer = VoiceMixer::new(
                command_rx,
                retire_tx,
                max_voices,
                block_size,
                44100,
                Arc::new(AtomicUsize::new(0)),
            );
            Harness {
                mixer,
                commands,
                retired,
                sequence: 0,
            }
        }

        fn start(&mut self, channel: u8, note: u8, frames: Vec<f32>, looping: bool, volume: f32) {
            self.sequence += 1;
            let buffer: Arc<[f32]> = frames.clone().into();
            let sample = memory_sample("test", frames, 69, looping);
            let key = VoiceKey::new(channel, note).unwrap();
            let voice = Voice::new(key, sample, buffer, volume, self.sequence);
            self.commands.send(EngineCommand::Start(voice)).unwrap();
        }

        fn send(&self, command: EngineCommand) {
            self.commands.send(command).unwrap();
        }

        fn retired_states(&self) -> Vec<(VoiceKey, VoiceState)> {
            self.retired
                .try_iter()
                .map(|voice| (voice.key(), voice.state()))
                .collect()
        }
    }

    fn key(channel: u8, note: u8) -> VoiceKey {
        VoiceKey::new(channel, note).unwrap()
    }

    #[test]
    fn test_render_exact_length_without_voices() {
        let mut harness = Harness::new(8, 64);
        for frames in [1, 7, 64, 65, 1000] {
            let out = harness.mixer.render(frames);
            assert_eq!(out.len(), frames);
            assert!(out.iter().all(|s| *s == 0.0));
        }
    }

    #[test]
    fn test_render_exact_length_with_short_voice() {
        let mut harness = Harness::new(8, 16);
        harness.start(0, 60, vec![0.25; 5], false, 1.0);

        let out = harness.mixer.render(40);
        assert_eq!(out.len(), 40);
        assert_eq!(&out[..5], &[0.25; 5]);
        assert!(out[5..].iter().all(|s| *s == 0.0));
        assert_eq!(harness.mixer.active_voices(), 0);
        assert_eq!(
            harness.retired_states(),
            vec![(key(0, 60), VoiceState::Exhausted)]
        );
    }

    #[test]
    fn test_many_blocks_keep_length() {
        let mut harness = Harness::new(8, 32);
        harness.start(0, 60, vec![0.1; 100], true, 1.0);
        let mut out = vec![0.0f32; 17];
        for _ in 0..100 {
            harness.mixer.render_block(&mut out);
            assert_eq!(out.len(), 17);
            assert!(out.iter().all(|s| (*s - 0.1).abs() < 1e-6));
        }
        assert_eq!(harness.mixer.active_voices(), 1);
    }

    #[test]
    fn test_full_scale_sines_clip() {
        let mut harness = Harness::new(8, 256);
        let sine = generate_sine(440.0, 1.0, 44100, 0.1);
        harness.start(0, 60, sine.clone(), true, 1.0);
        harness.start(1, 60, sine, true, 1.0);

        let out = harness.mixer.render(4410);
        assert!(out.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
        assert_eq!(peak(&out), 1.0);
    }

    #[test]
    fn test_stop_before_render_is_silent() {
        let mut harness = Harness::new(8, 64);
        harness.start(2, 64, vec![0.5; 100], true, 1.0);
        harness.send(EngineCommand::Stop(key(2, 64)));

        let out = harness.mixer.render(64);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(
            harness.retired_states(),
            vec![(key(2, 64), VoiceState::Stopped)]
        );
        assert!(harness.mixer.check_table());
    }

    #[test]
    fn test_retrigger_restarts_at_zero() {
        let mut harness = Harness::new(8, 64);
        let ramp: Vec<f32> = (0..100).map(|i| i as f32 / 1000.0).collect();
        harness.start(0, 60, ramp.clone(), true, 1.0);

        let first = harness.mixer.render(10);
        assert_eq!(first[9], 0.009);

        harness.start(0, 60, ramp, true, 1.0);
        let second = harness.mixer.render(3);
        assert_eq!(second, vec![0.0, 0.001, 0.002]);
        assert_eq!(harness.mixer.active_voices(), 1);
        assert_eq!(
            harness.retired_states(),
            vec![(key(0, 60), VoiceState::Stopped)]
        );
        assert!(harness.mixer.check_table());
    }

    #[test]
    fn test_channel_volume_applies_to_active_voices() {
        let mut harness = Harness::new(8, 256);
        harness.start(3, 60, vec![1.0; 10], true, 1.0);
        harness.start(3, 62, vec![1.0; 10], true, 1.0);
        harness.start(4, 60, vec![1.0; 10], true, 0.4);
        harness.mixer.render(8);

        harness.send(EngineCommand::SetChannelVolume {
            channel: 3,
            volume: 0.25,
        });
        let out = harness.mixer.render(256);
        // Settled: two voices at 0.25 plus the untouched one at 0.4.
        assert!((out[255] - 0.9).abs() < 1e-6);
        assert_eq!(harness.mixer.voice(key(3, 60)).unwrap().volume(), 0.25);
        assert_eq!(harness.mixer.voice(key(4, 60)).unwrap().volume(), 0.4);
    }

    #[test]
    fn test_voice_volume() {
        let mut harness = Harness::new(8, 256);
        harness.start(0, 60, vec![1.0; 10], true, 1.0);
        harness.send(EngineCommand::SetVolume {
            key: key(0, 60),
            volume: 0.5,
        });
        // Unknown keys are ignored.
        harness.send(EngineCommand::SetVolume {
            key: key(9, 9),
            volume: 0.5,
        });

        let out = harness.mixer.render(128);
        assert_eq!(out[127], 0.5);
    }

    #[test]
    fn test_all_notes_off_by_channel() {
        let mut harness = Harness::new(8, 64);
        harness.start(0, 60, vec![0.1; 10], true, 1.0);
        harness.start(0, 61, vec![0.1; 10], true, 1.0);
        harness.start(1, 60, vec![0.1; 10], true, 1.0);

        harness.send(EngineCommand::AllNotesOff(Some(0)));
        harness.mixer.render(4);
        assert_eq!(harness.mixer.active_voices(), 1);
        assert!(harness.mixer.voice(key(1, 60)).is_some());

        harness.send(EngineCommand::AllNotesOff(None));
        let out = harness.mixer.render(4);
        assert_eq!(harness.mixer.active_voices(), 0);
        assert!(out.iter().all(|s| *s == 0.0));
        assert!(harness.mixer.check_table());
    }

    #[test]
    fn test_faulted_voice_does_not_silence_others() {
        let mut harness = Harness::new(8, 64);
        harness.start(0, 60, vec![0.25; 10], true, 1.0);
        harness.start(0, 61, vec![0.25, f32::INFINITY], true, 1.0);
        harness.start(0, 62, Vec::new(), true, 1.0);

        let out = harness.mixer.render(32);
        assert!(out.iter().all(|s| *s == 0.25));
        assert_eq!(harness.mixer.active_voices(), 1);

        let mut retired = harness.retired_states();
        retired.sort_by_key(|(key, _)| key.note);
        assert_eq!(
            retired,
            vec![
                (key(0, 61), VoiceState::Faulted),
                (key(0, 62), VoiceState::Faulted)
            ]
        );
        assert!(harness.mixer.check_table());
    }

    #[test]
    fn test_full_arena_steals_oldest() {
        let mut harness = Harness::new(2, 64);
        harness.start(0, 60, vec![0.1; 10], true, 1.0);
        harness.start(0, 61, vec![0.1; 10], true, 1.0);
        harness.start(0, 62, vec![0.1; 10], true, 1.0);

        harness.mixer.render(1);
        assert_eq!(harness.mixer.active_voices(), 2);
        assert!(harness.mixer.voice(key(0, 60)).is_none());
        assert!(harness.mixer.voice(key(0, 61)).is_some());
        assert!(harness.mixer.voice(key(0, 62)).is_some());
        assert_eq!(
            harness.retired_states(),
            vec![(key(0, 60), VoiceState::Stopped)]
        );
        assert!(harness.mixer.check_table());
    }

    #[test]
    fn test_render_interleaved_duplicates_channels() {
        let mut harness = Harness::new(8, 4);
        harness.start(0, 60, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], false, 1.0);

        let mut out = vec![9.0f32; 14];
        harness.mixer.render_interleaved(&mut out, 2);
        assert_eq!(
            out,
            vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3, 0.4, 0.4, 0.5, 0.5, 0.6, 0.6, 0.0, 0.0]
        );
    }

    #[test]
    fn test_published_count() {
        let (_commands, command_rx) = bounded(4);
        let (retire_tx, _retired) = bounded(4);
        let count = Arc::new(AtomicUsize::new(7));
        let mut mixer = VoiceMixer::new(command_rx, retire_tx, 4, 16, 44100, count.clone());

        mixer.render(16);
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(mixer.capacity(), 4);
    }

    #[test]
    fn test_full_retire_channel_drops_in_place() {
        let (commands, command_rx) = bounded(8);
        let (retire_tx, retired) = bounded(1);
        let mut mixer = VoiceMixer::new(
            command_rx,
            retire_tx,
            8,
            16,
            44100,
            Arc::new(AtomicUsize::new(0)),
        );
        for note in 0..3 {
            let sample = memory_sample("test", vec![0.1; 4], 69, true);
            let buffer: Arc<[f32]> = vec![0.1f32; 4].into();
            let voice = Voice::new(key(0, note), sample, buffer, 1.0, note as u64);
            commands.send(EngineCommand::Start(voice)).unwrap();
        }
        commands.send(EngineCommand::AllNotesOff(None)).unwrap();

        mixer.render(4);
        assert_eq!(mixer.active_voices(), 0);
        assert_eq!(retired.try_iter().count(), 1);
    }
}
