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
use std::{fmt, sync::Arc};

use crossbeam_channel::Sender;
use midly::live::LiveEvent;
use midly::MidiMessage;

mod midir;
mod mock;

/// Error types for MIDI input.
#[derive(Debug, thiserror::Error)]
pub enum MidiError {
    #[error("Unable to initialize MIDI input: {0}")]
    Init(#[from] ::midir::InitError),

    #[error("No MIDI input port found: {0}")]
    NoPort(String),

    #[error("Found too many MIDI input ports that match ({0}), use a less ambiguous name")]
    Ambiguous(String),

    #[error("Unable to read MIDI port info: {0}")]
    PortInfo(#[from] ::midir::PortInfoError),

    #[error("Unable to connect to MIDI input: {0}")]
    Connect(String),

    #[error("Already watching events")]
    AlreadyWatching,
}

/// The kinds of MIDI messages the engine reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MidiEventKind {
    NoteOn,
    NoteOff,
    ControlChange,
}

/// A parsed channel message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MidiEvent {
    pub kind: MidiEventKind,
    /// Channel, 0-15.
    pub channel: u8,
    /// Note or controller number.
    pub data1: u8,
    /// Velocity or controller value.
    pub data2: u8,
    /// Arrival time reported by the input, in microseconds.
    pub timestamp_us: u64,
}

impl MidiEvent {
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> MidiEvent {
        MidiEvent::new(MidiEventKind::NoteOn, channel, note, velocity)
    }

    pub fn note_off(channel: u8, note: u8) -> MidiEvent {
        MidiEvent::new(MidiEventKind::NoteOff, channel, note, 0)
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> MidiEvent {
        MidiEvent::new(MidiEventKind::ControlChange, channel, controller, value)
    }

    fn new(kind: MidiEventKind, channel: u8, data1: u8, data2: u8) -> MidiEvent {
        MidiEvent {
            kind,
            channel,
            data1,
            data2,
            timestamp_us: 0,
        }
    }

    /// Parses raw bytes. Returns None for anything but note and controller
    /// channel messages.
    pub fn parse(raw: &[u8], timestamp_us: u64) -> Option<MidiEvent> {
        let LiveEvent::Midi { channel, message } = LiveEvent::parse(raw).ok()? else {
            return None;
        };

        let (kind, data1, data2) = match message {
            MidiMessage::NoteOn { key, vel } => (MidiEventKind::NoteOn, key.as_int(), vel.as_int()),
            MidiMessage::NoteOff { key, vel } => {
                (MidiEventKind::NoteOff, key.as_int(), vel.as_int())
            }
            MidiMessage::Controller { controller, value } => (
                MidiEventKind::ControlChange,
                controller.as_int(),
                value.as_int(),
            ),
            _ => return None,
        };

        Some(MidiEvent {
            kind,
            channel: channel.as_int(),
            data1,
            data2,
            timestamp_us,
        })
    }
}

/// A MIDI input that forwards parsed events.
pub trait Device: fmt::Display + std::marker::Send + std::marker::Sync {
    /// Returns the name of the device.
    fn name(&self) -> String;

    /// Watches MIDI input for events and sends them to the given sender.
    fn watch_events(&self, sender: Sender<MidiEvent>) -> Result<(), MidiError>;

    /// Stops watching events.
    fn stop_watch_events(&self);
}

/// Lists MIDI inputs known to midir.
pub fn list_devices() -> Result<Vec<Box<dyn Device>>, MidiError> {
    midir::list()
}

/// Gets a device with the given name. Names starting with "mock" give a mock device.
pub fn get_device(name: &str) -> Result<Arc<dyn Device>, MidiError> {
    if name.starts_with("mock") {
        return Ok(Arc::new(mock::Device::get(name)));
    };

    Ok(Arc::new(midir::get(name)?))
}

/// Gets the input port at the given position in the port listing.
pub fn get_device_by_index(index: usize) -> Result<Arc<dyn Device>, MidiError> {
    Ok(Arc::new(midir::get_by_index(index)?))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_note_on() {
        let event = MidiEvent::parse(&[0x93, 60, 100], 42).unwrap();
        assert_eq!(
            event,
            MidiEvent {
                kind: MidiEventKind::NoteOn,
                channel: 3,
                data1: 60,
                data2: 100,
                timestamp_us: 42,
            }
        );
    }

    #[test]
    fn test_parse_note_off_and_controller() {
        let off = MidiEvent::parse(&[0x80, 61, 64], 0).unwrap();
        assert_eq!(off.kind, MidiEventKind::NoteOff);
        assert_eq!((off.channel, off.data1, off.data2), (0, 61, 64));

        let cc = MidiEvent::parse(&[0xBF, 7, 90], 0).unwrap();
        assert_eq!(cc, MidiEvent::control_change(15, 7, 90));
    }

    #[test]
    fn test_parse_velocity_zero_stays_note_on() {
        // Velocity zero is interpreted by the engine, not the parser.
        let event = MidiEvent::parse(&[0x90, 60, 0], 0).unwrap();
        assert_eq!(event, MidiEvent::note_on(0, 60, 0));
    }

    #[test]
    fn test_parse_ignores_other_messages() {
        // Program change.
        assert!(MidiEvent::parse(&[0xC0, 5], 0).is_none());
        // Pitch bend.
        assert!(MidiEvent::parse(&[0xE0, 0, 64], 0).is_none());
        // Timing clock.
        assert!(MidiEvent::parse(&[0xF8], 0).is_none());
        // Truncated and garbage.
        assert!(MidiEvent::parse(&[0x90, 60], 0).is_none());
        assert!(MidiEvent::parse(&[], 0).is_none());
        assert!(MidiEvent::parse(&[0x12, 0x34], 0).is_none());
    }

    #[test]
    fn test_mock_device_by_name() {
        let device = get_device("mock-keys").unwrap();
        assert_eq!(device.name(), "mock-keys");
        assert_eq!(device.to_string(), "mock-keys (Mock)");
    }
}
