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
use std::{fmt, sync::Arc, time::Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::info;

use super::{MidiError, MidiEvent};

/// A mock device. Events are injected by hand instead of coming from a port.
#[derive(Clone)]
pub struct Device {
    name: String,
    created: Instant,
    sender: Arc<Mutex<Option<Sender<MidiEvent>>>>,
}

impl Device {
    /// Gets the given mock device.
    pub fn get(name: &str) -> Device {
        Device {
            name: name.to_string(),
            created: Instant::now(),
            sender: Arc::new(Mutex::new(None)),
        }
    }

    /// Parses raw bytes and forwards them as if they arrived from a port.
    /// Returns true if an event was delivered.
    pub fn mock_event(&self, raw: &[u8]) -> bool {
        let timestamp_us = self.created.elapsed().as_micros() as u64;
        let Some(event) = MidiEvent::parse(raw, timestamp_us) else {
            return false;
        };
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Returns true while events are being watched.
    pub fn is_watching(&self) -> bool {
        self.sender.lock().is_some()
    }
}

impl super::Device for Device {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn watch_events(&self, sender: Sender<MidiEvent>) -> Result<(), MidiError> {
        let mut current = self.sender.lock();
        if current.is_some() {
            return Err(MidiError::AlreadyWatching);
        }
        info!(device = self.name, "Watching MIDI events (mock).");
        *current = Some(sender);
        Ok(())
    }

    fn stop_watch_events(&self) {
        self.sender.lock().take();
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}
