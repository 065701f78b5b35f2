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
use std::{fmt, mem};

use crossbeam_channel::Sender;
use midir::{MidiInput, MidiInputConnection, MidiInputPort};
use parking_lot::Mutex;
use tracing::{debug, info, span, Level};

use super::{MidiError, MidiEvent};

pub struct Device {
    name: String,
    input_port: MidiInputPort,
    event_connection: Mutex<Option<MidiInputConnection<()>>>,
}

impl super::Device for Device {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn watch_events(&self, sender: Sender<MidiEvent>) -> Result<(), MidiError> {
        let span = span!(Level::INFO, "watch events (midir)");
        let _enter = span.enter();

        let mut event_connection = self.event_connection.lock();
        if event_connection.is_some() {
            return Err(MidiError::AlreadyWatching);
        }

        info!(device = self.name, "Watching MIDI events.");

        let input = MidiInput::new("soundkeys input")?;
        let connection = input
            .connect(
                &self.input_port,
                "soundkeys input watcher",
                move |timestamp_us, raw_event, _| match MidiEvent::parse(raw_event, timestamp_us) {
                    Some(event) => {
                        if sender.send(event).is_err() {
                            debug!("Event receiver is gone, dropping MIDI event.");
                        }
                    }
                    None => debug!(raw = ?raw_event, "Ignoring MIDI message."),
                },
                (),
            )
            .map_err(|e| MidiError::Connect(e.to_string()))?;
        *event_connection = Some(connection);

        Ok(())
    }

    fn stop_watch_events(&self) {
        // Explicitly drop the connection.
        let event_connection = self.event_connection.lock().take();
        if event_connection.is_some() {
            info!(device = self.name, "Stopped watching MIDI events.");
        }
        mem::drop(event_connection);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Input)", self.name)
    }
}

/// Lists midir devices and produces the Device trait.
pub fn list() -> Result<Vec<Box<dyn super::Device>>, MidiError> {
    Ok(list_midir_devices()?
        .into_iter()
        .map(|device| {
            let device: Box<dyn super::Device> = Box::new(device);
            device
        })
        .collect())
}

/// Lists midir input ports in port order.
fn list_midir_devices() -> Result<Vec<Device>, MidiError> {
    let input = MidiInput::new("soundkeys input listing")?;
    input
        .ports()
        .into_iter()
        .map(|port| -> Result<Device, MidiError> {
            Ok(Device {
                name: input.port_name(&port)?,
                input_port: port,
                event_connection: Mutex::new(None),
            })
        })
        .collect()
}

/// Gets the midir device named `name`. An exact match wins over ports whose
/// names merely contain `name`.
pub fn get(name: &str) -> Result<Device, MidiError> {
    let mut devices = list_midir_devices()?;
    let names: Vec<&str> = devices.iter().map(|device| device.name.as_str()).collect();
    let index = select_port(&names, name)?;
    Ok(devices.swap_remove(index))
}

/// Picks the port for `name` from a listing, returning its position.
fn select_port(names: &[&str], name: &str) -> Result<usize, MidiError> {
    let (exact, partial): (Vec<usize>, Vec<usize>) = (0..names.len())
        .filter(|i| names[*i].contains(name))
        .partition(|i| names[*i].trim() == name);

    let matches = if exact.is_empty() { partial } else { exact };
    match matches.as_slice() {
        [] => Err(MidiError::NoPort(format!("no device found with name {}", name))),
        [index] => Ok(*index),
        _ => Err(MidiError::Ambiguous(
            matches
                .iter()
                .map(|i| names[*i])
                .collect::<Vec<&str>>()
                .join(", "),
        )),
    }
}

/// Gets the midir device at the given port index.
pub fn get_by_index(index: usize) -> Result<Device, MidiError> {
    let devices = list_midir_devices()?;
    let count = devices.len();
    devices.into_iter().nth(index).ok_or_else(|| {
        MidiError::NoPort(format!(
            "no device at index {} ({} input ports available)",
            index, count
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_port_prefers_exact_name() {
        let names = ["Keys 2", "Keys", "Pads"];
        assert_eq!(select_port(&names, "Keys").unwrap(), 1);
        assert_eq!(select_port(&names, "Pad").unwrap(), 2);
    }

    #[test]
    fn test_select_port_errors() {
        let names = ["Keys 1", "Keys 2"];
        match select_port(&names, "Keys") {
            Err(MidiError::Ambiguous(found)) => assert_eq!(found, "Keys 1, Keys 2"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(
            select_port(&names, "Drums"),
            Err(MidiError::NoPort(_))
        ));
    }
}
