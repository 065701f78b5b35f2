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
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use parking_lot::RwLock;
use tracing::{error, info, span, warn, Level, Span};

use crate::{
    audio::{self, OutputHandle, OutputStats, PriorityOutcome, StreamSettings},
    engine::{EngineConfig, VoiceEngine},
    midi::{self, MidiEvent},
    samples::ChannelMap,
};

/// How long the dispatch thread waits for an event before doing housekeeping.
const IDLE_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error(transparent)]
    Audio(#[from] audio::DeviceError),

    #[error(transparent)]
    Midi(#[from] midi::MidiError),

    #[error("Unable to start dispatch thread: {0}")]
    Thread(#[from] io::Error),
}

/// Plays the sounds assigned in a channel map from live MIDI input.
pub struct Player {
    channel_map: Arc<RwLock<ChannelMap>>,
    midi_device: Arc<dyn midi::Device>,
    output: Option<OutputHandle>,
    dispatch: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    events_handled: Arc<AtomicU64>,
    span: Span,
}

impl Player {
    /// Starts audio output, then the dispatch thread, then MIDI input. If any
    /// step fails the earlier ones are torn down again.
    pub fn start(
        channel_map: Arc<RwLock<ChannelMap>>,
        config: EngineConfig,
        midi_device: Arc<dyn midi::Device>,
        audio_device: Arc<dyn audio::Device>,
    ) -> Result<Player, PlayerError> {
        let span = span!(Level::INFO, "player");
        let _enter = span.enter();

        let (engine, mixer) = VoiceEngine::new(channel_map.clone(), config);
        let output = audio_device.start(
            mixer,
            StreamSettings {
                sample_rate: config.sample_rate,
                block_size: config.block_size,
            },
        )?;

        let (event_tx, event_rx) = unbounded::<MidiEvent>();
        let running = Arc::new(AtomicBool::new(true));
        let events_handled = Arc::new(AtomicU64::new(0));
        let dispatch = {
            let running = running.clone();
            let events_handled = events_handled.clone();
            let stats = output.stats().clone();
            let span = span.clone();
            thread::Builder::new()
                .name("soundkeys-dispatch".to_string())
                .spawn(move || {
                    let _enter = span.enter();
                    dispatch_events(engine, event_rx, running, events_handled, stats);
                })?
        };

        let mut player = Player {
            channel_map,
            midi_device,
            output: Some(output),
            dispatch: Some(dispatch),
            running,
            events_handled,
            span: span.clone(),
        };

        if let Err(e) = player.midi_device.watch_events(event_tx) {
            error!(err = %e, device = player.midi_device.name(), "Unable to watch MIDI input");
            player.shutdown();
            return Err(e.into());
        }

        info!(
            midi_device = player.midi_device.name(),
            audio_device = audio_device.name(),
            "Player started"
        );
        Ok(player)
    }

    pub fn channel_map(&self) -> &Arc<RwLock<ChannelMap>> {
        &self.channel_map
    }

    /// Output counters, while the output is running.
    pub fn output_stats(&self) -> Option<&Arc<OutputStats>> {
        self.output.as_ref().map(|output| output.stats())
    }

    /// Number of MIDI events dispatched to the engine.
    pub fn events_handled(&self) -> u64 {
        self.events_handled.load(Ordering::Relaxed)
    }

    /// Stops MIDI input, silences every voice and closes the output.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _enter = self.span.enter();
        if self.dispatch.is_none() && self.output.is_none() {
            return;
        }

        self.midi_device.stop_watch_events();
        self.running.store(false, Ordering::Relaxed);
        if let Some(dispatch) = self.dispatch.take() {
            if dispatch.join().is_err() {
                error!("Dispatch thread panicked");
            }
        }
        if let Some(output) = self.output.take() {
            output.stop();
        }
        info!("Player stopped");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Feeds MIDI events to the engine in arrival order until input goes away
/// or the player stops.
fn dispatch_events(
    mut engine: VoiceEngine,
    events: Receiver<MidiEvent>,
    running: Arc<AtomicBool>,
    events_handled: Arc<AtomicU64>,
    stats: Arc<OutputStats>,
) {
    let mut priority_reported = false;
    while running.load(Ordering::Relaxed) {
        match events.recv_timeout(IDLE_TICK) {
            Ok(event) => {
                engine.handle_event(&event);
                events_handled.fetch_add(1, Ordering::Relaxed);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                info!("MIDI input closed");
                break;
            }
        }
        engine.collect_retired();

        if !priority_reported {
            priority_reported = report_priority(stats.priority());
        }
    }
    engine.shutdown();
}

/// Logs the render thread's priority once it is known. Returns true once logged.
fn report_priority(outcome: PriorityOutcome) -> bool {
    match outcome {
        PriorityOutcome::Pending => return false,
        PriorityOutcome::Realtime => info!("Render thread running with real-time priority"),
        PriorityOutcome::Normal => info!("Render thread running with raised priority"),
        PriorityOutcome::Failed => warn!("Unable to raise render thread priority"),
    }
    true
}
