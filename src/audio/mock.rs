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
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, TryRecvError};
use tracing::{info, span, Level};

use super::thread_priority::{
    configure_render_thread_priority, render_thread_priority, rt_audio_enabled, PriorityOutcome,
};
use super::{DeviceError, OutputHandle, OutputStats, StreamSettings};
use crate::engine::VoiceMixer;

/// Channels the mock output renders.
const MOCK_CHANNELS: u16 = 2;

/// A mock device. Renders in real time on its own thread and discards the result.
#[derive(Clone)]
pub struct Device {
    name: String,
}

impl Device {
    /// Gets the given mock device.
    pub fn get(name: &str) -> Device {
        Device {
            name: name.to_string(),
        }
    }
}

impl super::Device for Device {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(
        &self,
        mut mixer: VoiceMixer,
        settings: StreamSettings,
    ) -> Result<OutputHandle, DeviceError> {
        let span = span!(Level::INFO, "start output (mock)");
        let _enter = span.enter();

        if settings.sample_rate == 0 {
            return Err(DeviceError::Config("sample rate must be positive".to_string()));
        }
        info!(
            device = self.name,
            sample_rate = settings.sample_rate,
            block_size = settings.block_size,
            "Starting mock output"
        );

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stats = Arc::new(OutputStats::default());
        let thread_stats = stats.clone();
        let block_size = settings.block_size.max(1);
        let period = Duration::from_secs_f64(block_size as f64 / settings.sample_rate as f64);

        let render_thread = thread::Builder::new()
            .name("soundkeys-mock-output".to_string())
            .spawn(move || {
                let mut outcome = PriorityOutcome::Pending;
                configure_render_thread_priority(
                    render_thread_priority(),
                    rt_audio_enabled(),
                    &mut outcome,
                );
                thread_stats.record_priority(outcome);

                let mut buffer = vec![0.0f32; block_size * MOCK_CHANNELS as usize];
                let mut next = Instant::now();
                loop {
                    match stop_rx.try_recv() {
                        Err(TryRecvError::Empty) => {}
                        _ => return,
                    }

                    mixer.render_interleaved(&mut buffer, MOCK_CHANNELS as usize);
                    thread_stats.record_block(&buffer);

                    next += period;
                    let now = Instant::now();
                    if next > now {
                        spin_sleep::sleep(next - now);
                    } else {
                        // Fell behind, don't try to catch up.
                        next = now;
                    }
                }
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        Ok(OutputHandle::new(
            &self.name,
            MOCK_CHANNELS,
            settings.sample_rate,
            stats,
            stop_tx,
            render_thread,
        ))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}
