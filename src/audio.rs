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
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crossbeam_channel::Sender;
use tracing::{info, warn};

use crate::engine::VoiceMixer;

pub mod cpal;
pub mod decode;
pub mod mock;
mod thread_priority;

pub use thread_priority::PriorityOutcome;

/// Error types for audio output. All of them surface before rendering starts.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No audio device found: {0}")]
    NotFound(String),

    #[error("Found too many audio devices that match ({0}), use a less ambiguous device name")]
    Ambiguous(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Unsupported audio configuration: {0}")]
    Config(String),

    #[error("Audio host error: {0}")]
    Host(String),
}

/// What the engine asks of an output stream. The device may settle on a
/// different channel count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    pub sample_rate: u32,
    /// Frames per render block.
    pub block_size: usize,
}

/// An audio output that drives a mixer.
pub trait Device: fmt::Display + std::marker::Send + std::marker::Sync {
    /// Returns the name of the device.
    fn name(&self) -> String;

    /// Opens a stream and starts rendering from the mixer. Returns once the
    /// stream is running, or with the error that kept it from starting.
    fn start(
        &self,
        mixer: VoiceMixer,
        settings: StreamSettings,
    ) -> Result<OutputHandle, DeviceError>;
}

/// Counters shared between a render thread and its handle.
#[derive(Debug, Default)]
pub struct OutputStats {
    blocks: AtomicU64,
    peak_bits: AtomicU32,
    priority: AtomicU8,
}

impl OutputStats {
    /// Number of blocks rendered so far.
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Peak absolute level of the most recent block.
    pub fn last_peak(&self) -> f32 {
        f32::from_bits(self.peak_bits.load(Ordering::Relaxed))
    }

    /// Result of raising the render thread's priority.
    pub fn priority(&self) -> PriorityOutcome {
        match self.priority.load(Ordering::Relaxed) {
            1 => PriorityOutcome::Normal,
            2 => PriorityOutcome::Realtime,
            3 => PriorityOutcome::Failed,
            _ => PriorityOutcome::Pending,
        }
    }

    pub(crate) fn record_block(&self, block: &[f32]) {
        let peak = block.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        self.peak_bits.store(peak.to_bits(), Ordering::Relaxed);
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_priority(&self, outcome: PriorityOutcome) {
        let value = match outcome {
            PriorityOutcome::Pending => 0,
            PriorityOutcome::Normal => 1,
            PriorityOutcome::Realtime => 2,
            PriorityOutcome::Failed => 3,
        };
        self.priority.store(value, Ordering::Relaxed);
    }
}

/// A running output stream. Dropping the handle stops it.
pub struct OutputHandle {
    device: String,
    channels: u16,
    sample_rate: u32,
    stats: Arc<OutputStats>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl OutputHandle {
    pub(crate) fn new(
        device: &str,
        channels: u16,
        sample_rate: u32,
        stats: Arc<OutputStats>,
        stop_tx: Sender<()>,
        thread: JoinHandle<()>,
    ) -> OutputHandle {
        info!(device, channels, sample_rate, "Audio output started");
        OutputHandle {
            device: device.to_string(),
            channels,
            sample_rate,
            stats,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }
    }

    /// The negotiated channel count.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// The negotiated sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn stats(&self) -> &Arc<OutputStats> {
        &self.stats
    }

    /// Stops the stream and waits for its thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the output thread.
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(device = self.device, "Audio output thread panicked");
            } else {
                info!(
                    device = self.device,
                    blocks = self.stats.blocks(),
                    "Audio output stopped"
                );
            }
        }
    }
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Lists devices known to cpal.
pub fn list_devices() -> Result<Vec<Box<dyn Device>>, DeviceError> {
    cpal::Device::list()
}

/// Gets a device by name or listing index. "default" is the host's default
/// output and names starting with "mock" give a mock device.
pub fn get_device(name: &str) -> Result<Arc<dyn Device>, DeviceError> {
    if name.starts_with("mock") {
        return Ok(Arc::new(mock::Device::get(name)));
    };

    Ok(Arc::new(cpal::Device::get(name)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_record() {
        let stats = OutputStats::default();
        assert_eq!(stats.blocks(), 0);
        assert_eq!(stats.last_peak(), 0.0);
        assert_eq!(stats.priority(), PriorityOutcome::Pending);

        stats.record_block(&[0.1, -0.7, 0.3]);
        stats.record_priority(PriorityOutcome::Realtime);
        assert_eq!(stats.blocks(), 1);
        assert_eq!(stats.last_peak(), 0.7);
        assert_eq!(stats.priority(), PriorityOutcome::Realtime);
    }

    #[test]
    fn test_get_mock_device() {
        let device = get_device("mock-output").unwrap();
        assert_eq!(device.name(), "mock-output");
    }
}
