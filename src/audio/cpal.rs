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
use std::{fmt, sync::Arc, thread};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;
use tracing::{error, info, span, Level};

use super::thread_priority::{
    configure_render_thread_priority, render_thread_priority, rt_audio_enabled, PriorityOutcome,
};
use super::{Device as AudioDevice, DeviceError, OutputHandle, OutputStats, StreamSettings};
use crate::engine::VoiceMixer;

/// A small wrapper around a cpal::Device.
pub struct Device {
    /// The name of the device.
    name: String,
    /// The maximum number of channels the device supports.
    max_channels: u16,
    /// The host ID of the device.
    host_id: cpal::HostId,
    /// The underlying cpal device.
    device: cpal::Device,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}) ({})",
            self.name,
            self.max_channels,
            self.host_id.name()
        )
    }
}

impl Device {
    /// Lists cpal devices and produces the Device trait.
    pub fn list() -> Result<Vec<Box<dyn AudioDevice>>, DeviceError> {
        Ok(Device::list_cpal_devices()?
            .into_iter()
            .map(|device| {
                let device: Box<dyn AudioDevice> = Box::new(device);
                device
            })
            .collect())
    }

    /// Lists cpal devices that have at least one output channel.
    fn list_cpal_devices() -> Result<Vec<Device>, DeviceError> {
        // Suppress noisy output here.
        let _shh_stdout = shh::stdout().map_err(|e| DeviceError::Host(e.to_string()))?;
        let _shh_stderr = shh::stderr().map_err(|e| DeviceError::Host(e.to_string()))?;

        let mut devices: Vec<Device> = Vec::new();
        for host_id in cpal::available_hosts() {
            let host = cpal::host_from_id(host_id).map_err(|e| DeviceError::Host(e.to_string()))?;
            let host_devices = match host.devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                let max_channels = max_output_channels(&device);
                if max_channels == 0 {
                    continue;
                }
                let Ok(name) = device.name() else {
                    continue;
                };
                devices.push(Device {
                    name,
                    max_channels,
                    host_id,
                    device,
                });
            }
        }

        devices.sort_by_key(|device| device.name.to_string());
        Ok(devices)
    }

    /// Gets a cpal device by name or listing index. "default" is the default
    /// output of the default host.
    pub fn get(name: &str) -> Result<Device, DeviceError> {
        if name == "default" {
            return Device::default_output();
        }

        let devices = Device::list_cpal_devices()?;
        if let Ok(index) = name.parse::<usize>() {
            let count = devices.len();
            return devices.into_iter().nth(index).ok_or_else(|| {
                DeviceError::NotFound(format!(
                    "no device at index {} ({} output devices available)",
                    index, count
                ))
            });
        }

        let (exact, partial): (Vec<Device>, Vec<Device>) = devices
            .into_iter()
            .filter(|device| device.name.contains(name))
            .partition(|device| device.name.trim() == name);

        let mut matches = if exact.is_empty() { partial } else { exact };
        match matches.len() {
            0 => Err(DeviceError::NotFound(format!(
                "no device found with name {}",
                name
            ))),
            1 => Ok(matches.swap_remove(0)),
            _ => Err(DeviceError::Ambiguous(
                matches
                    .iter()
                    .map(|device| device.name.clone())
                    .collect::<Vec<String>>()
                    .join(", "),
            )),
        }
    }

    fn default_output() -> Result<Device, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| DeviceError::NotFound("no default output device".to_string()))?;
        let name = device
            .name()
            .map_err(|e| DeviceError::Host(e.to_string()))?;
        Ok(Device {
            name,
            max_channels: max_output_channels(&device),
            host_id: host.id(),
            device,
        })
    }
}

impl AudioDevice for Device {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(
        &self,
        mixer: VoiceMixer,
        settings: StreamSettings,
    ) -> Result<OutputHandle, DeviceError> {
        let span = span!(Level::INFO, "start output (cpal)");
        let _enter = span.enter();

        let (config, sample_format) = negotiate(&self.device, settings)?;
        let channels = config.channels;
        info!(
            device = self.name,
            channels,
            sample_rate = settings.sample_rate,
            format = ?sample_format,
            buffer_size = ?config.buffer_size,
            "Opening output stream"
        );

        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stats = Arc::new(OutputStats::default());

        // The stream is created and kept inside its own thread.
        let device = self.device.clone();
        let thread_stats = stats.clone();
        let block_size = settings.block_size;
        let output_thread = thread::Builder::new()
            .name("soundkeys-output".to_string())
            .spawn(move || {
                let stream = match build_stream(
                    &device,
                    &config,
                    sample_format,
                    mixer,
                    thread_stats,
                    block_size,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Stream(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive until stopped or the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(OutputHandle::new(
                &self.name,
                channels,
                settings.sample_rate,
                stats,
                stop_tx,
                output_thread,
            )),
            Ok(Err(e)) => {
                let _ = output_thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = output_thread.join();
                Err(DeviceError::Stream(
                    "output thread exited before the stream started".to_string(),
                ))
            }
        }
    }
}

fn max_output_channels(device: &cpal::Device) -> u16 {
    device
        .supported_output_configs()
        .map(|configs| configs.map(|config| config.channels()).max().unwrap_or(0))
        .unwrap_or(0)
}

fn is_supported_format(format: cpal::SampleFormat) -> bool {
    matches!(
        format,
        cpal::SampleFormat::F32
            | cpal::SampleFormat::I16
            | cpal::SampleFormat::I32
            | cpal::SampleFormat::U16
    )
}

/// Picks an output configuration at the requested sample rate, preferring
/// float samples and stereo.
fn negotiate(
    device: &cpal::Device,
    settings: StreamSettings,
) -> Result<(cpal::StreamConfig, cpal::SampleFormat), DeviceError> {
    let rate = cpal::SampleRate(settings.sample_rate);
    let range = device
        .supported_output_configs()
        .map_err(|e| DeviceError::Config(e.to_string()))?
        .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
        .filter(|range| is_supported_format(range.sample_format()))
        .min_by_key(|range| {
            (
                range.sample_format() != cpal::SampleFormat::F32,
                range.channels() != 2,
                range.channels(),
            )
        })
        .ok_or_else(|| {
            DeviceError::Config(format!(
                "no supported output format at {}Hz",
                settings.sample_rate
            ))
        })?;

    let block = settings.block_size as u32;
    let buffer_size = match range.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&block) => {
            cpal::BufferSize::Fixed(block)
        }
        _ => cpal::BufferSize::Default,
    };

    let supported = range.with_sample_rate(rate);
    let sample_format = supported.sample_format();
    let mut config = supported.config();
    config.buffer_size = buffer_size;
    Ok((config, sample_format))
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    mixer: VoiceMixer,
    stats: Arc<OutputStats>,
    block_size: usize,
) -> Result<cpal::Stream, DeviceError> {
    match sample_format {
        cpal::SampleFormat::F32 => build_typed::<f32>(device, config, mixer, stats, block_size),
        cpal::SampleFormat::I16 => build_typed::<i16>(device, config, mixer, stats, block_size),
        cpal::SampleFormat::I32 => build_typed::<i32>(device, config, mixer, stats, block_size),
        cpal::SampleFormat::U16 => build_typed::<u16>(device, config, mixer, stats, block_size),
        other => Err(DeviceError::Config(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }
}

/// Builds a stream whose callback renders the mixer and converts from f32.
fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mixer: VoiceMixer,
    stats: Arc<OutputStats>,
    block_size: usize,
) -> Result<cpal::Stream, DeviceError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let priority = render_thread_priority();
    let rt_audio = rt_audio_enabled();
    let mut outcome = PriorityOutcome::Pending;
    let mut scratch = vec![0.0f32; block_size.max(1) * channels.max(1)];

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if outcome == PriorityOutcome::Pending {
                    configure_render_thread_priority(priority, rt_audio, &mut outcome);
                    stats.record_priority(outcome);
                }

                // Only grows if the host hands over more than a block.
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                let scratch = &mut scratch[..data.len()];
                mixer.render_interleaved(scratch, channels);
                for (dst, src) in data.iter_mut().zip(scratch.iter()) {
                    *dst = T::from_sample(*src);
                }
                stats.record_block(scratch);
            },
            |err| error!(err = %err, "Output stream error"),
            None,
        )
        .map_err(|e| DeviceError::Stream(e.to_string()))
}
