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

//! Note/frequency conversion and pitch shifting by resampling.
//!
//! Pitch shifting here is plain resampling: a buffer played back at the engine
//! rate after being shortened by a factor of two sounds an octave higher. The
//! same primitive converts decoded files to the engine sample rate.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::Deserialize;
use tracing::debug;

/// Reference pitch for note 69 (A4).
pub const A4_FREQUENCY: f64 = 440.0;

/// MIDI note number of A4.
pub const A4_NOTE: u8 = 69;

/// Smallest pitch ratio applied. Anything lower is clamped to four octaves down.
pub const MIN_PITCH_RATIO: f64 = 1.0 / 16.0;

/// Largest pitch ratio applied. Anything higher is clamped to four octaves up.
pub const MAX_PITCH_RATIO: f64 = 16.0;

/// Input block size for the sinc resampler.
const INPUT_BLOCK_SIZE: usize = 1024;

/// Error types for pitch shifting.
#[derive(Debug, thiserror::Error)]
pub enum PitchError {
    #[error("Invalid frequency: {0}Hz")]
    InvalidFrequency(f64),

    #[error("Invalid sample rate: {0}Hz")]
    InvalidSampleRate(u32),

    #[error("Resampler construction failed: {0}")]
    ResamplerConstruction(#[from] rubato::ResamplerConstructionError),

    #[error("Resampling failed: {0}")]
    Resampler(#[from] rubato::ResampleError),
}

/// The interpolation used when resampling.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Band-limited sinc interpolation. Higher quality, more CPU per note-on.
    #[default]
    Sinc,
    /// Linear interpolation. Cheap, but aliases when shifting up.
    Linear,
}

/// Converts a MIDI note number to its frequency in 12-TET referenced to A4 = 440Hz.
pub fn note_to_freq(note: u8) -> f64 {
    A4_FREQUENCY * 2f64.powf((note as f64 - A4_NOTE as f64) / 12.0)
}

/// Converts a frequency to the closest MIDI note number.
/// Frequencies at or below zero map to note 0.
pub fn freq_to_note(freq: f64) -> u8 {
    if !freq.is_finite() || freq <= 0.0 {
        return 0;
    }
    let note = (A4_NOTE as f64 + 12.0 * (freq / A4_FREQUENCY).log2()).round();
    note.clamp(0.0, 127.0) as u8
}

/// Returns the output length for a resampling ratio. Never zero.
pub fn shifted_len(input_len: usize, ratio: f64) -> usize {
    ((input_len as f64 / ratio).round() as usize).max(1)
}

/// Clamps a pitch ratio to [MIN_PITCH_RATIO, MAX_PITCH_RATIO].
pub fn clamp_ratio(ratio: f64) -> f64 {
    let clamped = ratio.clamp(MIN_PITCH_RATIO, MAX_PITCH_RATIO);
    if clamped != ratio {
        debug!(ratio, clamped, "Pitch ratio out of range, clamping");
    }
    clamped
}

/// Resamples `samples` so that playing the result at `source_rate` sounds at
/// `target_freq` when the source sounds at `source_base_freq`.
///
/// The ratio `target_freq / source_base_freq` is clamped to
/// [MIN_PITCH_RATIO, MAX_PITCH_RATIO] and the output has exactly
/// `max(1, round(len / ratio))` frames. The output is fully determined by the
/// inputs.
pub fn shift(
    samples: &[f32],
    source_rate: u32,
    source_base_freq: f64,
    target_freq: f64,
    interpolation: Interpolation,
) -> Result<Vec<f32>, PitchError> {
    if source_rate == 0 {
        return Err(PitchError::InvalidSampleRate(source_rate));
    }
    for freq in [source_base_freq, target_freq] {
        if !freq.is_finite() || freq <= 0.0 {
            return Err(PitchError::InvalidFrequency(freq));
        }
    }

    let ratio = clamp_ratio(target_freq / source_base_freq);
    debug!(
        frames = samples.len(),
        source_rate,
        source_base_freq,
        target_freq,
        ratio,
        "Shifting pitch"
    );
    resample(samples, ratio, interpolation)
}

/// Resamples mono `samples` by `ratio` (input frames consumed per output frame).
/// A ratio of 2.0 halves the length, 0.5 doubles it.
pub fn resample(
    samples: &[f32],
    ratio: f64,
    interpolation: Interpolation,
) -> Result<Vec<f32>, PitchError> {
    if !ratio.is_finite() || ratio <= 0.0 {
        return Err(PitchError::InvalidFrequency(ratio));
    }

    let out_len = shifted_len(samples.len(), ratio);
    if samples.is_empty() {
        return Ok(vec![0.0; out_len]);
    }
    if ratio == 1.0 {
        return Ok(samples.to_vec());
    }

    match interpolation {
        Interpolation::Linear => Ok(resample_linear(samples, ratio, out_len)),
        Interpolation::Sinc => resample_sinc(samples, ratio, out_len),
    }
}

/// Linear interpolation between neighbouring input frames.
fn resample_linear(samples: &[f32], ratio: f64, out_len: usize) -> Vec<f32> {
    let mut output = Vec::with_capacity(out_len);

    for frame in 0..out_len {
        let source_pos = frame as f64 * ratio;
        let source_frame = source_pos.floor() as usize;
        let frac = source_pos.fract() as f32;

        let s0 = samples.get(source_frame).copied().unwrap_or(0.0);
        let s1 = samples.get(source_frame + 1).copied().unwrap_or(s0);

        output.push(s0 + (s1 - s0) * frac);
    }

    output
}

/// Band-limited resampling through rubato. The resampler's filter delay is
/// skipped and the tail is flushed with silence so the output lines up with
/// the input and has exactly `out_len` frames.
fn resample_sinc(samples: &[f32], ratio: f64, out_len: usize) -> Result<Vec<f32>, PitchError> {
    let sinc_params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        oversampling_factor: 128,
        interpolation: SincInterpolationType::Linear,
        window: WindowFunction::BlackmanHarris2,
    };

    // rubato expresses the ratio as output rate over input rate.
    let mut resampler = SincFixedIn::<f32>::new(1.0 / ratio, 1.0, sinc_params, INPUT_BLOCK_SIZE, 1)?;
    let delay = resampler.output_delay();
    let wanted = delay + out_len;

    let mut output: Vec<f32> = Vec::with_capacity(wanted + resampler.output_frames_max());
    let mut position = 0;

    while output.len() < wanted {
        let needed = resampler.input_frames_next();
        let remaining = samples.len().saturating_sub(position);

        let chunk = if remaining >= needed {
            let block: [&[f32]; 1] = [&samples[position..position + needed]];
            position += needed;
            resampler.process(&block[..], None)?
        } else if remaining > 0 {
            let block: [&[f32]; 1] = [&samples[position..]];
            position = samples.len();
            resampler.process_partial(Some(&block[..]), None)?
        } else {
            resampler.process_partial(None::<&[&[f32]]>, None)?
        };

        match chunk.into_iter().next() {
            Some(channel) if !channel.is_empty() => output.extend_from_slice(&channel),
            _ => break,
        }
    }

    output.drain(..delay.min(output.len()));
    output.resize(out_len, 0.0);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::audio_test_utils::{calculate_rms, generate_sine};

    #[test]
    fn test_note_to_freq_reference() {
        assert_eq!(note_to_freq(69), 440.0);
        assert!((note_to_freq(81) - 880.0).abs() < 1e-9);
        assert!((note_to_freq(57) - 220.0).abs() < 1e-9);
        assert!((note_to_freq(60) - 261.625_565_300_6).abs() < 1e-6);
    }

    #[test]
    fn test_note_freq_round_trip() {
        for note in 0..=127u8 {
            let freq = note_to_freq(note);
            assert_eq!(freq_to_note(freq), note);
            let again = note_to_freq(freq_to_note(freq));
            assert!((again - freq).abs() <= freq * 1e-12, "note {}", note);
        }
    }

    #[test]
    fn test_freq_to_note_edge_cases() {
        assert_eq!(freq_to_note(0.0), 0);
        assert_eq!(freq_to_note(-10.0), 0);
        assert_eq!(freq_to_note(f64::NAN), 0);
        assert_eq!(freq_to_note(1.0), 0);
        assert_eq!(freq_to_note(100_000.0), 127);
        // Slightly sharp still rounds to the nearest note.
        assert_eq!(freq_to_note(445.0), 69);
    }

    #[test]
    fn test_octave_up_halves_length() {
        let sample_rate = 44100;
        let input = generate_sine(440.0, 1.0, sample_rate, 1.0);

        for interpolation in [Interpolation::Sinc, Interpolation::Linear] {
            let output = shift(
                &input,
                sample_rate,
                note_to_freq(69),
                note_to_freq(81),
                interpolation,
            )
            .unwrap();
            assert_eq!(output.len(), 22050);
        }
    }

    #[test]
    fn test_octave_down_doubles_length() {
        let input = generate_sine(440.0, 0.5, 44100, 0.1);
        let output = shift(&input, 44100, 440.0, 220.0, Interpolation::Sinc).unwrap();
        assert_eq!(output.len(), input.len() * 2);
    }

    #[test]
    fn test_odd_ratio_length_rounds() {
        let input = vec![0.25f32; 1000];
        let ratio = note_to_freq(62) / note_to_freq(60);
        let output = shift(&input, 48000, note_to_freq(60), note_to_freq(62), Interpolation::Sinc)
            .unwrap();
        assert_eq!(output.len(), (1000.0 / ratio).round() as usize);
    }

    #[test]
    fn test_extreme_ratio_is_clamped() {
        let input = vec![0.5f32; 64];

        let up = shift(&input, 44100, 1.0, 1_000_000.0, Interpolation::Linear).unwrap();
        assert_eq!(up.len(), 4);

        let down = shift(&input, 44100, 1_000_000.0, 1.0, Interpolation::Linear).unwrap();
        assert_eq!(down.len(), 64 * 16);

        // A single frame shifted way up still yields one frame.
        let tiny = shift(&[0.3], 44100, 1.0, 1_000.0, Interpolation::Sinc).unwrap();
        assert_eq!(tiny.len(), 1);
    }

    #[test]
    fn test_unit_ratio_is_identity() {
        let input = generate_sine(440.0, 0.8, 44100, 0.05);
        let output = shift(&input, 44100, 440.0, 440.0, Interpolation::Sinc).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_shift_is_deterministic() {
        let input = generate_sine(330.0, 0.7, 44100, 0.2);
        let first = shift(&input, 44100, 440.0, 523.25, Interpolation::Sinc).unwrap();
        let second = shift(&input, 44100, 440.0, 523.25, Interpolation::Sinc).unwrap();
        assert_eq!(
            first.iter().map(|s| s.to_bits()).collect::<Vec<_>>(),
            second.iter().map(|s| s.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_sinc_preserves_level_and_alignment() {
        let input = generate_sine(200.0, 0.5, 44100, 0.5);
        let output = shift(&input, 44100, 440.0, 880.0, Interpolation::Sinc).unwrap();

        // Skip the edges where the filter rings.
        let middle = &output[1000..output.len() - 1000];
        let rms = calculate_rms(middle);
        let expected = 0.5 / std::f32::consts::SQRT_2;
        assert!((rms - expected).abs() < 0.02, "rms was {}", rms);

        // Without delay compensation the first frames would be silent padding.
        let head = calculate_rms(&output[8..48]);
        assert!(head > 0.1, "head rms was {}", head);
    }

    #[test]
    fn test_linear_interpolates_between_frames() {
        let input = vec![0.0f32, 1.0, 0.0, -1.0];
        let output = resample(&input, 0.5, Interpolation::Linear).unwrap();
        assert_eq!(output.len(), 8);
        assert_eq!(output[0], 0.0);
        assert_eq!(output[1], 0.5);
        assert_eq!(output[2], 1.0);
        assert_eq!(output[3], 0.5);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            shift(&[0.0], 0, 440.0, 440.0, Interpolation::Sinc),
            Err(PitchError::InvalidSampleRate(0))
        ));
        assert!(matches!(
            shift(&[0.0], 44100, 0.0, 440.0, Interpolation::Sinc),
            Err(PitchError::InvalidFrequency(_))
        ));
        assert!(matches!(
            shift(&[0.0], 44100, 440.0, f64::INFINITY, Interpolation::Sinc),
            Err(PitchError::InvalidFrequency(_))
        ));
    }

    #[test]
    fn test_empty_input_yields_one_silent_frame() {
        let output = shift(&[], 44100, 440.0, 880.0, Interpolation::Sinc).unwrap();
        assert_eq!(output, vec![0.0]);
    }
}
