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
use std::fs::File;
use std::path::Path;

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use tracing::debug;

/// Error types for decoding audio files.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported or unrecognized format: {0}")]
    Format(String),

    #[error("No audio track found")]
    NoTrack,

    #[error("Sample rate not specified")]
    MissingSampleRate,

    #[error("File contains no audio frames")]
    Empty,

    #[error("Audio file error: {0}")]
    Audio(#[from] SymphoniaError),
}

/// A fully decoded file, downmixed to mono.
pub struct DecodedAudio {
    /// Mono frames normalized to [-1, 1].
    pub frames: Vec<f32>,
    /// The sample rate of the file.
    pub sample_rate: u32,
    /// The channel count of the file before downmixing.
    pub source_channels: u16,
}

/// Decodes an entire audio file (WAV, FLAC, OGG, MP3, ...) into mono frames.
/// Multi-channel files are downmixed by averaging all channels.
pub fn decode_mono(path: &Path) -> Result<DecodedAudio, DecodeError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    // Create a hint to help the format registry guess the format
    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| DecodeError::Format(e.to_string()))?;
    let mut format_reader = probed.format;

    let track = format_reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoTrack)?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let sample_rate = params.sample_rate.ok_or(DecodeError::MissingSampleRate)?;
    let mut source_channels = params.channels.map(|c| c.count() as u16).unwrap_or(0);
    let mut decoder = get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Format(e.to_string()))?;

    let mut frames = match params.n_frames {
        Some(n_frames) => Vec::with_capacity(n_frames as usize),
        None => Vec::new(),
    };

    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            // Some formats report the end of the stream as a decode error.
            Err(SymphoniaError::DecodeError(_)) => break,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let channels = downmix_into(decoded, &mut frames);
                if channels > 0 {
                    source_channels = channels as u16;
                }
            }
            Err(SymphoniaError::DecodeError(e)) => {
                debug!(path = ?path, error = e, "Skipping undecodable packet");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if frames.is_empty() {
        return Err(DecodeError::Empty);
    }

    Ok(DecodedAudio {
        frames,
        sample_rate,
        source_channels,
    })
}

/// Appends the mono downmix of a decoded buffer to `out` and returns the
/// channel count observed in the buffer.
fn downmix_into(decoded: AudioBufferRef, out: &mut Vec<f32>) -> usize {
    match decoded {
        AudioBufferRef::F32(buf) => downmix_planes(&buf, out, |sample| sample),
        AudioBufferRef::F64(buf) => downmix_planes(&buf, out, |sample| sample as f32),
        AudioBufferRef::S8(buf) => downmix_planes(&buf, out, scale_s8),
        AudioBufferRef::S16(buf) => downmix_planes(&buf, out, scale_s16),
        AudioBufferRef::S24(buf) => downmix_planes(&buf, out, |sample| scale_s24(sample.inner())),
        AudioBufferRef::S32(buf) => downmix_planes(&buf, out, scale_s32),
        AudioBufferRef::U8(buf) => downmix_planes(&buf, out, scale_u8),
        AudioBufferRef::U16(buf) => downmix_planes(&buf, out, scale_u16),
        AudioBufferRef::U24(buf) => downmix_planes(&buf, out, |sample| scale_u24(sample.inner())),
        AudioBufferRef::U32(buf) => downmix_planes(&buf, out, scale_u32),
    }
}

/// Averages every plane of `buf` into one mono frame per input frame.
fn downmix_planes<T, F>(buf: &AudioBuffer<T>, out: &mut Vec<f32>, convert: F) -> usize
where
    T: symphonia::core::sample::Sample,
    F: Fn(T) -> f32,
{
    let frames = buf.frames();
    let channels = buf.spec().channels.count();
    if channels == 0 {
        return 0;
    }

    let planes = buf.planes();
    let planes = planes.planes();
    let scale = 1.0 / channels as f32;

    out.reserve(frames);
    for frame in 0..frames {
        let sum: f32 = planes.iter().map(|plane| convert(plane[frame])).sum();
        out.push(sum * scale);
    }
    channels
}

#[inline]
pub(crate) fn scale_s8(sample: i8) -> f32 {
    sample as f32 / (1i64 << 7) as f32
}

#[inline]
pub(crate) fn scale_s16(sample: i16) -> f32 {
    sample as f32 / (1i64 << 15) as f32
}

#[inline]
pub(crate) fn scale_s24(sample: i32) -> f32 {
    sample as f32 / (1i64 << 23) as f32
}

#[inline]
pub(crate) fn scale_s32(sample: i32) -> f32 {
    sample as f32 / (1i64 << 31) as f32
}

#[inline]
pub(crate) fn scale_u8(sample: u8) -> f32 {
    (sample as f32 / u8::MAX as f32) * 2.0 - 1.0
}

#[inline]
pub(crate) fn scale_u16(sample: u16) -> f32 {
    (sample as f32 / u16::MAX as f32) * 2.0 - 1.0
}

#[inline]
pub(crate) fn scale_u24(sample: u32) -> f32 {
    let max = (1u32 << 24) - 1;
    (sample as f32 / max as f32) * 2.0 - 1.0
}

#[inline]
pub(crate) fn scale_u32(sample: u32) -> f32 {
    (sample as f32 / u32::MAX as f32) * 2.0 - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{write_wav_f32, write_wav_i16};

    #[test]
    fn test_decode_mono_i16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_wav_i16(&path, &[0, 16384, -16384, 32767], 1, 44100).unwrap();

        let decoded = decode_mono(&path).unwrap();
        assert_eq!(decoded.sample_rate, 44100);
        assert_eq!(decoded.source_channels, 1);
        assert_eq!(decoded.frames.len(), 4);
        assert_eq!(decoded.frames[0], 0.0);
        assert_eq!(decoded.frames[1], 0.5);
        assert_eq!(decoded.frames[2], -0.5);
    }

    #[test]
    fn test_decode_stereo_downmixes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        // Frames: (0.5, -0.5), (0.5, 0.0), (-0.25, -0.25)
        write_wav_i16(&path, &[16384, -16384, 16384, 0, -8192, -8192], 2, 48000).unwrap();

        let decoded = decode_mono(&path).unwrap();
        assert_eq!(decoded.sample_rate, 48000);
        assert_eq!(decoded.source_channels, 2);
        assert_eq!(decoded.frames, vec![0.0, 0.25, -0.25]);
    }

    #[test]
    fn test_decode_float() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.wav");
        write_wav_f32(&path, &[0.1, -0.2, 0.3], 22050).unwrap();

        let decoded = decode_mono(&path).unwrap();
        assert_eq!(decoded.sample_rate, 22050);
        assert_eq!(decoded.frames, vec![0.1, -0.2, 0.3]);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.wav");
        std::fs::write(&path, b"this is definitely not a wav file").unwrap();

        assert!(decode_mono(&path).is_err());
    }

    #[test]
    fn test_decode_missing_file() {
        let result = decode_mono(Path::new("/definitely/not/here.wav"));
        assert!(matches!(result, Err(DecodeError::Io(_))));
    }

    #[test]
    fn test_scaling_helpers() {
        assert_eq!(scale_s8(-128), -1.0);
        assert_eq!(scale_s16(-32768), -1.0);
        assert_eq!(scale_s24(1 << 22), 0.5);
        assert_eq!(scale_s32(i32::MIN), -1.0);
        assert_eq!(scale_u8(0), -1.0);
        assert_eq!(scale_u8(u8::MAX), 1.0);
        assert_eq!(scale_u16(u16::MAX), 1.0);
        assert_eq!(scale_u24((1 << 24) - 1), 1.0);
        assert_eq!(scale_u32(0), -1.0);
    }
}
