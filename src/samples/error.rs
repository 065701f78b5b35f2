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
use std::path::PathBuf;

use crate::pitch::PitchError;

/// Error types for loading sounds and assigning them to channels.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("Sound file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to decode {}: {reason}", .path.display())]
    Decode { path: PathBuf, reason: String },

    #[error("Sound '{0}' not found in library")]
    UnknownSound(String),

    #[error("Invalid MIDI channel {0}, expected 0-15")]
    InvalidChannel(u8),

    #[error("Invalid sounds directory: {}", .0.display())]
    InvalidDirectory(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sample rate conversion failed: {0}")]
    Pitch(#[from] PitchError),
}
