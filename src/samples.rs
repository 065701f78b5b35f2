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

//! Sound library.
//!
//! This module provides:
//! - Sound discovery and in-memory decoding with caching
//! - Per-sound base note and loop options
//! - MIDI channel to sound assignment

mod channels;
mod error;
mod loader;

pub use channels::{ChannelMap, NUM_CHANNELS};
pub use error::SampleError;
pub use loader::{Sample, SampleStore, SoundOptions};
