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

//! Settings (YAML, with environment overrides) and the channel assignment file (JSON).

mod channels;
mod error;
mod settings;

pub use channels::ChannelConfig;
pub use error::ConfigError;
pub use settings::{AudioSettings, EngineSettings, Settings, SoundSettings};
