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
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{crate_version, Parser, Subcommand};
use parking_lot::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

use soundkeys::{
    audio,
    config::{ChannelConfig, Settings},
    engine::EngineConfig,
    midi,
    player::Player,
    samples::{ChannelMap, SampleStore},
};

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "Plays pitch-shifted sounds from live MIDI input."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Lists the available MIDI input ports.
    MidiDevices {},
    /// Lists the sounds found in the given directory.
    Sounds {
        /// The path to the sounds directory.
        dir: PathBuf,
    },
    /// Assigns a sound to a MIDI channel and saves the channel config.
    Assign {
        /// The path to the sounds directory.
        #[arg(short, long)]
        sounds: PathBuf,
        /// The channel config to update. Created if it doesn't exist.
        #[arg(short, long)]
        config: PathBuf,
        /// The MIDI channel, 0-15.
        channel: u8,
        /// The sound name as listed by the sounds command.
        name: String,
    },
    /// Plays sounds from MIDI input until interrupted.
    Start {
        /// The path to the sounds directory.
        #[arg(short, long)]
        sounds: PathBuf,
        /// The MIDI input port, as a listing index or a name.
        #[arg(short, long, default_value = "0")]
        port: String,
        /// The channel config to load.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// The audio output device, as a name or listing index.
        #[arg(short, long)]
        device: Option<String>,
        /// The settings file.
        #[arg(long)]
        settings: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for (index, device) in devices.iter().enumerate() {
                println!("{}: {}", index, device);
            }
        }
        Commands::MidiDevices {} => {
            let devices = midi::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for (index, device) in devices.iter().enumerate() {
                println!("{}: {}", index, device);
            }
        }
        Commands::Sounds { dir } => {
            let mut store = sample_store(&Settings::load(None)?);
            store.scan(&dir)?;

            let names = store.list_names();
            if names.is_empty() {
                println!("No sounds found in {}.", dir.display());
                return Ok(());
            }

            println!("Sounds (count: {}):", names.len());
            for name in names {
                println!("- {}", name);
            }
        }
        Commands::Assign {
            sounds,
            config,
            channel,
            name,
        } => {
            let settings = Settings::load(None)?;
            let mut channel_map = ChannelMap::new(sample_store(&settings));
            load_channels(&mut channel_map, Some(&config), &sounds)?;
            channel_map.assign(channel, &name)?;
            channel_map.save().to_file(&config)?;
            println!("Channel {} -> {}", channel, name);
        }
        Commands::Start {
            sounds,
            port,
            config,
            device,
            settings,
        } => {
            let mut settings = Settings::load(settings.as_deref())?;
            if let Some(device) = device {
                settings.set_device(&device);
            }

            let mut channel_map = ChannelMap::new(sample_store(&settings));
            load_channels(&mut channel_map, config.as_deref(), &sounds)?;
            if let Some(name) = channel_map.assign_default()? {
                info!(sound = name, "Nothing assigned, using default sound on channel 0");
            }

            let assignments = channel_map.assignments();
            if assignments.is_empty() {
                println!("No sounds assigned.");
            } else {
                println!("Assignments:");
                for (channel, name) in assignments {
                    println!("- {}: {}", channel, name);
                }
            }

            let midi_device = match port.parse::<usize>() {
                Ok(index) => midi::get_device_by_index(index)?,
                Err(_) => midi::get_device(&port)?,
            };
            let audio_device = audio::get_device(settings.audio().device())?;
            let player = Player::start(
                Arc::new(RwLock::new(channel_map)),
                EngineConfig::from_settings(&settings),
                midi_device,
                audio_device,
            )?;

            println!("Listening on {}. Press Ctrl-C to stop.", port);
            tokio::signal::ctrl_c().await?;
            info!("Interrupted, shutting down");
            player.stop();
        }
    };

    Ok(())
}

/// Builds a sample store with the settings' rate, interpolation and sound options.
fn sample_store(settings: &Settings) -> SampleStore {
    let mut store = SampleStore::new(
        settings.audio().sample_rate(),
        settings.engine().interpolation(),
    );
    store.set_default_options(settings.sounds().default_options());
    for (name, options) in settings.sounds().overrides() {
        store.set_sound_options(&name, options);
    }
    store
}

/// Scans the sounds directory and applies the channel config, if there is one.
/// The sounds directory given on the command line wins over the stored one.
fn load_channels(
    channel_map: &mut ChannelMap,
    config: Option<&Path>,
    sounds: &Path,
) -> Result<(), Box<dyn Error>> {
    match config.filter(|path| path.exists()) {
        Some(path) => {
            let mut config = ChannelConfig::from_file(path)?;
            config.set_sounds_dir(Some(sounds.to_path_buf()));
            channel_map.load(&config)?;
        }
        None => {
            channel_map.store_mut().scan(sounds)?;
        }
    }
    Ok(())
}
