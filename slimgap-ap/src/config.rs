//! Player configuration
//!
//! Bootstrap settings only; nothing changes while running. Each setting
//! resolves in priority order:
//!
//! 1. Command-line argument
//! 2. Environment variable (`SLIMGAP_*`)
//! 3. TOML config file (`~/.config/slimgap/config.toml` or `--config`)
//! 4. Built-in default
//!
//! Example file:
//!
//! ```toml
//! server = "192.168.1.10"
//!
//! [player]
//! mac = "02:5a:67:00:00:01"
//!
//! [audio]
//! output = "paced"
//! output_rate = 44100
//! buffer_bytes = 3528000
//!
//! [logging]
//! level = "debug"
//! ```

use crate::audio::types::DEFAULT_OUTPUT_RATE;
use crate::error::{Error, Result};
use crate::playback::DEFAULT_CAPACITY_BYTES;
use serde::Deserialize;
use slimgap_common::config::{load_toml, resolve_config_path, resolve_value};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const SERVER_ENV_VAR: &str = "SLIMGAP_SERVER";
pub const MAC_ENV_VAR: &str = "SLIMGAP_MAC";
pub const OUTPUT_ENV_VAR: &str = "SLIMGAP_OUTPUT";
pub const OUTPUT_RATE_ENV_VAR: &str = "SLIMGAP_OUTPUT_RATE";
pub const BUFFER_BYTES_ENV_VAR: &str = "SLIMGAP_BUFFER_BYTES";
pub const DEVICE_ENV_VAR: &str = "SLIMGAP_DEVICE";

/// Locally administered MAC used when none is configured
pub const DEFAULT_MAC: [u8; 6] = [0x02, 0x5a, 0x67, 0x00, 0x00, 0x01];

/// How often observers get a position update
pub const DEFAULT_POSITION_INTERVAL: Duration = Duration::from_millis(500);

/// Which [`OutputDevice`](crate::audio::OutputDevice) drives the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputBackend {
    /// Real-time clocked null sink
    #[default]
    Paced,
    /// Audio device through cpal (feature `cpal-output`)
    Cpal,
}

impl FromStr for OutputBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "paced" => Ok(OutputBackend::Paced),
            "cpal" => Ok(OutputBackend::Cpal),
            other => Err(Error::Config(format!("Unknown output backend '{}'", other))),
        }
    }
}

/// TOML file layout
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// Music server host or host:port
    #[serde(default)]
    pub server: Option<String>,

    #[serde(default)]
    pub player: PlayerSection,

    #[serde(default)]
    pub audio: AudioSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerSection {
    /// MAC reported in HELO; the server uses it as the player id
    #[serde(default)]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioSection {
    #[serde(default)]
    pub output: Option<OutputBackend>,

    /// cpal device name (default device when absent)
    #[serde(default)]
    pub device: Option<String>,

    #[serde(default)]
    pub output_rate: Option<u32>,

    /// Playback buffer capacity in bytes
    #[serde(default)]
    pub buffer_bytes: Option<usize>,

    #[serde(default)]
    pub position_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log filter when `RUST_LOG` is unset (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "debug".to_string()
}

/// Values given on the command line (already merged with clap's env fallbacks)
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub server: Option<String>,
    pub mac: Option<String>,
    pub output: Option<OutputBackend>,
    pub device: Option<String>,
    pub output_rate: Option<u32>,
    pub buffer_bytes: Option<usize>,
}

/// Fully resolved player settings
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerConfig {
    pub server: String,
    pub mac: [u8; 6],
    pub output: OutputBackend,
    pub device: Option<String>,
    pub output_rate: u32,
    pub buffer_bytes: usize,
    pub position_interval: Duration,
    pub log_level: String,
}

impl PlayerConfig {
    /// Resolve every setting from CLI, environment, config file and defaults
    pub fn resolve(cli: CliOverrides) -> Result<Self> {
        let file = match resolve_config_path(cli.config.as_deref()) {
            Some(path) => {
                info!("Loading config from {}", path.display());
                load_toml::<TomlConfig>(&path)?
            }
            None => TomlConfig::default(),
        };
        Self::from_sources(cli, file)
    }

    /// Resolve against an already-loaded file
    pub fn from_sources(cli: CliOverrides, file: TomlConfig) -> Result<Self> {
        let server = cli
            .server
            .or_else(|| std::env::var(SERVER_ENV_VAR).ok().filter(|s| !s.is_empty()))
            .or(file.server)
            .ok_or_else(|| {
                Error::Config(format!(
                    "No music server configured (use --server, {} or the config file)",
                    SERVER_ENV_VAR
                ))
            })?;

        let mac_text = resolve_value(cli.mac, MAC_ENV_VAR, file.player.mac, String::new());
        let mac = if mac_text.is_empty() {
            DEFAULT_MAC
        } else {
            parse_mac(&mac_text)?
        };

        let output = resolve_value(cli.output, OUTPUT_ENV_VAR, file.audio.output, OutputBackend::default());
        let device = cli
            .device
            .or_else(|| std::env::var(DEVICE_ENV_VAR).ok().filter(|s| !s.is_empty()))
            .or(file.audio.device);

        let output_rate = resolve_value(
            cli.output_rate,
            OUTPUT_RATE_ENV_VAR,
            file.audio.output_rate,
            DEFAULT_OUTPUT_RATE,
        );
        if !(8_000..=384_000).contains(&output_rate) {
            return Err(Error::Config(format!("Output rate {}Hz out of range", output_rate)));
        }

        let buffer_bytes = resolve_value(
            cli.buffer_bytes,
            BUFFER_BYTES_ENV_VAR,
            file.audio.buffer_bytes,
            DEFAULT_CAPACITY_BYTES,
        );
        // At least a quarter second so back-pressure has room to work
        let minimum = output_rate as usize * 8 / 4;
        let buffer_bytes = if buffer_bytes < minimum {
            warn!("buffer_bytes {} too small, using {}", buffer_bytes, minimum);
            minimum
        } else {
            buffer_bytes
        };

        let position_interval = file
            .audio
            .position_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POSITION_INTERVAL);

        Ok(Self {
            server,
            mac,
            output,
            device,
            output_rate,
            buffer_bytes,
            position_interval,
            log_level: file.logging.level,
        })
    }
}

/// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated)
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = text.split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(Error::Config(format!("Invalid MAC address '{}'", text)));
    }

    let mut mac = [0u8; 6];
    for (byte, part) in mac.iter_mut().zip(parts) {
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| Error::Config(format!("Invalid MAC address '{}'", text)))?;
    }
    Ok(mac)
}
