//! Command-line arguments and configuration loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use relay_ipc::{OutputFraming, StreamConfig};

#[derive(Parser, Debug)]
#[command(name = "screenrelay")]
#[command(about = "Capture the screen through ffmpeg and relay encoded frames", long_about = None)]
#[command(version)]
pub struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Encoder output framing
    #[arg(long, value_enum)]
    pub framing: Option<FramingArg>,

    /// Capture frame rate
    #[arg(long)]
    pub fps: Option<u32>,

    /// Target bitrate in kbps
    #[arg(long)]
    pub bitrate: Option<u32>,

    /// Path to the ffmpeg executable
    #[arg(long)]
    pub ffmpeg: Option<String>,

    /// Write sample payloads to this file ("-" for stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short, long)]
    pub duration: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramingArg {
    /// VP8 in an IVF container
    Ivf,
    /// Raw H.264 Annex B stream
    Annexb,
}

impl From<FramingArg> for OutputFraming {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Ivf => OutputFraming::Ivf,
            FramingArg::Annexb => OutputFraming::AnnexB,
        }
    }
}

impl Cli {
    /// Build the stream configuration from the config file and flags.
    pub fn stream_config(&self) -> Result<StreamConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => StreamConfig::default(),
        };
        self.apply_overrides(&mut config);
        config.validate().context("invalid stream configuration")?;
        Ok(config)
    }

    /// How long to run, if bounded.
    pub fn run_duration(&self) -> Option<Duration> {
        self.duration.map(Duration::from_secs)
    }

    fn apply_overrides(&self, config: &mut StreamConfig) {
        if let Some(framing) = self.framing {
            config.framing = framing.into();
        }
        if let Some(fps) = self.fps {
            config.settings.frame_rate = fps;
        }
        if let Some(bitrate) = self.bitrate {
            config.settings.bitrate_kbps = bitrate;
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            config.encoder_path = ffmpeg.clone();
        }
    }
}

fn load_config(path: &Path) -> Result<StreamConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
}
