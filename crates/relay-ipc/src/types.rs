//! Common types used across IPC messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on a single frame payload (10 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// Default number of frames between throughput reports.
pub const DEFAULT_FPS_REPORT_INTERVAL: u64 = 200;

/// Encoder knobs passed through verbatim to the encoder command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Capture and encode frame rate.
    pub frame_rate: u32,

    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,

    /// Lower bitrate bound in kbps.
    pub min_bitrate_kbps: u32,

    /// Upper bitrate bound in kbps.
    pub max_bitrate_kbps: u32,

    /// Minimum quantizer.
    pub quantizer_min: u32,

    /// Maximum quantizer.
    pub quantizer_max: u32,

    /// Encoder speed/quality trade-off (libvpx `-speed`/`-cpu-used`).
    pub encoder_speed: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            bitrate_kbps: 800,
            min_bitrate_kbps: 400,
            max_bitrate_kbps: 1000,
            quantizer_min: 10,
            quantizer_max: 63,
            encoder_speed: 16,
        }
    }
}

impl StreamSettings {
    /// Nominal duration of one frame at the configured rate.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.frame_rate.max(1)))
    }
}

/// Framing the encoder writes on its stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFraming {
    /// IVF container: 32-byte file header, then 12-byte size-prefixed frames (VP8).
    #[default]
    Ivf,

    /// Raw H.264 elementary stream delimited by Annex B start codes.
    AnnexB,
}

impl OutputFraming {
    /// Returns the display name for this framing.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ivf => "ivf",
            Self::AnnexB => "annexb",
        }
    }
}

/// Region of the desktop handed to the screen grabber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureRegion {
    /// Horizontal offset of the region.
    pub offset_x: i32,

    /// Vertical offset of the region.
    pub offset_y: i32,

    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,
}

impl Default for CaptureRegion {
    fn default() -> Self {
        Self {
            offset_x: 0,
            offset_y: 0,
            width: 1920,
            height: 1080,
        }
    }
}

/// Configuration for starting a capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Encoder executable (resolved through `PATH` when not absolute).
    pub encoder_path: String,

    /// Encoder knobs.
    pub settings: StreamSettings,

    /// Output framing requested from the encoder.
    pub framing: OutputFraming,

    /// Desktop region to capture.
    pub region: CaptureRegion,

    /// Largest frame payload accepted before the stream is declared corrupt.
    pub max_frame_size: u32,

    /// Frames between throughput log lines.
    pub fps_report_interval: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            encoder_path: "ffmpeg".to_string(),
            settings: StreamSettings::default(),
            framing: OutputFraming::default(),
            region: CaptureRegion::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            fps_report_interval: DEFAULT_FPS_REPORT_INTERVAL,
        }
    }
}

/// Structural problems with a [`StreamConfig`].
///
/// Encoder-specific ranges (bitrates, quantizers, speed) are deliberately
/// not checked here; the encoder owns those.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Frame rate of zero.
    #[error("frame rate must be greater than zero")]
    ZeroFrameRate,

    /// Frame size cap of zero.
    #[error("max frame size must be greater than zero")]
    ZeroMaxFrameSize,

    /// Report interval of zero.
    #[error("fps report interval must be greater than zero")]
    ZeroReportInterval,

    /// Empty encoder path.
    #[error("encoder path is empty")]
    EmptyEncoderPath,
}

impl StreamConfig {
    /// Check the fields the pipeline itself depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settings.frame_rate == 0 {
            return Err(ConfigError::ZeroFrameRate);
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::ZeroMaxFrameSize);
        }
        if self.fps_report_interval == 0 {
            return Err(ConfigError::ZeroReportInterval);
        }
        if self.encoder_path.trim().is_empty() {
            return Err(ConfigError::EmptyEncoderPath);
        }
        Ok(())
    }
}

/// Real-time session metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMetrics {
    /// Frames per second since the last report.
    pub fps: f32,

    /// Configured frames per second.
    pub target_fps: f32,

    /// Average payload bitrate in kbps since session start.
    pub bitrate_kbps: u32,

    /// Configured bitrate in kbps.
    pub target_bitrate_kbps: u32,

    /// Frames accepted by the sink.
    pub frames_sent: u64,

    /// Frames the sink rejected.
    pub sink_rejections: u64,

    /// Payload bytes accepted by the sink.
    pub bytes_sent: u64,

    /// Session uptime in seconds.
    pub uptime_seconds: u64,
}

/// Types of performance warnings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WarningType {
    /// The sink rejected frames since the last report.
    SinkRejections { count: u64 },

    /// Achieved frame rate is well below the configured one.
    LowFrameRate { fps: f32, target_fps: f32 },
}
