//! Encoder command line construction.

use std::path::Path;
use std::process::Stdio;

use relay_ipc::{CaptureRegion, OutputFraming, StreamConfig, StreamSettings};
use tokio::process::Command;

/// Program and arguments for the encoder subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    /// Executable, resolved through `PATH` when not absolute.
    pub program: String,

    /// Arguments passed verbatim.
    pub args: Vec<String>,
}

impl EncoderCommand {
    /// Run an arbitrary program.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build the ffmpeg invocation for a stream configuration.
    ///
    /// The screen grabber depends on the host platform. The codec section
    /// depends on the requested framing: VP8 in IVF, or H.264 as a raw
    /// Annex B stream. Output always goes to stdout.
    pub fn from_config(config: &StreamConfig) -> Self {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
        ];
        grabber_args(&mut args, config.settings.frame_rate, &config.region);
        match config.framing {
            OutputFraming::Ivf => vp8_args(&mut args, &config.settings),
            OutputFraming::AnnexB => h264_args(&mut args, &config.settings),
        }
        args.push("pipe:1".to_string());

        Self {
            program: config.encoder_path.clone(),
            args,
        }
    }

    /// Short name used in log lines.
    pub fn name(&self) -> &str {
        Path::new(&self.program)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.program)
    }

    /// Tokio command with stdout and stderr piped and stdin closed.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        command
    }
}

fn push(args: &mut Vec<String>, flag: &str, value: impl ToString) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

#[cfg(windows)]
fn grabber_args(args: &mut Vec<String>, fps: u32, region: &CaptureRegion) {
    push(args, "-f", "gdigrab");
    push(args, "-framerate", fps);
    push(args, "-offset_x", region.offset_x);
    push(args, "-offset_y", region.offset_y);
    push(args, "-video_size", format!("{}x{}", region.width, region.height));
    push(args, "-i", "desktop");
}

#[cfg(target_os = "macos")]
fn grabber_args(args: &mut Vec<String>, fps: u32, region: &CaptureRegion) {
    push(args, "-f", "avfoundation");
    push(args, "-framerate", fps);
    push(args, "-capture_cursor", 1);
    push(args, "-i", "1:none");
    push(
        args,
        "-vf",
        format!(
            "crop={}:{}:{}:{}",
            region.width, region.height, region.offset_x, region.offset_y
        ),
    );
}

#[cfg(not(any(windows, target_os = "macos")))]
fn grabber_args(args: &mut Vec<String>, fps: u32, region: &CaptureRegion) {
    let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string());
    push(args, "-f", "x11grab");
    push(args, "-framerate", fps);
    push(args, "-video_size", format!("{}x{}", region.width, region.height));
    push(
        args,
        "-i",
        format!("{display}+{},{}", region.offset_x, region.offset_y),
    );
}

fn rate_args(args: &mut Vec<String>, settings: &StreamSettings) {
    push(args, "-b:v", format!("{}k", settings.bitrate_kbps));
    push(args, "-minrate", format!("{}k", settings.min_bitrate_kbps));
    push(args, "-maxrate", format!("{}k", settings.max_bitrate_kbps));
    push(args, "-bufsize", format!("{}k", settings.min_bitrate_kbps));
    push(args, "-qmin", settings.quantizer_min);
    push(args, "-qmax", settings.quantizer_max);
}

fn vp8_args(args: &mut Vec<String>, settings: &StreamSettings) {
    push(args, "-c:v", "libvpx");
    push(args, "-deadline", "realtime");
    push(args, "-quality", "realtime");
    push(args, "-cpu-used", settings.encoder_speed);
    push(args, "-speed", settings.encoder_speed);
    push(args, "-threads", 8);
    push(args, "-error-resilient", 1);
    push(args, "-auto-alt-ref", 0);
    push(args, "-lag-in-frames", 0);
    push(args, "-tile-columns", 2);
    push(args, "-frame-parallel", 1);
    push(args, "-static-thresh", 0);
    push(args, "-max-intra-rate", 300);
    push(args, "-undershoot-pct", 100);
    rate_args(args, settings);
    push(args, "-pix_fmt", "yuv420p");
    push(args, "-f", "ivf");
}

// libx264 has no speed knob equivalent to libvpx, so encoder_speed is unused.
// zerolatency turns on sliced threads; force one slice per picture.
fn h264_args(args: &mut Vec<String>, settings: &StreamSettings) {
    push(args, "-c:v", "libx264");
    push(args, "-preset", "ultrafast");
    push(args, "-tune", "zerolatency");
    push(args, "-g", settings.frame_rate.saturating_mul(2));
    push(
        args,
        "-x264-params",
        "repeat-headers=1:slices=1:sliced-threads=0",
    );
    rate_args(args, settings);
    push(args, "-pix_fmt", "yuv420p");
    push(args, "-bsf:v", "h264_mp4toannexb");
    push(args, "-f", "h264");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_of<'a>(command: &'a EncoderCommand, flag: &str) -> Option<&'a str> {
        command
            .args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| command.args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_ivf_command_defaults() {
        let command = EncoderCommand::from_config(&StreamConfig::default());
        assert_eq!(command.program, "ffmpeg");
        assert_eq!(command.name(), "ffmpeg");
        assert_eq!(value_of(&command, "-loglevel"), Some("error"));
        assert_eq!(value_of(&command, "-framerate"), Some("60"));
        #[cfg(not(target_os = "macos"))]
        assert_eq!(value_of(&command, "-video_size"), Some("1920x1080"));
        assert_eq!(value_of(&command, "-c:v"), Some("libvpx"));
        assert_eq!(value_of(&command, "-cpu-used"), Some("16"));
        assert_eq!(value_of(&command, "-speed"), Some("16"));
        assert_eq!(value_of(&command, "-b:v"), Some("800k"));
        assert_eq!(value_of(&command, "-minrate"), Some("400k"));
        assert_eq!(value_of(&command, "-maxrate"), Some("1000k"));
        assert_eq!(value_of(&command, "-qmin"), Some("10"));
        assert_eq!(value_of(&command, "-qmax"), Some("63"));
        assert_eq!(value_of(&command, "-tile-columns"), Some("2"));
        assert_eq!(value_of(&command, "-frame-parallel"), Some("1"));
        assert_eq!(command.args.last().map(String::as_str), Some("pipe:1"));
        assert!(command.args.windows(2).any(|w| w[0] == "-f" && w[1] == "ivf"));
    }

    #[test]
    fn test_annexb_command() {
        let mut config = StreamConfig::default();
        config.framing = OutputFraming::AnnexB;
        config.settings.bitrate_kbps = 2500;
        config.settings.frame_rate = 30;

        let command = EncoderCommand::from_config(&config);
        assert_eq!(value_of(&command, "-c:v"), Some("libx264"));
        assert_eq!(value_of(&command, "-preset"), Some("ultrafast"));
        assert_eq!(value_of(&command, "-tune"), Some("zerolatency"));
        assert_eq!(value_of(&command, "-bsf:v"), Some("h264_mp4toannexb"));
        assert_eq!(value_of(&command, "-b:v"), Some("2500k"));
        assert_eq!(value_of(&command, "-g"), Some("60"));
        assert_eq!(
            value_of(&command, "-x264-params"),
            Some("repeat-headers=1:slices=1:sliced-threads=0")
        );
        assert!(command.args.windows(2).any(|w| w[0] == "-f" && w[1] == "h264"));
        assert!(!command.args.iter().any(|a| a == "ivf"));
        assert_eq!(command.args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_settings_passed_verbatim() {
        let mut config = StreamConfig::default();
        config.settings.quantizer_max = 500;
        config.settings.encoder_speed = 99;
        let command = EncoderCommand::from_config(&config);
        assert_eq!(value_of(&command, "-qmax"), Some("500"));
        assert_eq!(value_of(&command, "-cpu-used"), Some("99"));
    }

    #[test]
    fn test_custom_command_name() {
        let command = EncoderCommand::new("/usr/local/bin/ffmpeg", ["-version"]);
        assert_eq!(command.name(), "ffmpeg");
        assert_eq!(command.args, vec!["-version".to_string()]);
    }
}
