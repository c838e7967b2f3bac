use std::path::PathBuf;

use clap::Parser;

use audio_speaker::config::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "speaker-cli", version)]
pub struct Args {
    /// Path to a compressed audio file, or `-` to read from stdin
    pub input: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Path to the ffmpeg executable
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Decoder log verbosity (quiet/error/warning/info)
    #[arg(long, default_value = "error")]
    pub decoder_log: String,

    /// Output sample rate in Hz
    #[arg(long, default_value_t = 48_000)]
    pub rate: u32,

    /// Output channel count (1 or 2)
    #[arg(long, default_value_t = 2)]
    pub channels: u16,

    /// Input container format hint; pass an empty string to let the decoder probe
    #[arg(long, default_value = "mp3")]
    pub format: String,

    /// Playback volume in [0.0, 1.0]
    #[arg(long, default_value_t = 1.0)]
    pub volume: f32,

    /// Number of hardware buffers
    #[arg(long, default_value_t = 4)]
    pub buffers: usize,

    /// Duration of one hardware buffer in milliseconds
    #[arg(long, default_value_t = 100)]
    pub buffer_millis: u64,
}

/// Parse a decoder verbosity name.
pub fn parse_log_level(name: &str) -> Option<LogLevel> {
    match name.trim().to_ascii_lowercase().as_str() {
        "quiet" => Some(LogLevel::Quiet),
        "error" => Some(LogLevel::Error),
        "warning" => Some(LogLevel::Warning),
        "info" => Some(LogLevel::Info),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_level_accepts_known_names() {
        assert_eq!(parse_log_level("quiet"), Some(LogLevel::Quiet));
        assert_eq!(parse_log_level("Error"), Some(LogLevel::Error));
        assert_eq!(parse_log_level(" warning "), Some(LogLevel::Warning));
        assert_eq!(parse_log_level("info"), Some(LogLevel::Info));
        assert_eq!(parse_log_level("verbose"), None);
    }
}
