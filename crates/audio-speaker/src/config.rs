//! Decoder invocation settings and playback tuning.
//!
//! [`DecodeConfig`] describes how the external ffmpeg process is launched;
//! its rendered argument list is a wire contract with the decoder and must
//! stay byte-stable. [`PlaybackConfig`] sizes the hardware buffer pool.

use std::fmt;

use crate::error::SpeakerError;

/// Decoder `-v` verbosity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Quiet,
    #[default]
    Error,
    Warning,
    Info,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Quiet => "quiet",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to invoke the external decoder.
///
/// The decoder always emits signed 16-bit little-endian PCM at the
/// configured rate and channel count; that contract is baked into the
/// rendered arguments and is not negotiable per call.
#[derive(Clone, Debug)]
pub struct DecodeConfig {
    ffmpeg_path: String,
    log_level: LogLevel,
    sample_rate_hz: u32,
    channels: u16,
    input_format: Option<String>,
    extra_input_args: Vec<String>,
    extra_output_args: Vec<String>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            log_level: LogLevel::Error,
            sample_rate_hz: 48_000,
            channels: 2,
            input_format: Some("mp3".to_string()),
            extra_input_args: Vec::new(),
            extra_output_args: Vec::new(),
        }
    }
}

impl DecodeConfig {
    /// Set the decoder executable path.
    pub fn ffmpeg_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.ffmpeg_path = path.into();
        self
    }

    /// Set the decoder log verbosity.
    pub fn log_level(&mut self, level: LogLevel) -> &mut Self {
        self.log_level = level;
        self
    }

    /// Set the output sample rate in Hz. Zero is rejected.
    pub fn sample_rate(&mut self, hz: u32) -> Result<&mut Self, SpeakerError> {
        if hz == 0 {
            return Err(SpeakerError::InvalidSampleRate(hz));
        }
        self.sample_rate_hz = hz;
        Ok(self)
    }

    /// Set the output channel count. Only mono and stereo are supported.
    pub fn channels(&mut self, channels: u16) -> Result<&mut Self, SpeakerError> {
        if channels != 1 && channels != 2 {
            return Err(SpeakerError::UnsupportedChannelFormat(channels));
        }
        self.channels = channels;
        Ok(self)
    }

    /// Set the input container hint (for example `mp3`).
    pub fn input_format(&mut self, format: impl Into<String>) -> &mut Self {
        self.input_format = Some(format.into());
        self
    }

    /// Drop the input container hint and let the decoder probe the stream.
    pub fn clear_input_format(&mut self) -> &mut Self {
        self.input_format = None;
        self
    }

    /// Extra arguments inserted before `-i pipe:0`.
    pub fn extra_input_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_input_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Extra arguments inserted before the output codec selection.
    pub fn extra_output_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_output_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn executable(&self) -> &str {
        &self.ffmpeg_path
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn channel_count(&self) -> u16 {
        self.channels
    }

    /// Bytes per PCM frame (2 bytes per sample, interleaved by channel).
    pub(crate) fn frame_bytes(&self) -> usize {
        2 * self.channels as usize
    }

    /// Render the decoder argument list.
    ///
    /// The order is fixed: verbosity, optional input format, extra input
    /// args, read-from-stdin, strip video, raw s16le output at the
    /// configured channel count and rate, extra output args, PCM codec,
    /// write-to-stdout.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec!["-v".to_string(), self.log_level.to_string()];
        if let Some(format) = &self.input_format {
            if !format.trim().is_empty() {
                args.push("-f".to_string());
                args.push(format.clone());
            }
        }
        args.extend(self.extra_input_args.iter().cloned());
        args.extend(["-i", "pipe:0", "-vn", "-f", "s16le", "-ac"].map(String::from));
        args.push(self.channels.to_string());
        args.push("-ar".to_string());
        args.push(self.sample_rate_hz.to_string());
        args.extend(self.extra_output_args.iter().cloned());
        args.extend(["-acodec", "pcm_s16le", "-"].map(String::from));
        args
    }

    /// The argument list joined for logging and tests.
    pub fn command_line(&self) -> String {
        self.build_args().join(" ")
    }
}

/// Hardware buffer pool sizing.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Number of hardware buffers rotated through the device queue.
    pub buffer_count: usize,
    /// Duration of one hardware buffer in milliseconds.
    pub buffer_millis: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            buffer_millis: 100,
        }
    }
}

impl PlaybackConfig {
    pub(crate) fn slot_count(&self) -> usize {
        self.buffer_count.max(1)
    }

    /// PCM frames held by one buffer at `rate_hz`, never less than one frame.
    pub(crate) fn frames_per_buffer(&self, rate_hz: u32) -> usize {
        let millis = self.buffer_millis.max(10);
        ((rate_hz as u64 * millis / 1000) as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_default_renders_fixed_order() {
        let config = DecodeConfig::default();
        assert_eq!(
            config.command_line(),
            "-v error -f mp3 -i pipe:0 -vn -f s16le -ac 2 -ar 48000 -acodec pcm_s16le -"
        );
    }

    #[test]
    fn build_args_is_deterministic() {
        let mut config = DecodeConfig::default();
        config
            .sample_rate(44_100)
            .unwrap()
            .channels(1)
            .unwrap()
            .input_format("ogg");
        assert_eq!(config.build_args(), config.build_args());
    }

    #[test]
    fn build_args_skips_blank_format_hint() {
        let mut config = DecodeConfig::default();
        config.input_format("   ");
        assert!(config.command_line().starts_with("-v error -i pipe:0"));

        config.clear_input_format();
        assert!(config.command_line().starts_with("-v error -i pipe:0"));
    }

    #[test]
    fn build_args_places_extra_args() {
        let mut config = DecodeConfig::default();
        config
            .extra_input_args(["-re"])
            .extra_output_args(["-af", "aresample=async=1"]);
        assert_eq!(
            config.command_line(),
            "-v error -f mp3 -re -i pipe:0 -vn -f s16le -ac 2 -ar 48000 \
             -af aresample=async=1 -acodec pcm_s16le -"
        );
    }

    #[test]
    fn log_level_renders_lowercase() {
        let mut config = DecodeConfig::default();
        config.log_level(LogLevel::Warning);
        assert!(config.command_line().starts_with("-v warning "));
    }

    #[test]
    fn channels_outside_mono_stereo_rejected() {
        let mut config = DecodeConfig::default();
        for channels in [0u16, 3, 6] {
            match config.channels(channels) {
                Err(SpeakerError::UnsupportedChannelFormat(c)) => assert_eq!(c, channels),
                other => panic!("expected channel rejection, got {other:?}"),
            }
        }
        // The rejected calls must not have touched the config.
        assert_eq!(config.channel_count(), 2);
    }

    #[test]
    fn zero_sample_rate_rejected() {
        let mut config = DecodeConfig::default();
        assert!(matches!(
            config.sample_rate(0),
            Err(SpeakerError::InvalidSampleRate(0))
        ));
        assert_eq!(config.sample_rate_hz(), 48_000);
    }

    #[test]
    fn frame_bytes_follow_channel_count() {
        let mut config = DecodeConfig::default();
        assert_eq!(config.frame_bytes(), 4);
        config.channels(1).unwrap();
        assert_eq!(config.frame_bytes(), 2);
    }

    #[test]
    fn frames_per_buffer_floors_small_values() {
        let playback = PlaybackConfig {
            buffer_count: 0,
            buffer_millis: 1,
        };
        assert_eq!(playback.slot_count(), 1);
        // buffer_millis is floored to 10ms.
        assert_eq!(playback.frames_per_buffer(48_000), 480);
        assert_eq!(playback.frames_per_buffer(1), 1);
    }

    #[test]
    fn default_playback_config() {
        let playback = PlaybackConfig::default();
        assert_eq!(playback.buffer_count, 4);
        assert_eq!(playback.buffer_millis, 100);
        assert_eq!(playback.frames_per_buffer(48_000), 4_800);
    }
}
