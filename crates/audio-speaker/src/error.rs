use std::io;

use thiserror::Error;

/// Errors surfaced by the playback pipeline.
///
/// Cancellation is not an error: a stopped session returns
/// [`EndReason::Stopped`](crate::session::EndReason) instead.
#[derive(Debug, Error)]
pub enum SpeakerError {
    /// The decoder executable could not be launched.
    #[error("failed to start decoder process: {0}")]
    ProcessStart(#[source] io::Error),

    /// A native audio call failed while opening or driving the output device.
    #[error("audio device failure: {0}")]
    DeviceInit(String),

    /// Channel count outside {1, 2}, rejected at configuration time.
    #[error("unsupported channel count {0} (must be 1 or 2)")]
    UnsupportedChannelFormat(u16),

    /// Sample rate of zero, rejected at configuration time.
    #[error("sample rate must be positive")]
    InvalidSampleRate(u32),

    /// A playback session is already active on this speaker.
    #[error("already playing")]
    AlreadyPlaying,

    /// A PCM payload did not fit the hardware buffer contract.
    #[error("bad buffer payload: {0}")]
    BufferFormat(String),
}

/// Fold any native audio error into the single device error kind.
pub(crate) fn device_err(e: impl std::fmt::Display) -> SpeakerError {
    SpeakerError::DeviceInit(e.to_string())
}
