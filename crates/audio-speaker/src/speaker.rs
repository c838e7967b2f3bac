//! High-level speaker facade.
//!
//! [`StreamSpeaker`] ties the pieces together: it holds the decoder
//! configuration, the shared volume, and the session control slot, and
//! runs one [`PlaybackSession`](crate::session) per `play` call.

use std::io::Read;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crate::config::{DecodeConfig, PlaybackConfig};
use crate::device;
use crate::error::SpeakerError;
use crate::session::{EndReason, PlaybackSession, SessionControl, SessionState};
use crate::status::StatsSnapshot;

/// Anything that can play a compressed audio stream.
pub trait Speaker {
    /// Play a stream to completion, cancellation, or failure.
    ///
    /// Blocks until playback ends; concurrent calls on a busy speaker fail
    /// with [`SpeakerError::AlreadyPlaying`].
    fn play_stream(&self, source: Box<dyn Read + Send>) -> Result<EndReason, SpeakerError>;

    /// Request a stop. The in-flight `play` returns promptly with
    /// [`EndReason::Stopped`]; queued audio is discarded.
    fn stop(&self);

    fn set_volume(&self, gain: f32);

    fn volume(&self) -> f32;
}

/// Plays compressed audio arriving incrementally, by piping it through an
/// external ffmpeg process into the default output device.
pub struct StreamSpeaker {
    decode: Mutex<DecodeConfig>,
    playback: PlaybackConfig,
    control: Arc<SessionControl>,
}

impl StreamSpeaker {
    pub fn new() -> Self {
        Self::with_playback(PlaybackConfig::default())
    }

    pub fn with_playback(playback: PlaybackConfig) -> Self {
        Self {
            decode: Mutex::new(DecodeConfig::default()),
            playback,
            control: Arc::new(SessionControl::new()),
        }
    }

    /// Mutate the decoder configuration used by subsequent `play` calls.
    pub fn configure_decoder<F>(&self, configure: F) -> Result<(), SpeakerError>
    where
        F: FnOnce(&mut DecodeConfig) -> Result<(), SpeakerError>,
    {
        let mut config = self.decode.lock().unwrap();
        configure(&mut config)
    }

    /// Play a stream with an internal cancellation flag (use [`stop`](Self::stop)).
    pub fn play(
        &self,
        source: impl Read + Send + 'static,
    ) -> Result<EndReason, SpeakerError> {
        self.play_with_cancel(Box::new(source), Arc::new(AtomicBool::new(false)))
    }

    /// Play a stream observing an external cancellation flag as well.
    pub fn play_with_cancel(
        &self,
        source: Box<dyn Read + Send>,
        cancel: Arc<AtomicBool>,
    ) -> Result<EndReason, SpeakerError> {
        let decode = self.decode.lock().unwrap().clone();
        let session = PlaybackSession::new(self.control.clone(), decode, self.playback.clone());
        session.run(source, cancel)
    }

    /// Request a stop of the in-flight session, if any.
    pub fn stop(&self) {
        self.control.request_stop();
    }

    /// Set the playback gain, clamped to `[0.0, 1.0]`.
    pub fn set_volume(&self, gain: f32) {
        device::store_gain(&self.control.gain_bits, gain);
    }

    /// The gain the output callback is currently applying.
    pub fn volume(&self) -> f32 {
        device::load_gain(&self.control.gain_bits)
    }

    /// Current session lifecycle state.
    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    /// Counters for the active (or most recent) session.
    pub fn stats(&self) -> StatsSnapshot {
        self.control.stats.snapshot()
    }
}

impl Default for StreamSpeaker {
    fn default() -> Self {
        Self::new()
    }
}

impl Speaker for StreamSpeaker {
    fn play_stream(&self, source: Box<dyn Read + Send>) -> Result<EndReason, SpeakerError> {
        self.play_with_cancel(source, Arc::new(AtomicBool::new(false)))
    }

    fn stop(&self) {
        StreamSpeaker::stop(self);
    }

    fn set_volume(&self, gain: f32) {
        StreamSpeaker::set_volume(self, gain);
    }

    fn volume(&self) -> f32 {
        StreamSpeaker::volume(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_is_clamped_both_ways() {
        let speaker = StreamSpeaker::new();
        speaker.set_volume(1.5);
        assert_eq!(speaker.volume(), 1.0);
        speaker.set_volume(-0.5);
        assert_eq!(speaker.volume(), 0.0);
        speaker.set_volume(0.3);
        assert_eq!(speaker.volume(), 0.3);
    }

    #[test]
    fn new_speaker_is_idle_with_default_volume() {
        let speaker = StreamSpeaker::new();
        assert_eq!(speaker.state(), SessionState::Idle);
        assert_eq!(speaker.volume(), 1.0);
        assert_eq!(speaker.stats(), StatsSnapshot::default());
    }

    #[test]
    fn stop_without_session_does_nothing() {
        let speaker = StreamSpeaker::new();
        speaker.stop();
        assert_eq!(speaker.state(), SessionState::Idle);
    }

    #[test]
    fn configure_decoder_applies_and_propagates_errors() {
        let speaker = StreamSpeaker::new();
        speaker
            .configure_decoder(|c| {
                c.sample_rate(44_100)?.channels(1)?;
                Ok(())
            })
            .unwrap();
        speaker
            .configure_decoder(|c| {
                assert_eq!(c.sample_rate_hz(), 44_100);
                assert_eq!(c.channel_count(), 1);
                Ok(())
            })
            .unwrap();

        let err = speaker.configure_decoder(|c| {
            c.channels(5)?;
            Ok(())
        });
        assert!(matches!(err, Err(SpeakerError::UnsupportedChannelFormat(5))));
    }

    #[test]
    fn failed_play_leaves_speaker_reusable() {
        let speaker = StreamSpeaker::new();
        speaker
            .configure_decoder(|c| {
                c.ffmpeg_path("/definitely/not/a/decoder");
                Ok(())
            })
            .unwrap();
        let result = speaker.play(std::io::Cursor::new(Vec::<u8>::new()));
        assert!(matches!(result, Err(SpeakerError::ProcessStart(_))));
        assert_eq!(speaker.state(), SessionState::Failed);

        // The failure is terminal; a new call may claim the session again.
        let result = speaker.play(std::io::Cursor::new(Vec::<u8>::new()));
        assert!(matches!(result, Err(SpeakerError::ProcessStart(_))));
    }
}
