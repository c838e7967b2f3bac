//! Playback session orchestration.
//!
//! One session per `play` call: it owns the decoder process and the output
//! device, pumps compressed bytes into the decoder on a background thread,
//! and runs the buffer refill loop on a dedicated playback thread. The
//! call returns when the playback loop finishes (completion, stop, or
//! failure), and every path releases the process and the device first.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;

use crate::config::{DecodeConfig, PlaybackConfig};
use crate::device::OutputDevice;
use crate::error::SpeakerError;
use crate::process::{DecoderPipes, DecoderProcess};
use crate::status::SessionStats;

/// Poll cadence of the playback loop.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Chunk size of the input pump.
const PUMP_CHUNK: usize = 8 * 1024;
/// Grace period for the decoder to exit before it is killed.
const DECODER_EXIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle of a playback session.
///
/// `Idle → Starting → Priming → Playing → Draining` and then exactly one
/// of the terminal states. Terminal transitions are idempotent: only the
/// first one takes effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Priming,
    Playing,
    Draining,
    Completed,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Stopped | SessionState::Failed
        )
    }

    fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Starting
                | SessionState::Priming
                | SessionState::Playing
                | SessionState::Draining
        )
    }
}

/// Why a session ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// The stream drained naturally.
    Completed,
    /// Cancellation was observed; queued audio was discarded.
    Stopped,
}

/// State shared between the speaker facade and the session's threads.
pub(crate) struct SessionControl {
    state: Mutex<SessionState>,
    active_cancel: Mutex<Option<Arc<AtomicBool>>>,
    pub(crate) gain_bits: Arc<AtomicU32>,
    pub(crate) stats: Arc<SessionStats>,
}

impl SessionControl {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            active_cancel: Mutex::new(None),
            gain_bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            stats: Arc::new(SessionStats::default()),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Claim the session for a new `play` call.
    ///
    /// Rejected while another call is active; the in-flight call is not
    /// disturbed.
    pub(crate) fn begin(&self, cancel: Arc<AtomicBool>) -> Result<(), SpeakerError> {
        let mut state = self.state.lock().unwrap();
        if state.is_active() {
            return Err(SpeakerError::AlreadyPlaying);
        }
        *state = SessionState::Starting;
        *self.active_cancel.lock().unwrap() = Some(cancel);
        self.stats.reset();
        Ok(())
    }

    /// Move through the non-terminal phases. A no-op once terminal.
    fn advance(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap();
        if !state.is_terminal() {
            *state = next;
        }
    }

    /// Enter a terminal state. Only the first caller's transition sticks.
    fn finish(&self, terminal: SessionState) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            return false;
        }
        *state = terminal;
        drop(state);
        self.active_cancel.lock().unwrap().take();
        true
    }

    /// Signal cancellation to the active session, if any.
    pub(crate) fn request_stop(&self) {
        if let Some(cancel) = self.active_cancel.lock().unwrap().as_ref() {
            cancel.store(true, Ordering::Relaxed);
        }
    }
}

/// One `play` call: spawns the decoder, wires the threads, and blocks
/// until playback ends.
pub(crate) struct PlaybackSession {
    control: Arc<SessionControl>,
    decode: DecodeConfig,
    playback: PlaybackConfig,
}

impl PlaybackSession {
    pub(crate) fn new(
        control: Arc<SessionControl>,
        decode: DecodeConfig,
        playback: PlaybackConfig,
    ) -> Self {
        Self {
            control,
            decode,
            playback,
        }
    }

    pub(crate) fn run(
        self,
        source: Box<dyn Read + Send>,
        cancel: Arc<AtomicBool>,
    ) -> Result<EndReason, SpeakerError> {
        self.control.begin(cancel.clone())?;

        let (process, pipes) = match DecoderProcess::spawn(&self.decode) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.control.finish(SessionState::Failed);
                return Err(e);
            }
        };
        let process = Arc::new(process);
        let DecoderPipes { stdin, mut stdout } = pipes;

        let (pump_tx, pump_rx) = bounded::<io::Result<u64>>(1);
        let pump_cancel = cancel.clone();
        let pump_stats = self.control.stats.clone();
        let pump = thread::Builder::new()
            .name("decoder-stdin-pump".to_string())
            .spawn(move || {
                let mut source = source;
                let mut stdin = stdin;
                let result = pump_source(&mut source, &mut stdin, &pump_cancel, &pump_stats);
                let _ = pump_tx.send(result);
                // stdin drops here: the decoder sees EOF and can flush.
            });
        if let Err(e) = pump {
            tracing::warn!("failed to start input pump: {e}");
        }

        let loop_control = self.control.clone();
        let loop_process = process.clone();
        let loop_cancel = cancel.clone();
        let decode = self.decode.clone();
        let playback = self.playback.clone();
        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                playback_loop(
                    &mut stdout,
                    &loop_process,
                    &loop_control,
                    &loop_cancel,
                    &decode,
                    &playback,
                )
            });

        let outcome = match handle {
            Ok(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(SpeakerError::DeviceInit("playback thread panicked".into())),
            },
            Err(e) => Err(SpeakerError::DeviceInit(format!(
                "failed to start playback thread: {e}"
            ))),
        };

        process.shutdown(DECODER_EXIT_TIMEOUT);
        match pump_rx.try_recv() {
            Ok(Ok(bytes)) => tracing::debug!(bytes, "input pump finished"),
            Ok(Err(e)) => tracing::debug!("input pump ended early: {e}"),
            Err(_) => {} // pump still blocked on its source; best-effort
        }

        match &outcome {
            Ok(EndReason::Completed) => {
                self.control.finish(SessionState::Completed);
            }
            Ok(EndReason::Stopped) => {
                self.control.finish(SessionState::Stopped);
            }
            Err(e) => {
                tracing::warn!("playback failed: {e}");
                self.control.finish(SessionState::Failed);
            }
        }
        outcome
    }
}

/// The dedicated playback thread: prime, poll, refill, drain.
///
/// Runs on its own OS thread because it makes blocking native calls on a
/// short fixed poll cadence. The device is created and dropped here; the
/// native stream never leaves this thread.
fn playback_loop(
    pcm: &mut std::process::ChildStdout,
    process: &DecoderProcess,
    control: &SessionControl,
    cancel: &AtomicBool,
    decode: &DecodeConfig,
    playback: &PlaybackConfig,
) -> Result<EndReason, SpeakerError> {
    control.advance(SessionState::Priming);

    let frame_bytes = decode.frame_bytes();
    let frames_per_buffer = playback.frames_per_buffer(decode.sample_rate_hz());
    let slots = playback.slot_count();
    let mut device = OutputDevice::open(
        decode.sample_rate_hz(),
        decode.channel_count(),
        frames_per_buffer,
        control.gain_bits.clone(),
    )?;

    let mut scratch = vec![0u8; frames_per_buffer * frame_bytes];
    let mut eof = false;

    // Fill the initial buffers before starting the voice, so playback does
    // not begin with an immediate underrun.
    let mut primed = 0;
    for slot in 0..slots {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        match fill_pcm(pcm, &mut scratch, frame_bytes) {
            Some(len) => {
                device.enqueue(slot, &scratch[..len])?;
                control.stats.add_pcm_bytes(len as u64);
                primed += 1;
            }
            None => {
                eof = true;
                break;
            }
        }
    }
    if primed > 0 {
        device.play();
        tracing::debug!(primed, "voice started");
    }
    if !eof {
        // An empty or instant stream never enters Playing; it falls through
        // to the drain check below and completes.
        control.advance(SessionState::Playing);
    }

    loop {
        if cancel.load(Ordering::Relaxed) {
            device.stop();
            device.discard_queued();
            device.close();
            tracing::debug!("playback cancelled");
            return Ok(EndReason::Stopped);
        }

        for _ in 0..device.processed_count() {
            let Some(slot) = device.dequeue_processed() else {
                break;
            };
            if eof {
                continue;
            }
            match fill_pcm(pcm, &mut scratch, frame_bytes) {
                Some(len) => {
                    device.enqueue(slot, &scratch[..len])?;
                    control.stats.add_pcm_bytes(len as u64);
                }
                None => eof = true,
            }
        }

        if eof {
            control.advance(SessionState::Draining);
            if device.queued_len() == 0 {
                break;
            }
        }

        // A stalled voice with data still expected is an underrun, not an
        // error: restart it and keep polling.
        if !device.is_playing() && (!process.has_exited() || !eof) {
            if device.queued_len() > 0 {
                control.stats.add_underrun();
                tracing::debug!("voice restarted after underrun");
            }
            device.play();
        }

        thread::sleep(POLL_INTERVAL);
    }

    device.close();
    Ok(EndReason::Completed)
}

/// Forward compressed bytes from the source into the decoder's stdin.
///
/// Flushes after every chunk so the decoder sees bytes as soon as they
/// arrive, and checks cancellation between chunks. Returns the total byte
/// count forwarded.
fn pump_source(
    source: &mut dyn Read,
    sink: &mut impl Write,
    cancel: &AtomicBool,
    stats: &SessionStats,
) -> io::Result<u64> {
    let mut chunk = [0u8; PUMP_CHUNK];
    let mut total = 0u64;
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let n = match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        sink.write_all(&chunk[..n])?;
        sink.flush()?;
        stats.add_bytes_in(n as u64);
        total += n as u64;
    }
    Ok(total)
}

/// Fill `scratch` from the decoder's stdout.
///
/// Reads until the region is full or the pipe reports no more data. A
/// partial tail is zero-padded to the next frame boundary so a short final
/// buffer cannot click. Returns the byte count to queue, or `None` when
/// the stream was already exhausted; such a buffer must not be queued.
/// Read errors on the pipe mean the decoder went away mid-stream and are
/// treated as end-of-stream.
fn fill_pcm(src: &mut impl Read, scratch: &mut [u8], frame_bytes: usize) -> Option<usize> {
    let mut read = 0;
    while read < scratch.len() {
        match src.read(&mut scratch[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("pcm read ended: {e}");
                break;
            }
        }
    }
    if read == 0 {
        return None;
    }
    let aligned = read.div_ceil(frame_bytes) * frame_bytes;
    scratch[read..aligned].fill(0);
    Some(aligned)
}
