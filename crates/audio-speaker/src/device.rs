//! Audio output device: a fixed pool of queued PCM buffers on one voice.
//!
//! Models a queue-based playback voice on top of the CPAL callback: the
//! session uploads s16le payloads into numbered buffer slots, the output
//! callback consumes queued slots strictly in FIFO order and hands them
//! back as processed, and a voice that runs dry stops until restarted.
//! The CPAL stream is `!Send`, so an [`OutputDevice`] must be created,
//! driven, and dropped on the same thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::error::{SpeakerError, device_err};

/// One buffer-queue voice bound to the default output device.
pub(crate) struct OutputDevice {
    stream: Option<cpal::Stream>,
    voice: Arc<Voice>,
    capacity_bytes: usize,
    frame_bytes: usize,
}

impl OutputDevice {
    /// Open the default output device and start one voice at the exact
    /// requested sample rate.
    ///
    /// There is no resampler downstream of the decoder, so a device that
    /// cannot run at `rate_hz` is an error rather than a fallback.
    pub(crate) fn open(
        rate_hz: u32,
        channels: u16,
        frames_per_buffer: usize,
        gain_bits: Arc<AtomicU32>,
    ) -> Result<Self, SpeakerError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| device_err("no default output device"))?;
        let supported = pick_output_config(&device, rate_hz, channels)?;
        let stream_config: cpal::StreamConfig = supported.clone().into();
        tracing::debug!(
            rate_hz,
            channels,
            device_channels = stream_config.channels,
            format = ?supported.sample_format(),
            "output device opened"
        );

        let voice = Arc::new(Voice::new(channels as usize, gain_bits));
        let stream = build_voice_stream(
            &device,
            &stream_config,
            supported.sample_format(),
            &voice,
        )?;
        stream.play().map_err(device_err)?;

        Ok(Self {
            stream: Some(stream),
            voice,
            capacity_bytes: frames_per_buffer * 2 * channels as usize,
            frame_bytes: 2 * channels as usize,
        })
    }

    /// Upload a PCM payload into `slot` and append it to the play queue.
    ///
    /// The slot must not be reused until it comes back from
    /// [`dequeue_processed`](Self::dequeue_processed).
    pub(crate) fn enqueue(&self, slot: usize, pcm: &[u8]) -> Result<(), SpeakerError> {
        validate_payload(pcm.len(), self.capacity_bytes, self.frame_bytes)?;
        self.voice.enqueue(slot, pcm_to_samples(pcm));
        Ok(())
    }

    pub(crate) fn processed_count(&self) -> usize {
        self.voice.processed_count()
    }

    pub(crate) fn dequeue_processed(&self) -> Option<usize> {
        self.voice.dequeue_processed()
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.voice.queued_len()
    }

    pub(crate) fn play(&self) {
        self.voice.play();
    }

    pub(crate) fn stop(&self) {
        self.voice.stop();
    }

    pub(crate) fn is_playing(&self) -> bool {
        self.voice.is_playing()
    }

    /// Drop all queued buffers without playing them out.
    pub(crate) fn discard_queued(&self) {
        self.voice.discard_queued();
    }

    /// Stop the voice and release the native stream. Idempotent.
    pub(crate) fn close(&mut self) {
        self.voice.stop();
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::debug!("stream pause on close: {e}");
            }
        }
    }
}

impl Drop for OutputDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Queue state shared between the session thread and the output callback.
pub(crate) struct Voice {
    inner: Mutex<VoiceInner>,
    gain_bits: Arc<AtomicU32>,
    src_channels: usize,
}

struct VoiceInner {
    playing: bool,
    queued: VecDeque<SlotBuffer>,
    processed: VecDeque<usize>,
}

struct SlotBuffer {
    slot: usize,
    samples: Vec<f32>,
    pos: usize,
}

impl Voice {
    pub(crate) fn new(src_channels: usize, gain_bits: Arc<AtomicU32>) -> Self {
        Self {
            inner: Mutex::new(VoiceInner {
                playing: false,
                queued: VecDeque::new(),
                processed: VecDeque::new(),
            }),
            gain_bits,
            src_channels,
        }
    }

    pub(crate) fn enqueue(&self, slot: usize, samples: Vec<f32>) {
        let mut inner = self.inner.lock().unwrap();
        inner.queued.push_back(SlotBuffer {
            slot,
            samples,
            pos: 0,
        });
    }

    pub(crate) fn processed_count(&self) -> usize {
        self.inner.lock().unwrap().processed.len()
    }

    pub(crate) fn dequeue_processed(&self) -> Option<usize> {
        self.inner.lock().unwrap().processed.pop_front()
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.inner.lock().unwrap().queued.len()
    }

    pub(crate) fn play(&self) {
        self.inner.lock().unwrap().playing = true;
    }

    pub(crate) fn stop(&self) {
        self.inner.lock().unwrap().playing = false;
    }

    pub(crate) fn is_playing(&self) -> bool {
        self.inner.lock().unwrap().playing
    }

    pub(crate) fn discard_queued(&self) {
        self.inner.lock().unwrap().queued.clear();
    }

    /// Fill one output callback buffer.
    ///
    /// Consumes queued slots in order, maps channels, applies gain, and
    /// converts to the device sample format. When the queue runs dry while
    /// the voice is playing, the rest of the buffer is silence and the
    /// voice stops; the playback loop observes the stall and recovers.
    pub(crate) fn render<T>(&self, data: &mut [T], out_channels: usize)
    where
        T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
    {
        let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
        let gain = f32::from_bits(self.gain_bits.load(Ordering::Relaxed));
        let src_channels = self.src_channels;
        let frames = data.len() / out_channels.max(1);

        let mut inner = self.inner.lock().unwrap();
        let mut frame = 0;
        'frames: while frame < frames {
            if !inner.playing {
                break;
            }
            // Retire exhausted buffers; stop on starvation.
            loop {
                match inner.queued.front() {
                    Some(buf) if buf.pos < buf.samples.len() => break,
                    Some(_) => {
                        if let Some(done) = inner.queued.pop_front() {
                            inner.processed.push_back(done.slot);
                        }
                    }
                    None => {
                        inner.playing = false;
                        break 'frames;
                    }
                }
            }

            let Some(buf) = inner.queued.front_mut() else {
                break;
            };
            let start = buf.pos;
            let end = (start + src_channels).min(buf.samples.len());
            buf.pos = end;
            let mut src = [0.0f32; 2];
            src[..end - start].copy_from_slice(&buf.samples[start..end]);

            for ch in 0..out_channels {
                let mapped = map_sample(&src[..src_channels], ch, out_channels);
                data[frame * out_channels + ch] =
                    <T as cpal::Sample>::from_sample::<f32>(mapped * gain);
            }
            frame += 1;
        }

        for value in &mut data[frame * out_channels..] {
            *value = silence;
        }
    }
}

/// Map one source frame (mono or stereo) onto a destination channel.
///
/// - mono source: duplicate onto every output channel
/// - stereo → mono: average L/R
/// - stereo → wider: clamp to the stereo pair
fn map_sample(frame: &[f32], dst_ch: usize, dst_channels: usize) -> f32 {
    match (frame.len(), dst_channels) {
        (1, _) => frame[0],
        (2, 1) => 0.5 * (frame[0] + frame[1]),
        (2, _) => frame[dst_ch.min(1)],
        _ => 0.0,
    }
}

/// Decode an s16le payload into interleaved `f32` samples.
fn pcm_to_samples(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
        .collect()
}

/// Reject payloads that break the hardware buffer contract.
fn validate_payload(
    len: usize,
    capacity_bytes: usize,
    frame_bytes: usize,
) -> Result<(), SpeakerError> {
    if len > capacity_bytes {
        return Err(SpeakerError::BufferFormat(format!(
            "payload of {len} bytes exceeds buffer capacity {capacity_bytes}"
        )));
    }
    if len == 0 || len % frame_bytes != 0 {
        return Err(SpeakerError::BufferFormat(format!(
            "payload of {len} bytes is not whole frames of {frame_bytes} bytes"
        )));
    }
    Ok(())
}

/// Clamp and publish a gain value. No out-of-range gain is ever observable.
pub(crate) fn store_gain(gain_bits: &AtomicU32, gain: f32) {
    let clamped = if gain.is_finite() {
        gain.clamp(0.0, 1.0)
    } else {
        1.0
    };
    gain_bits.store(clamped.to_bits(), Ordering::Relaxed);
}

/// Read the live gain the output callback is applying.
pub(crate) fn load_gain(gain_bits: &AtomicU32) -> f32 {
    f32::from_bits(gain_bits.load(Ordering::Relaxed))
}

fn build_voice_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    voice: &Arc<Voice>,
) -> Result<cpal::Stream, SpeakerError> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, voice),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, voice),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, voice),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, voice),
        other => Err(device_err(format!("unsupported sample format: {other:?}"))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    voice: &Arc<Voice>,
) -> Result<cpal::Stream, SpeakerError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let voice_cb = voice.clone();
    let err_fn = |err| tracing::warn!("stream error: {err}");

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| voice_cb.render(data, channels_out),
            err_fn,
            None,
        )
        .map_err(device_err)
}

/// Choose a supported output config carrying the exact requested rate.
///
/// Prefers the requested channel count, then stereo, then mono, breaking
/// ties on sample format quality.
fn pick_output_config(
    device: &cpal::Device,
    rate_hz: u32,
    channels: u16,
) -> Result<cpal::SupportedStreamConfig, SpeakerError> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(device_err)?
        .collect();

    let mut best: Option<(u8, u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        if rate_hz < range.min_sample_rate() || rate_hz > range.max_sample_rate() {
            continue;
        }
        let chan_rank = channel_rank(range.channels(), channels);
        let format_rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((best_chan, best_format, _)) => (chan_rank, format_rank) < (*best_chan, *best_format),
        };
        if replace {
            best = Some((chan_rank, format_rank, range.with_sample_rate(rate_hz)));
        }
    }

    best.map(|(_, _, config)| config)
        .ok_or_else(|| device_err(format!("no output config supports {rate_hz} Hz")))
}

fn channel_rank(device_channels: u16, wanted: u16) -> u8 {
    if device_channels == wanted {
        0
    } else if device_channels == 2 {
        1
    } else if device_channels == 1 {
        2
    } else {
        3
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

/// Name of the default output device, if one exists.
pub fn default_device_name() -> Option<String> {
    let host = cpal::default_host();
    let device = host.default_output_device()?;
    device.description().ok().map(|d| d.to_string())
}

/// Log available output devices for the current host.
pub fn list_devices() -> Result<(), SpeakerError> {
    let host = cpal::default_host();
    let devices = host.output_devices().map_err(device_err)?;
    for (i, device) in devices.enumerate() {
        match device.description() {
            Ok(description) => println!("#{i}: {description}"),
            Err(e) => println!("#{i}: <unknown: {e}>"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_voice(src_channels: usize) -> Voice {
        Voice::new(src_channels, Arc::new(AtomicU32::new(1.0f32.to_bits())))
    }

    #[test]
    fn render_consumes_buffers_in_fifo_order() {
        let voice = test_voice(1);
        voice.enqueue(0, vec![0.1, 0.2]);
        voice.enqueue(1, vec![0.3, 0.4]);
        voice.play();

        let mut out = [0.0f32; 4];
        voice.render(&mut out, 1);
        assert_eq!(out, [0.1, 0.2, 0.3, 0.4]);
        assert!(voice.is_playing());

        // Buffer 0 was retired while rendering; buffer 1 retires on the
        // next callback once its last sample has been consumed.
        assert_eq!(voice.dequeue_processed(), Some(0));
        let mut tail = [0.5f32; 2];
        voice.render(&mut tail, 1);
        assert_eq!(voice.dequeue_processed(), Some(1));
        assert_eq!(voice.dequeue_processed(), None);
    }

    #[test]
    fn render_starvation_stops_voice_and_fills_silence() {
        let voice = test_voice(1);
        voice.enqueue(0, vec![0.5]);
        voice.play();

        let mut out = [1.0f32; 4];
        voice.render(&mut out, 1);
        assert_eq!(out, [0.5, 0.0, 0.0, 0.0]);
        assert!(!voice.is_playing());
    }

    #[test]
    fn render_stopped_voice_emits_silence_and_keeps_queue() {
        let voice = test_voice(1);
        voice.enqueue(0, vec![0.5, 0.5]);

        let mut out = [1.0f32; 2];
        voice.render(&mut out, 1);
        assert_eq!(out, [0.0, 0.0]);
        assert_eq!(voice.queued_len(), 1);
        assert_eq!(voice.processed_count(), 0);
    }

    #[test]
    fn render_applies_gain() {
        let gain_bits = Arc::new(AtomicU32::new(0));
        store_gain(&gain_bits, 0.5);
        let voice = Voice::new(1, gain_bits);
        voice.enqueue(0, vec![0.8]);
        voice.play();

        let mut out = [0.0f32; 1];
        voice.render(&mut out, 1);
        assert_eq!(out, [0.4]);
    }

    #[test]
    fn render_maps_mono_to_stereo() {
        let voice = test_voice(1);
        voice.enqueue(0, vec![0.25, 0.75]);
        voice.play();

        let mut out = [0.0f32; 4];
        voice.render(&mut out, 2);
        assert_eq!(out, [0.25, 0.25, 0.75, 0.75]);
    }

    #[test]
    fn render_maps_stereo_to_mono() {
        let voice = test_voice(2);
        voice.enqueue(0, vec![0.2, 0.6]);
        voice.play();

        let mut out = [0.0f32; 1];
        voice.render(&mut out, 1);
        assert!((out[0] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn discard_queued_drops_pending_audio() {
        let voice = test_voice(2);
        voice.enqueue(0, vec![0.0; 4]);
        voice.enqueue(1, vec![0.0; 4]);
        assert_eq!(voice.queued_len(), 2);
        voice.discard_queued();
        assert_eq!(voice.queued_len(), 0);
    }

    #[test]
    fn gain_is_clamped_at_assignment() {
        let gain_bits = AtomicU32::new(0);
        store_gain(&gain_bits, 1.5);
        assert_eq!(load_gain(&gain_bits), 1.0);
        store_gain(&gain_bits, -0.5);
        assert_eq!(load_gain(&gain_bits), 0.0);
        store_gain(&gain_bits, 0.7);
        assert_eq!(load_gain(&gain_bits), 0.7);
        store_gain(&gain_bits, f32::NAN);
        assert_eq!(load_gain(&gain_bits), 1.0);
    }

    #[test]
    fn pcm_to_samples_scales_s16le() {
        let pcm = [
            0x00, 0x80, // i16::MIN
            0x00, 0x00, // 0
            0xff, 0x7f, // i16::MAX
        ];
        let samples = pcm_to_samples(&pcm);
        assert_eq!(samples[0], -1.0);
        assert_eq!(samples[1], 0.0);
        assert!((samples[2] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn validate_payload_rejects_oversize_and_torn_frames() {
        assert!(validate_payload(16, 16, 4).is_ok());
        assert!(matches!(
            validate_payload(20, 16, 4),
            Err(SpeakerError::BufferFormat(_))
        ));
        assert!(matches!(
            validate_payload(6, 16, 4),
            Err(SpeakerError::BufferFormat(_))
        ));
        assert!(matches!(
            validate_payload(0, 16, 4),
            Err(SpeakerError::BufferFormat(_))
        ));
    }

    #[test]
    fn channel_rank_prefers_exact_then_stereo() {
        assert!(channel_rank(1, 1) < channel_rank(2, 1));
        assert!(channel_rank(2, 1) < channel_rank(6, 1));
        assert_eq!(channel_rank(2, 2), 0);
    }

    #[test]
    fn sample_format_rank_prefers_f32() {
        assert!(sample_format_rank(cpal::SampleFormat::F32) < sample_format_rank(cpal::SampleFormat::I16));
    }
}
