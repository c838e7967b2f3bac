//! Speaker CLI — pipe a compressed audio file (or stdin) through ffmpeg
//! and play the decoded PCM on the default output device.
//!
//! ## Pipeline
//! 1. **Pump**: a background thread forwards compressed bytes to ffmpeg's stdin.
//! 2. **Decode**: ffmpeg emits s16le PCM at the requested rate/channels on stdout.
//! 3. **Playback**: a dedicated thread rotates PCM through a small pool of
//!    device buffers, recovering from underruns and draining on EOF.
//!
//! Ctrl-C requests a graceful stop: queued audio is discarded and the
//! decoder is shut down.

mod cli;

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use audio_speaker::config::PlaybackConfig;
use audio_speaker::device;
use audio_speaker::speaker::{Speaker, StreamSpeaker};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_speaker=info")
        }))
        .init();

    if args.list_devices {
        device::list_devices()?;
        if let Some(name) = device::default_device_name() {
            println!("default: {name}");
        }
        return Ok(());
    }

    let Some(input) = args.input.clone() else {
        bail!("no input given (pass a file path, or `-` for stdin)");
    };

    let decoder_log = cli::parse_log_level(&args.decoder_log)
        .with_context(|| format!("unknown decoder log level: {}", args.decoder_log))?;

    let speaker = Arc::new(StreamSpeaker::with_playback(PlaybackConfig {
        buffer_count: args.buffers,
        buffer_millis: args.buffer_millis,
    }));
    speaker.configure_decoder(|config| {
        config.ffmpeg_path(&args.ffmpeg).log_level(decoder_log);
        config.sample_rate(args.rate)?.channels(args.channels)?;
        if args.format.trim().is_empty() {
            config.clear_input_format();
        } else {
            config.input_format(&args.format);
        }
        Ok(())
    })?;
    speaker.set_volume(args.volume);

    let speaker_for_signal = speaker.clone();
    let _ = ctrlc::set_handler(move || {
        tracing::info!("stop requested");
        speaker_for_signal.stop();
    });

    let source: Box<dyn Read + Send> = if input.as_os_str() == "-" {
        Box::new(std::io::stdin())
    } else {
        Box::new(File::open(&input).with_context(|| format!("open {input:?}"))?)
    };

    tracing::info!(input = %input.display(), rate = args.rate, channels = args.channels, "playing");
    let outcome = speaker.play_stream(source)?;

    let stats = speaker.stats();
    tracing::info!(
        ?outcome,
        bytes_in = stats.bytes_in,
        pcm_bytes = stats.pcm_bytes,
        underruns = stats.underrun_events,
        "playback finished"
    );
    Ok(())
}
