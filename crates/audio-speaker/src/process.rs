//! Decoder subprocess ownership.
//!
//! One ffmpeg process per playback session, with all three standard streams
//! redirected. stderr is drained continuously in the background; a full
//! stderr pipe would block the decoder and deadlock the whole pipeline.
//! Teardown runs on every exit path: bounded wait for a clean exit once
//! stdin is closed, then kill and reap.

use std::io::{self, BufRead, BufReader};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::DecodeConfig;
use crate::error::SpeakerError;

const EXIT_POLL: Duration = Duration::from_millis(25);

/// Both pipe ends the session hands to its worker threads.
///
/// stdin goes to the input pump, stdout to the playback loop; each pipe has
/// exactly one owner, so there are no cross-thread races on the pipes.
pub(crate) struct DecoderPipes {
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
}

/// A spawned decoder process and its exit bookkeeping.
pub(crate) struct DecoderProcess {
    child: Mutex<Child>,
    exited: AtomicBool,
}

impl DecoderProcess {
    /// Spawn the decoder described by `config` with redirected stdio.
    ///
    /// No shell is involved; the rendered argument list is passed verbatim.
    pub(crate) fn spawn(config: &DecodeConfig) -> Result<(Self, DecoderPipes), SpeakerError> {
        let mut cmd = Command::new(config.executable());
        cmd.args(config.build_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(SpeakerError::ProcessStart)?;
        let stdin = take_pipe(child.stdin.take(), "stdin")?;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;
        spawn_stderr_drain(stderr);

        tracing::debug!(
            pid = child.id(),
            cmd = %config.command_line(),
            "decoder spawned"
        );

        Ok((
            Self {
                child: Mutex::new(child),
                exited: AtomicBool::new(false),
            },
            DecoderPipes { stdin, stdout },
        ))
    }

    /// Whether the decoder has exited, by itself or after a kill.
    ///
    /// Exit alone never stops playback: buffers already decoded still drain.
    pub(crate) fn has_exited(&self) -> bool {
        if self.exited.load(Ordering::Relaxed) {
            return true;
        }
        let mut child = self.child.lock().unwrap();
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%status, "decoder exited");
                self.exited.store(true, Ordering::Relaxed);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("decoder wait error: {e}");
                false
            }
        }
    }

    /// Wait up to `timeout` for a clean exit, then kill and reap.
    ///
    /// Stdin must already be closed (the pump drops it) so the decoder can
    /// flush and exit on its own; the kill is the fallback for cancelled or
    /// wedged sessions. Safe to call more than once.
    pub(crate) fn shutdown(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_exited() {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(EXIT_POLL);
        }

        let mut child = self.child.lock().unwrap();
        if let Err(e) = child.kill() {
            tracing::debug!("decoder kill: {e}");
        }
        match child.wait() {
            Ok(status) => tracing::debug!(%status, "decoder reaped after kill"),
            Err(e) => tracing::warn!("decoder reap error: {e}"),
        }
        self.exited.store(true, Ordering::Relaxed);
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T, SpeakerError> {
    pipe.ok_or_else(|| {
        SpeakerError::ProcessStart(io::Error::other(format!("decoder {name} unavailable")))
    })
}

/// Drain decoder diagnostics for the life of the process.
fn spawn_stderr_drain(stderr: ChildStderr) {
    let spawned = thread::Builder::new()
        .name("decoder-stderr".to_string())
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) => tracing::debug!("ffmpeg: {line}"),
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("failed to start stderr drain: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_executable(path: &str) -> DecodeConfig {
        let mut config = DecodeConfig::default();
        config.ffmpeg_path(path);
        config
    }

    #[test]
    fn spawn_missing_executable_is_process_start_failure() {
        let config = config_with_executable("/definitely/not/a/decoder");
        match DecoderProcess::spawn(&config) {
            Err(SpeakerError::ProcessStart(_)) => {}
            other => panic!("expected ProcessStart, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_observes_clean_exit() {
        // `true` ignores the rendered arguments and exits immediately.
        let (process, pipes) = DecoderProcess::spawn(&config_with_executable("true")).unwrap();
        drop(pipes);
        process.shutdown(Duration::from_secs(2));
        assert!(process.has_exited());
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_kills_a_wedged_decoder() {
        // `yes` never exits on its own, forcing the kill path. The pipes are
        // kept open so it cannot die from a closed stdout either.
        let (process, pipes) = DecoderProcess::spawn(&config_with_executable("yes")).unwrap();
        assert!(!process.has_exited());
        process.shutdown(Duration::from_millis(100));
        assert!(process.has_exited());
        drop(pipes);
    }
}
