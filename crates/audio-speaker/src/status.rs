//! Shared playback counters.
//!
//! Counters live behind atomics so the pump thread, the playback loop, and
//! external observers can touch them without locking.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the active (or most recent) playback session.
#[derive(Debug, Default)]
pub struct SessionStats {
    bytes_in: AtomicU64,
    pcm_bytes: AtomicU64,
    underrun_events: AtomicU64,
}

impl SessionStats {
    pub(crate) fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_pcm_bytes(&self, n: u64) {
        self.pcm_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_underrun(&self) {
        self.underrun_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero all counters at the start of a new session.
    pub(crate) fn reset(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.pcm_bytes.store(0, Ordering::Relaxed);
        self.underrun_events.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            pcm_bytes: self.pcm_bytes.load(Ordering::Relaxed),
            underrun_events: self.underrun_events.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Compressed bytes forwarded to the decoder.
    pub bytes_in: u64,
    /// Decoded PCM bytes queued to the device.
    pub pcm_bytes: u64,
    /// Times a stalled voice was restarted with data still queued.
    pub underrun_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = SessionStats::default();
        stats.add_bytes_in(100);
        stats.add_bytes_in(24);
        stats.add_pcm_bytes(4_096);
        stats.add_underrun();
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                bytes_in: 124,
                pcm_bytes: 4_096,
                underrun_events: 1,
            }
        );
    }

    #[test]
    fn reset_zeroes_counters() {
        let stats = SessionStats::default();
        stats.add_bytes_in(1);
        stats.add_pcm_bytes(2);
        stats.add_underrun();
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
