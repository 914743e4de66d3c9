//! Diagnostic counters
//!
//! Every recoverable loss in the pipeline is counted rather than reported.
//! Counters touched from interrupt context are atomics; task-owned counters
//! are plain integers gathered into a [`PipelineSnapshot`] for logging.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use log::info;

/// Monotonic event counter that can be bumped from interrupt context.
///
/// Wraps on overflow.
#[derive(Debug)]
pub struct Counter(AtomicU32);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Losses at the interrupt/task boundary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Raw samples refused because the raw queue was full
    pub dropped_samples: u32,
    /// Timestamp markers refused because the marker queue was full
    pub dropped_markers: u32,
}

/// Aggregator health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorSnapshot {
    pub frames_emitted: u32,
    /// Windows whose timestamp had to be estimated
    pub missing_markers: u32,
}

/// Transmission manager health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitSnapshot {
    /// Frames uploaded straight from the processed queue
    pub frames_streamed: u32,
    /// Frames uploaded from the backlog and then deleted from it
    pub frames_drained: u32,
    /// Frames written to the backlog
    pub frames_persisted: u32,
    /// Frames discarded because neither the link nor storage could take them
    pub frames_dropped: u32,
    pub upload_failures: u32,
    pub storage_faults: u32,
    pub reconnect_attempts: u32,
}

/// Combined view over the whole pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub queues: QueueSnapshot,
    pub aggregator: AggregatorSnapshot,
    pub transmit: TransmitSnapshot,
}

impl PipelineSnapshot {
    /// Total frames known to be lost for good.
    pub fn frames_lost(&self) -> u32 {
        self.transmit.frames_dropped
    }

    pub fn log(&self) {
        info!("{}", self);
    }
}

impl fmt::Display for PipelineSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "samples dropped={} markers dropped={} missing={} | frames emitted={} streamed={} drained={} persisted={} dropped={} | upload failures={} storage faults={} reconnects={}",
            self.queues.dropped_samples,
            self.queues.dropped_markers,
            self.aggregator.missing_markers,
            self.aggregator.frames_emitted,
            self.transmit.frames_streamed,
            self.transmit.frames_drained,
            self.transmit.frames_persisted,
            self.transmit.frames_dropped,
            self.transmit.upload_failures,
            self.transmit.storage_faults,
            self.transmit.reconnect_attempts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_counter_increments() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_snapshot_display_mentions_losses() {
        let snapshot = PipelineSnapshot {
            queues: QueueSnapshot {
                dropped_samples: 3,
                dropped_markers: 0,
            },
            transmit: TransmitSnapshot {
                frames_dropped: 7,
                ..Default::default()
            },
            ..Default::default()
        };

        let text = snapshot.to_string();
        assert!(text.contains("samples dropped=3"));
        assert!(text.contains("dropped=7"));
        assert_eq!(snapshot.frames_lost(), 7);
    }
}
