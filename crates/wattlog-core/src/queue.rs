//! Bounded queues between the pipeline stages
//!
//! Two distinct queue types exist because the two boundaries have different
//! contracts:
//!
//! - [`SampleQueues`]: interrupt → task. Lock-free SPSC rings for raw samples
//!   and timestamp markers. The producer side never blocks and never
//!   allocates; a full ring refuses the new item (drop-newest) and the loss is
//!   counted. The consumer side is woken through an interrupt-safe [`Signal`].
//! - [`FrameQueue`]: task → task. A suspend-capable channel for processed
//!   frames. A full queue suspends the aggregator, which is the intended
//!   backpressure when transmission falls behind.
//!
//! All storage is sized at compile time and wired once at boot:
//!
//! ```rust,ignore
//! static QUEUES: StaticCell<SampleQueues<256, 8>> = StaticCell::new();
//! let (producer, consumer) = QUEUES.init(SampleQueues::new()).split();
//! ```

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel, signal::Signal};
use heapless::spsc::{Consumer, Producer, Queue};

use crate::diagnostics::{Counter, QueueSnapshot};
use crate::frame::{MarkerFrame, ProcessedFrame, RawFrame};

/// Shared state between the sampling interrupt and the aggregator task.
///
/// Holds only the pre-sized rings, the wake-up signal and atomic loss
/// counters. Split it once into a [`SampleProducer`] (moved into the interrupt
/// handler) and a [`SampleConsumer`] (moved into the aggregator).
pub struct SampleQueues<const RAW: usize, const MARKERS: usize> {
    raw: Queue<RawFrame, RAW>,
    markers: Queue<MarkerFrame, MARKERS>,
    ready: Signal<CriticalSectionRawMutex, ()>,
    dropped_samples: Counter,
    dropped_markers: Counter,
}

impl<const RAW: usize, const MARKERS: usize> SampleQueues<RAW, MARKERS> {
    pub const fn new() -> Self {
        Self {
            raw: Queue::new(),
            markers: Queue::new(),
            ready: Signal::new(),
            dropped_samples: Counter::new(),
            dropped_markers: Counter::new(),
        }
    }

    /// Splits the queues into their interrupt-side and task-side halves.
    pub fn split(&mut self) -> (SampleProducer<'_, RAW, MARKERS>, SampleConsumer<'_, RAW, MARKERS>) {
        let Self {
            raw,
            markers,
            ready,
            dropped_samples,
            dropped_markers,
        } = self;

        let (raw_tx, raw_rx) = raw.split();
        let (marker_tx, marker_rx) = markers.split();
        let ready = &*ready;
        let dropped_samples = &*dropped_samples;
        let dropped_markers = &*dropped_markers;

        (
            SampleProducer {
                raw: raw_tx,
                markers: marker_tx,
                ready,
                dropped_samples,
                dropped_markers,
            },
            SampleConsumer {
                raw: raw_rx,
                markers: marker_rx,
                ready,
                dropped_samples,
                dropped_markers,
            },
        )
    }
}

impl<const RAW: usize, const MARKERS: usize> Default for SampleQueues<RAW, MARKERS> {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt-side half of [`SampleQueues`]. Every operation is non-blocking.
pub struct SampleProducer<'a, const RAW: usize, const MARKERS: usize> {
    raw: Producer<'a, RawFrame>,
    markers: Producer<'a, MarkerFrame>,
    ready: &'a Signal<CriticalSectionRawMutex, ()>,
    dropped_samples: &'a Counter,
    dropped_markers: &'a Counter,
}

impl<const RAW: usize, const MARKERS: usize> SampleProducer<'_, RAW, MARKERS> {
    /// Pushes a raw sample frame, returning `false` (and counting the drop) if
    /// the ring is full. Stored entries are never touched on failure.
    pub fn try_push(&mut self, frame: RawFrame) -> bool {
        match self.raw.enqueue(frame) {
            Ok(()) => {
                self.ready.signal(());
                true
            }
            Err(_) => {
                self.dropped_samples.increment();
                false
            }
        }
    }

    /// Pushes a timestamp marker, returning `false` (and counting the drop) if
    /// the ring is full.
    pub fn try_push_marker(&mut self, marker: MarkerFrame) -> bool {
        match self.markers.enqueue(marker) {
            Ok(()) => true,
            Err(_) => {
                self.dropped_markers.increment();
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        !self.raw.ready()
    }

    /// Number of raw frames the ring can hold.
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }
}

/// Task-side half of [`SampleQueues`]
pub struct SampleConsumer<'a, const RAW: usize, const MARKERS: usize> {
    raw: Consumer<'a, RawFrame>,
    markers: Consumer<'a, MarkerFrame>,
    ready: &'a Signal<CriticalSectionRawMutex, ()>,
    dropped_samples: &'a Counter,
    dropped_markers: &'a Counter,
}

impl<const RAW: usize, const MARKERS: usize> SampleConsumer<'_, RAW, MARKERS> {
    /// Waits until a raw frame is available and returns it.
    pub async fn pop(&mut self) -> RawFrame {
        loop {
            if let Some(frame) = self.raw.dequeue() {
                return frame;
            }
            // The producer signals after every successful push, so a frame
            // enqueued between the dequeue above and this wait is not missed.
            self.ready.wait().await;
        }
    }

    pub fn try_pop(&mut self) -> Option<RawFrame> {
        self.raw.dequeue()
    }

    pub fn try_pop_marker(&mut self) -> Option<MarkerFrame> {
        self.markers.dequeue()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.raw.ready()
    }

    pub fn is_full(&self) -> bool {
        self.raw.len() == self.raw.capacity()
    }

    pub fn markers_len(&self) -> usize {
        self.markers.len()
    }

    pub fn stats(&self) -> QueueSnapshot {
        QueueSnapshot {
            dropped_samples: self.dropped_samples.get(),
            dropped_markers: self.dropped_markers.get(),
        }
    }
}

/// Suspend-capable queue of processed frames between the aggregator and the
/// transmission manager.
pub struct FrameQueue<const N: usize> {
    channel: Channel<CriticalSectionRawMutex, ProcessedFrame, N>,
}

impl<const N: usize> FrameQueue<N> {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
        }
    }

    /// Suspends until there is room for `frame`. Task context only.
    pub async fn push_blocking(&self, frame: ProcessedFrame) {
        self.channel.send(frame).await;
    }

    pub fn try_push(&self, frame: ProcessedFrame) -> bool {
        self.channel.try_send(frame).is_ok()
    }

    /// Suspends until a frame is available.
    pub async fn pop(&self) -> ProcessedFrame {
        self.channel.receive().await
    }

    pub fn try_pop(&self) -> Option<ProcessedFrame> {
        self.channel.try_receive().ok()
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.channel.is_full()
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for FrameQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode_raw, encode_raw, encode_timestamp};
    use embassy_futures::block_on;

    #[test]
    fn test_full_ring_drops_newest() {
        let mut queues: SampleQueues<8, 4> = SampleQueues::new();
        let (mut producer, mut consumer) = queues.split();
        let capacity = producer.capacity();

        for i in 0..capacity {
            assert!(producer.try_push(encode_raw(i as u16, 0)));
        }
        assert!(producer.is_full());
        assert!(!producer.try_push(encode_raw(999, 0)));

        assert_eq!(consumer.len(), capacity);
        assert_eq!(consumer.stats().dropped_samples, 1);

        for i in 0..capacity {
            let frame = consumer.try_pop().unwrap();
            assert_eq!(decode_raw(&frame).voltage_raw, i as u16);
        }
        assert!(consumer.try_pop().is_none());
    }

    #[test]
    fn test_markers_are_independent_fifo() {
        let mut queues: SampleQueues<8, 4> = SampleQueues::new();
        let (mut producer, mut consumer) = queues.split();

        assert!(producer.try_push_marker(encode_timestamp(100)));
        assert!(producer.try_push_marker(encode_timestamp(200)));
        assert!(producer.try_push(encode_raw(1, 2)));

        assert_eq!(consumer.markers_len(), 2);
        assert_eq!(consumer.try_pop_marker(), Some(encode_timestamp(100)));
        assert_eq!(consumer.try_pop_marker(), Some(encode_timestamp(200)));
        assert_eq!(consumer.try_pop_marker(), None);
        assert_eq!(consumer.len(), 1);
    }

    #[test]
    fn test_marker_drop_is_counted() {
        let mut queues: SampleQueues<8, 2> = SampleQueues::new();
        let (mut producer, consumer) = queues.split();

        let capacity = producer.markers.capacity();
        for i in 0..capacity {
            assert!(producer.try_push_marker(encode_timestamp(i as u32)));
        }
        assert!(!producer.try_push_marker(encode_timestamp(0)));
        assert_eq!(consumer.stats().dropped_markers, 1);
    }

    #[test]
    fn test_pop_returns_pending_frame() {
        let mut queues: SampleQueues<8, 2> = SampleQueues::new();
        let (mut producer, mut consumer) = queues.split();

        producer.try_push(encode_raw(7, 8));
        let frame = block_on(consumer.pop());
        assert_eq!(decode_raw(&frame).current_raw, 8);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_frame_queue_operations() {
        let queue: FrameQueue<2> = FrameQueue::new();
        assert!(queue.is_empty());

        let frame = ProcessedFrame {
            measurement_id: 1,
            ..Default::default()
        };
        assert!(queue.try_push(frame));
        block_on(queue.push_blocking(ProcessedFrame {
            measurement_id: 2,
            ..frame
        }));
        assert!(queue.is_full());
        assert!(!queue.try_push(frame));
        assert_eq!(queue.len(), 2);

        assert_eq!(block_on(queue.pop()).measurement_id, 1);
        assert_eq!(queue.try_pop().map(|f| f.measurement_id), Some(2));
        assert!(queue.try_pop().is_none());
    }
}
