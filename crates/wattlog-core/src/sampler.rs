//! Timer-driven sample acquisition
//!
//! [`SampleSource::on_tick`] is called from the hardware timer interrupt. It
//! reads both channels, pushes one packed raw frame and, once every
//! `chunk_size` pushed samples, a timestamp marker. It never blocks, never
//! allocates and never logs.

use crate::frame::{encode_raw, encode_timestamp};
use crate::queue::SampleProducer;

/// Reads discarded before each oversampled measurement to let the sample and
/// hold capacitor settle after the multiplexer switches.
pub const SETTLE_READS: usize = 3;

/// Reads averaged per measurement
pub const OVERSAMPLE_READS: u32 = 2;

/// Analog input selected for a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcChannel {
    Voltage,
    Current,
}

/// One-shot access to the converter.
///
/// Readings are left-justified 16-bit values; the low four bits carry no
/// information.
pub trait AnalogFrontEnd {
    fn read(&mut self, channel: AdcChannel) -> u16;
}

/// Interrupt-safe monotonic millisecond clock
pub trait TickClock {
    fn elapsed_ms(&self) -> u32;
}

/// [`TickClock`] backed by the embassy time driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl TickClock for MonotonicClock {
    fn elapsed_ms(&self) -> u32 {
        embassy_time::Instant::now().as_millis() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    /// Constructed, interrupts ignored
    Idle,
    /// Ready; the next tick starts sampling
    Armed,
    /// Producing samples. Terminal.
    Sampling,
}

pub struct SampleSource<'a, A, C, const RAW: usize, const MARKERS: usize> {
    adc: A,
    clock: C,
    producer: SampleProducer<'a, RAW, MARKERS>,
    chunk_size: u16,
    in_chunk: u16,
    state: SamplerState,
}

impl<'a, A, C, const RAW: usize, const MARKERS: usize> SampleSource<'a, A, C, RAW, MARKERS>
where
    A: AnalogFrontEnd,
    C: TickClock,
{
    pub fn new(adc: A, clock: C, producer: SampleProducer<'a, RAW, MARKERS>, chunk_size: u16) -> Self {
        Self {
            adc,
            clock,
            producer,
            chunk_size: chunk_size.max(1),
            in_chunk: 0,
            state: SamplerState::Idle,
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Allows the next timer tick to start sampling. No effect once sampling.
    pub fn arm(&mut self) {
        if self.state == SamplerState::Idle {
            self.state = SamplerState::Armed;
        }
    }

    /// Timer interrupt body.
    pub fn on_tick(&mut self) {
        match self.state {
            SamplerState::Idle => return,
            SamplerState::Armed => self.state = SamplerState::Sampling,
            SamplerState::Sampling => {}
        }

        let voltage = self.oversample(AdcChannel::Voltage);
        let current = self.oversample(AdcChannel::Current);

        // Only enqueued samples count toward a chunk, so every marker closes
        // exactly `chunk_size` samples the aggregator will actually see.
        if !self.producer.try_push(encode_raw(voltage, current)) {
            return;
        }

        self.in_chunk += 1;
        if self.in_chunk >= self.chunk_size {
            self.in_chunk = 0;
            self.producer
                .try_push_marker(encode_timestamp(self.clock.elapsed_ms()));
        }
    }

    /// Mean of [`OVERSAMPLE_READS`] reads reduced to 12 bits.
    fn oversample(&mut self, channel: AdcChannel) -> u16 {
        for _ in 0..SETTLE_READS {
            self.adc.read(channel);
        }

        let mut sum = 0u32;
        for _ in 0..OVERSAMPLE_READS {
            sum += u32::from(self.adc.read(channel) >> 4);
        }
        (sum / OVERSAMPLE_READS) as u16
    }
}
