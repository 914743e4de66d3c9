//! Window reduction of raw samples into processed frames
//!
//! The aggregator drains exactly `chunk_size` raw samples per window, corrects
//! and converts them, and reduces them to one [`ProcessedFrame`]:
//!
//! - mean voltage, current and power
//! - peak power with the voltage and current at that sample (first maximum wins)
//! - energy by the trapezoidal rule over the sample period
//!
//! A window whose mean voltage and current are both below the detection
//! threshold reports all seven metrics as zero.

extern crate alloc;
use alloc::vec::Vec;

use log::{debug, warn};

use crate::calibration::Calibration;
use crate::diagnostics::AggregatorSnapshot;
use crate::frame::{ProcessedFrame, decode_raw, decode_timestamp};
use crate::queue::{FrameQueue, SampleConsumer};

/// The seven metrics of one window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowMetrics {
    pub avg_voltage: f32,
    pub avg_current: f32,
    pub avg_power: f32,
    pub peak_voltage: f32,
    pub peak_current: f32,
    pub peak_power: f32,
    pub energy_joules: f32,
}

/// Index and value of the largest element. Ties resolve to the first index.
pub fn find_peak(values: &[f32]) -> Option<(usize, f32)> {
    let (first, rest) = values.split_first()?;
    let mut peak = (0, *first);
    for (i, value) in rest.iter().enumerate() {
        if *value > peak.1 {
            peak = (i + 1, *value);
        }
    }
    Some(peak)
}

/// Integral of `power` sampled every `period_s` seconds, trapezoidal rule.
///
/// Fewer than two samples span no time and integrate to zero.
pub fn trapezoid_energy(power: &[f32], period_s: f32) -> f32 {
    if power.len() < 2 {
        return 0.0;
    }

    let mut sum = 0.0f32;
    for pair in power.windows(2) {
        sum += pair[0] + pair[1];
    }
    sum * (period_s * 0.5)
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Reduces calibrated readings of one window.
///
/// `voltages`, `currents` and `powers` are parallel slices.
pub fn reduce_window(
    voltages: &[f32],
    currents: &[f32],
    powers: &[f32],
    period_s: f32,
    calibration: &Calibration,
) -> WindowMetrics {
    let avg_voltage = mean(voltages);
    let avg_current = mean(currents);

    if calibration.below_detection(avg_voltage, avg_current) {
        return WindowMetrics::default();
    }

    let (peak_index, peak_power) = find_peak(powers).unwrap_or((0, 0.0));

    WindowMetrics {
        avg_voltage,
        avg_current,
        avg_power: mean(powers),
        peak_voltage: voltages.get(peak_index).copied().unwrap_or(0.0),
        peak_current: currents.get(peak_index).copied().unwrap_or(0.0),
        peak_power,
        energy_joules: trapezoid_energy(powers, period_s),
    }
}

/// Aggregation task state.
///
/// Window buffers are allocated once at construction.
pub struct Aggregator<'a, const RAW: usize, const MARKERS: usize, const OUT: usize> {
    input: SampleConsumer<'a, RAW, MARKERS>,
    output: &'a FrameQueue<OUT>,
    calibration: Calibration,
    chunk_size: usize,
    sample_period_ms: u32,
    session_id: u32,
    next_measurement_id: u32,
    last_timestamp_ms: Option<u32>,
    voltages: Vec<f32>,
    currents: Vec<f32>,
    powers: Vec<f32>,
    stats: AggregatorSnapshot,
}

impl<'a, const RAW: usize, const MARKERS: usize, const OUT: usize> Aggregator<'a, RAW, MARKERS, OUT> {
    pub fn new(
        input: SampleConsumer<'a, RAW, MARKERS>,
        output: &'a FrameQueue<OUT>,
        calibration: Calibration,
        chunk_size: usize,
        sample_period_ms: u32,
        session_id: u32,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            input,
            output,
            calibration,
            chunk_size,
            sample_period_ms,
            session_id,
            next_measurement_id: 0,
            last_timestamp_ms: None,
            voltages: Vec::with_capacity(chunk_size),
            currents: Vec::with_capacity(chunk_size),
            powers: Vec::with_capacity(chunk_size),
            stats: AggregatorSnapshot::default(),
        }
    }

    pub fn stats(&self) -> AggregatorSnapshot {
        self.stats
    }

    pub fn input(&self) -> &SampleConsumer<'a, RAW, MARKERS> {
        &self.input
    }

    fn window_ms(&self) -> u32 {
        self.sample_period_ms.saturating_mul(self.chunk_size as u32)
    }

    /// Waits for a full window and reduces it to a frame.
    pub async fn next_frame(&mut self) -> ProcessedFrame {
        self.voltages.clear();
        self.currents.clear();
        self.powers.clear();

        while self.voltages.len() < self.chunk_size {
            let sample = decode_raw(&self.input.pop().await);
            let voltage = self.calibration.voltage(sample.voltage_raw);
            let current = self.calibration.current(sample.current_raw);
            self.voltages.push(voltage);
            self.currents.push(current);
            self.powers.push(voltage * current);
        }

        let period_s = self.sample_period_ms as f32 / 1000.0;
        let metrics = reduce_window(
            &self.voltages,
            &self.currents,
            &self.powers,
            period_s,
            &self.calibration,
        );

        let timestamp_ms = self.window_timestamp();
        let measurement_id = self.next_measurement_id;
        self.next_measurement_id = self.next_measurement_id.wrapping_add(1);
        self.stats.frames_emitted = self.stats.frames_emitted.wrapping_add(1);

        ProcessedFrame {
            timestamp_ms,
            session_id: self.session_id,
            measurement_id,
            avg_voltage: metrics.avg_voltage,
            avg_current: metrics.avg_current,
            avg_power: metrics.avg_power,
            peak_voltage: metrics.peak_voltage,
            peak_current: metrics.peak_current,
            peak_power: metrics.peak_power,
            energy_joules: metrics.energy_joules,
        }
    }

    /// Timestamp of the marker closing the window just consumed, or an
    /// estimate from the previous window when the marker is missing.
    fn window_timestamp(&mut self) -> u32 {
        let timestamp = match self.input.try_pop_marker() {
            Some(marker) => decode_timestamp(&marker),
            None => {
                self.stats.missing_markers = self.stats.missing_markers.wrapping_add(1);
                let estimate = match self.last_timestamp_ms {
                    Some(previous) => previous.wrapping_add(self.window_ms()),
                    None => self
                        .window_ms()
                        .wrapping_mul(self.next_measurement_id.wrapping_add(1)),
                };
                warn!(
                    "No timestamp marker for measurement {}, estimating {} ms",
                    self.next_measurement_id, estimate
                );
                estimate
            }
        };
        self.last_timestamp_ms = Some(timestamp);
        timestamp
    }

    /// Produces one frame and hands it to the transmission side, suspending
    /// while the processed queue is full.
    pub async fn process_window(&mut self) {
        let frame = self.next_frame().await;
        debug!(
            "Frame {}: {} W avg, {} W peak, {} J",
            frame.measurement_id, frame.avg_power, frame.peak_power, frame.energy_joules
        );
        self.output.push_blocking(frame).await;
    }

    pub async fn run(mut self) -> ! {
        loop {
            self.process_window().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::LinearFit;
    use crate::frame::{encode_raw, encode_timestamp};
    use crate::queue::SampleQueues;
    use embassy_futures::block_on;

    fn offset_only(voltage: f32, current: f32) -> Calibration {
        Calibration {
            voltage: LinearFit::new(0.0, voltage),
            current: LinearFit::new(0.0, current),
            ..Calibration::default()
        }
    }

    #[test]
    fn test_peak_takes_first_maximum() {
        assert_eq!(find_peak(&[1.0, 5.0, 3.0, 5.0, 2.0]), Some((1, 5.0)));
        assert_eq!(find_peak(&[-3.0, -1.0, -2.0]), Some((1, -1.0)));
        assert_eq!(find_peak(&[]), None);
    }

    #[test]
    fn test_trapezoid_constant_power() {
        let period = 0.005f32;
        let power = [20.0f32; 50];
        assert_eq!(trapezoid_energy(&power, period), 20.0 * 49.0 * period);
    }

    #[test]
    fn test_trapezoid_ramp() {
        // Area under 0..=4 sampled at 1 s is 8
        assert_eq!(trapezoid_energy(&[0.0, 1.0, 2.0, 3.0, 4.0], 1.0), 8.0);
        assert_eq!(trapezoid_energy(&[3.0], 1.0), 0.0);
        assert_eq!(trapezoid_energy(&[], 1.0), 0.0);
    }

    #[test]
    fn test_below_detection_zeroes_everything() {
        let cal = Calibration::default();
        let voltages = [0.01, 0.015, 0.012];
        let currents = [0.019, 0.001, 0.01];
        let powers: Vec<f32> = voltages.iter().zip(currents.iter()).map(|(v, c)| v * c).collect();

        let metrics = reduce_window(&voltages, &currents, &powers, 0.005, &cal);
        assert_eq!(metrics, WindowMetrics::default());
        assert_eq!(metrics.energy_joules, 0.0);
    }

    #[test]
    fn test_peak_carries_voltage_and_current() {
        let cal = Calibration::default();
        let voltages = [5.0, 6.0, 4.0];
        let currents = [1.0, 2.0, 3.0];
        let powers = [5.0, 12.0, 12.0];

        let metrics = reduce_window(&voltages, &currents, &powers, 1.0, &cal);
        assert_eq!(metrics.peak_power, 12.0);
        assert_eq!(metrics.peak_voltage, 6.0);
        assert_eq!(metrics.peak_current, 2.0);
        assert_eq!(metrics.avg_voltage, 5.0);
        assert_eq!(metrics.avg_current, 2.0);
    }

    #[test]
    fn test_end_to_end_two_windows() {
        let period_ms = 5;
        let period_s = period_ms as f32 / 1000.0;
        let mut queues: SampleQueues<128, 4> = SampleQueues::new();
        let (mut producer, consumer) = queues.split();
        let output: FrameQueue<4> = FrameQueue::new();

        for i in 0..100u32 {
            assert!(producer.try_push(encode_raw(1234, 567)));
            if (i + 1) % 50 == 0 {
                assert!(producer.try_push_marker(encode_timestamp((i + 1) * period_ms)));
            }
        }

        let mut aggregator = Aggregator::new(consumer, &output, offset_only(10.0, 2.0), 50, period_ms, 9);
        block_on(aggregator.process_window());
        block_on(aggregator.process_window());

        let first = output.try_pop().unwrap();
        let second = output.try_pop().unwrap();

        for (frame, id, ts) in [(first, 0, 250), (second, 1, 500)] {
            assert_eq!(frame.session_id, 9);
            assert_eq!(frame.measurement_id, id);
            assert_eq!(frame.timestamp_ms, ts);
            assert_eq!(frame.avg_voltage, 10.0);
            assert_eq!(frame.avg_current, 2.0);
            assert_eq!(frame.avg_power, 20.0);
            assert_eq!(frame.peak_power, 20.0);
            assert_eq!(frame.energy_joules, 20.0 * 49.0 * period_s);
        }
        assert_eq!(aggregator.stats().missing_markers, 0);
        assert_eq!(aggregator.stats().frames_emitted, 2);
    }

    #[test]
    fn test_missing_marker_estimates_timestamp() {
        let mut queues: SampleQueues<32, 4> = SampleQueues::new();
        let (mut producer, consumer) = queues.split();
        let output: FrameQueue<4> = FrameQueue::new();

        for _ in 0..4 {
            producer.try_push(encode_raw(100, 100));
        }
        producer.try_push_marker(encode_timestamp(1000));
        for _ in 0..4 {
            producer.try_push(encode_raw(100, 100));
        }

        let mut aggregator = Aggregator::new(consumer, &output, offset_only(1.0, 1.0), 4, 10, 1);
        let first = block_on(aggregator.next_frame());
        let second = block_on(aggregator.next_frame());

        assert_eq!(first.timestamp_ms, 1000);
        assert_eq!(second.timestamp_ms, 1040);
        assert_eq!(second.measurement_id, 1);
        assert_eq!(aggregator.stats().missing_markers, 1);
    }

    #[test]
    fn test_first_window_without_marker() {
        let mut queues: SampleQueues<16, 4> = SampleQueues::new();
        let (mut producer, consumer) = queues.split();
        let output: FrameQueue<1> = FrameQueue::new();

        for _ in 0..2 {
            producer.try_push(encode_raw(0, 0));
        }

        let mut aggregator = Aggregator::new(consumer, &output, Calibration::default(), 2, 5, 1);
        let frame = block_on(aggregator.next_frame());

        assert_eq!(frame.timestamp_ms, 10);
        assert_eq!(frame.avg_power, 0.0);
    }
}
