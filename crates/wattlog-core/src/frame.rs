//! Fixed-width binary frame formats.
//!
//! Three layouts travel through the pipeline:
//! - Raw sample pair: 4 bytes, produced in interrupt context
//! - Timestamp marker: 4 bytes, produced once per chunk of raw samples
//! - Processed frame: 40 bytes, produced once per aggregation window
//!
//! All encodings are little-endian, floats are IEEE-754 single precision.
//! Processed frames are wire- and storage-compatible: the bytes appended to the
//! backlog are the bytes posted to the collector.

use crate::error::FrameError;

/// Encoded size of a raw sample pair
pub const RAW_FRAME_SIZE: usize = 4;

/// Encoded size of a timestamp marker
pub const TIMESTAMP_FRAME_SIZE: usize = 4;

/// Encoded size of a processed frame
pub const FRAME_SIZE: usize = 40;

/// Packed raw sample pair as it sits in the interrupt queue
pub type RawFrame = [u8; RAW_FRAME_SIZE];

/// Packed timestamp marker as it sits in the interrupt queue
pub type MarkerFrame = [u8; TIMESTAMP_FRAME_SIZE];

/// Uncorrected ADC reading pair at native converter resolution (12 significant bits).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawSample {
    pub voltage_raw: u16,
    pub current_raw: u16,
}

impl RawSample {
    pub const fn new(voltage_raw: u16, current_raw: u16) -> Self {
        Self {
            voltage_raw,
            current_raw,
        }
    }
}

/// Per-window metrics record.
///
/// Binary format (little-endian):
/// - timestamp_ms: 4 bytes (u32)
/// - session_id: 4 bytes (u32)
/// - measurement_id: 4 bytes (u32)
/// - avg_voltage, avg_current, avg_power: 12 bytes (3 × f32)
/// - peak_voltage, peak_current, peak_power: 12 bytes (3 × f32)
/// - energy_joules: 4 bytes (f32)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessedFrame {
    pub timestamp_ms: u32,
    pub session_id: u32,
    pub measurement_id: u32,
    pub avg_voltage: f32,
    pub avg_current: f32,
    pub avg_power: f32,
    pub peak_voltage: f32,
    pub peak_current: f32,
    pub peak_power: f32,
    pub energy_joules: f32,
}

impl ProcessedFrame {
    /// Returns the encoded size of a frame in bytes (40).
    pub const fn size() -> usize {
        FRAME_SIZE
    }

    /// Converts the frame to its wire/storage representation.
    pub fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        let words: [[u8; 4]; 10] = [
            self.timestamp_ms.to_le_bytes(),
            self.session_id.to_le_bytes(),
            self.measurement_id.to_le_bytes(),
            self.avg_voltage.to_le_bytes(),
            self.avg_current.to_le_bytes(),
            self.avg_power.to_le_bytes(),
            self.peak_voltage.to_le_bytes(),
            self.peak_current.to_le_bytes(),
            self.peak_power.to_le_bytes(),
            self.energy_joules.to_le_bytes(),
        ];

        let mut bytes = [0u8; FRAME_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words.iter()) {
            chunk.copy_from_slice(word);
        }
        bytes
    }

    /// Creates a frame from its wire/storage representation.
    pub fn from_bytes(bytes: &[u8; FRAME_SIZE]) -> Self {
        let word = |index: usize| -> [u8; 4] {
            let offset = index * 4;
            [
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]
        };

        Self {
            timestamp_ms: u32::from_le_bytes(word(0)),
            session_id: u32::from_le_bytes(word(1)),
            measurement_id: u32::from_le_bytes(word(2)),
            avg_voltage: f32::from_le_bytes(word(3)),
            avg_current: f32::from_le_bytes(word(4)),
            avg_power: f32::from_le_bytes(word(5)),
            peak_voltage: f32::from_le_bytes(word(6)),
            peak_current: f32::from_le_bytes(word(7)),
            peak_power: f32::from_le_bytes(word(8)),
            energy_joules: f32::from_le_bytes(word(9)),
        }
    }
}

impl AsRef<ProcessedFrame> for ProcessedFrame {
    fn as_ref(&self) -> &ProcessedFrame {
        self
    }
}

pub fn encode_raw(voltage_raw: u16, current_raw: u16) -> RawFrame {
    let v = voltage_raw.to_le_bytes();
    let c = current_raw.to_le_bytes();
    [v[0], v[1], c[0], c[1]]
}

pub fn decode_raw(bytes: &RawFrame) -> RawSample {
    RawSample {
        voltage_raw: u16::from_le_bytes([bytes[0], bytes[1]]),
        current_raw: u16::from_le_bytes([bytes[2], bytes[3]]),
    }
}

pub fn encode_timestamp(elapsed_ms: u32) -> MarkerFrame {
    elapsed_ms.to_le_bytes()
}

pub fn decode_timestamp(bytes: &MarkerFrame) -> u32 {
    u32::from_le_bytes(*bytes)
}

pub fn encode_processed(frame: &ProcessedFrame) -> [u8; FRAME_SIZE] {
    frame.to_bytes()
}

/// Decodes a processed frame, failing unless `bytes` is exactly [`FRAME_SIZE`] long.
pub fn decode_processed(bytes: &[u8]) -> Result<ProcessedFrame, FrameError> {
    let fixed: &[u8; FRAME_SIZE] = bytes.try_into().map_err(|_| FrameError::Malformed {
        expected: FRAME_SIZE,
        actual: bytes.len(),
    })?;
    Ok(ProcessedFrame::from_bytes(fixed))
}

/// Appends the encoded form of every frame to `out`.
pub fn encode_all<F: AsRef<ProcessedFrame>>(frames: &[F], out: &mut alloc::vec::Vec<u8>) {
    out.reserve(frames.len() * FRAME_SIZE);
    for frame in frames {
        out.extend_from_slice(&frame.as_ref().to_bytes());
    }
}
