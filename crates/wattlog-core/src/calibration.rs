//! ADC correction and conversion to physical units
//!
//! A raw reading goes through two fixed steps:
//! 1. Differential-nonlinearity correction: the 12-bit code is rebuilt bit by
//!    bit, each bit weighted by its nominal value times a per-bit factor
//!    measured on the converter.
//! 2. A linear fit per channel (`scale * corrected + offset`).
//!
//! Both are configuration, never derived at runtime.

/// Significant bits of a raw reading
pub const ADC_BITS: usize = 12;

/// Largest raw code
pub const ADC_MAX_CODE: u16 = (1 << ADC_BITS) - 1;

/// Measured per-bit weight error, MSB first
pub const DNL_DELTAS: [f32; ADC_BITS] = [
    0.0000, 0.0000, 0.0083, -0.0084, -0.0085, -0.0084, -0.0084, -0.0084, -0.0086, -0.0071,
    -0.0070, -0.0073,
];

/// Readings below this in both channels are instrument noise, not load.
pub const MIN_DETECTABLE: f32 = 0.02;

/// Full-scale input of the analog front end in volts
pub const ADC_REFERENCE_VOLTS: f32 = 3.3;

/// Per-bit correction factors (`1 + delta`), MSB first.
pub fn default_dnl_factors() -> [f32; ADC_BITS] {
    let mut factors = [1.0; ADC_BITS];
    for (factor, delta) in factors.iter_mut().zip(DNL_DELTAS.iter()) {
        *factor += delta;
    }
    factors
}

/// Reconstructs the effective ADC code from a raw 12-bit reading.
///
/// Bit `i` (counting from the MSB) contributes `2^(11 - i) * factors[i]`.
/// Bits above the 12th are ignored.
pub fn correct_code(code: u16, factors: &[f32; ADC_BITS]) -> f32 {
    let mut corrected = 0.0f32;
    for (i, factor) in factors.iter().enumerate() {
        let shift = ADC_BITS - 1 - i;
        if (code >> shift) & 1 == 1 {
            corrected += (1u32 << shift) as f32 * factor;
        }
    }
    corrected
}

/// `value = scale * corrected_code + offset`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub scale: f32,
    pub offset: f32,
}

impl LinearFit {
    pub const fn new(scale: f32, offset: f32) -> Self {
        Self { scale, offset }
    }

    #[inline]
    pub fn apply(&self, corrected_code: f32) -> f32 {
        self.scale * corrected_code + self.offset
    }
}

impl Default for LinearFit {
    fn default() -> Self {
        Self::new(ADC_REFERENCE_VOLTS / ADC_MAX_CODE as f32, 0.0)
    }
}

/// Complete calibration of both channels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub dnl_factors: [f32; ADC_BITS],
    pub voltage: LinearFit,
    pub current: LinearFit,
    pub min_detectable: f32,
}

impl Calibration {
    pub fn voltage(&self, raw: u16) -> f32 {
        self.voltage.apply(correct_code(raw, &self.dnl_factors))
    }

    pub fn current(&self, raw: u16) -> f32 {
        self.current.apply(correct_code(raw, &self.dnl_factors))
    }

    /// Whether a window's mean readings are indistinguishable from no load.
    pub fn below_detection(&self, avg_voltage: f32, avg_current: f32) -> bool {
        avg_voltage < self.min_detectable && avg_current < self.min_detectable
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            dnl_factors: default_dnl_factors(),
            voltage: LinearFit::default(),
            current: LinearFit::default(),
            min_detectable: MIN_DETECTABLE,
        }
    }
}
