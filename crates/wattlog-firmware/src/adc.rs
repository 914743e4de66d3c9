//! One-shot ADC1 front end for the sampler
//!
//! Voltage is wired to GPIO1 (ADC1_CH0) and current to GPIO2 (ADC1_CH1),
//! both through the 11 dB attenuator for the full 0..3.3 V range.

use esp_hal::Blocking;
use esp_hal::analog::adc::{Adc, AdcConfig, AdcPin, Attenuation};
use esp_hal::peripherals::{ADC1, GPIO1, GPIO2};

use wattlog_core::sampler::{AdcChannel, AnalogFrontEnd};

/// Converter resolution on the ESP32-S3
const NATIVE_BITS: u32 = 12;

pub struct EspAdcFrontEnd {
    adc: Adc<'static, ADC1<'static>, Blocking>,
    voltage: AdcPin<GPIO1<'static>, ADC1<'static>>,
    current: AdcPin<GPIO2<'static>, ADC1<'static>>,
}

impl EspAdcFrontEnd {
    pub fn new(adc1: ADC1<'static>, voltage: GPIO1<'static>, current: GPIO2<'static>) -> Self {
        let mut config = AdcConfig::new();
        let voltage = config.enable_pin(voltage, Attenuation::_11dB);
        let current = config.enable_pin(current, Attenuation::_11dB);
        let adc = Adc::new(adc1, config);

        Self {
            adc,
            voltage,
            current,
        }
    }
}

impl AnalogFrontEnd for EspAdcFrontEnd {
    fn read(&mut self, channel: AdcChannel) -> u16 {
        let code = match channel {
            AdcChannel::Voltage => nb::block!(self.adc.read_oneshot(&mut self.voltage)),
            AdcChannel::Current => nb::block!(self.adc.read_oneshot(&mut self.current)),
        };
        // Left-justify to 16 bits; a failed conversion reads as zero.
        code.unwrap_or(0) << (16 - NATIVE_BITS)
    }
}
