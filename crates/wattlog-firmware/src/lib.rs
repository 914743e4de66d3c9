//! ESP32-S3 firmware-specific modules for wattlog
//!
//! Hardware glue that cannot compile on desktop targets: the ADC front end,
//! the SD card storage medium, the Wi-Fi stack and the TCP connector used by
//! the collector uplink. Everything platform-independent lives in
//! `wattlog-core`.

#![no_std]

extern crate alloc;

pub mod adc;
pub mod identity;
pub mod net;
pub mod sd_medium;
pub mod secrets;
