//! Hardware-independent core library for wattlog
//!
//! This crate contains the acquisition → aggregation → transmission pipeline
//! of the wattlog power telemetry device: the binary frame formats, the
//! interrupt-to-task sample queues, the ADC calibration and window reduction
//! math, the persistent backlog and the transmission manager that decides
//! between streaming to the collector and persisting to storage.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for tests).

#![no_std]

extern crate alloc;

pub mod aggregator;
pub mod backlog;
pub mod calibration;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod http;
pub mod queue;
pub mod sampler;
pub mod transmit;

pub use error::*;
pub use frame::{FRAME_SIZE, ProcessedFrame, RawSample};
