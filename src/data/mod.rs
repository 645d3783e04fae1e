//! Data structures for measurement data.
//!
//! This module contains the core data types produced by the pen:
//! instantaneous live samples and reassembled waveform captures.

pub mod sample;
pub mod waveform;

pub use sample::{LiveSample, SampleOrigin};
pub use waveform::WaveformSample;
