//! Protocol module for parsing and constructing device payloads.
//!
//! This module contains the implementations for:
//! - Control commands and the status bitfield
//! - Live-value characteristic parsing
//! - Waveform transfer decoding

pub mod command;
pub mod live;
pub mod waveform;

pub use command::{Command, DeviceStatus, WAVEFORM_GET_VELOCITY};
pub use live::LiveValues;
pub use waveform::{
    decode_transfer, encode_transfer, WaveformBlock, WaveformHeader, BLOCK_SIZE, PART_COUNT,
    TRANSFER_SIZE,
};
