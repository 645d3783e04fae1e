//! Waveform transfer codec.
//!
//! A waveform download is a sequence of fixed 150-byte blocks delivered as
//! indications on the waveform data characteristic: one header block
//! followed by the data blocks.
//!
//! Header layout (little-endian, packed):
//! - Byte 0: Command echo
//! - Byte 1: Block index
//! - Byte 2: Wave id
//! - Byte 3: Reserved
//! - Bytes 4-7: Device timestamp (u32)
//! - Bytes 8-11: Scale coefficient (f32)
//! - Bytes 12-149: Reserved padding (69 × u16)
//!
//! Data block layout:
//! - Byte 0: Block index
//! - Byte 1: Wave id
//! - Bytes 2-149: Samples (74 × i16)

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::data::WaveformSample;
use crate::error::{Error, Result};

/// Size of every block in a waveform transfer.
pub const BLOCK_SIZE: usize = 150;

/// Number of blocks in a full transfer, header included.
pub const PART_COUNT: usize = 23;

/// Total byte count of one waveform transfer.
pub const TRANSFER_SIZE: usize = BLOCK_SIZE * PART_COUNT;

/// Reserved u16 words padding the header block.
const HEADER_PADDING_WORDS: usize = 69;

/// Waveform transfer header block.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WaveformHeader {
    /// Command the device is answering.
    pub command: u8,
    /// Block index of the header itself.
    pub block_index: u8,
    /// Capture id shared by every block of this waveform.
    pub wave_id: u8,
    /// Device timestamp of the capture.
    pub timestamp: u32,
    /// Factor converting raw samples to amplitudes.
    pub coefficient: f32,
}

impl WaveformHeader {
    /// Parse a header block.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_SIZE {
            return Err(Error::InvalidData {
                context: format!(
                    "Waveform header too short: {} bytes (need {})",
                    data.len(),
                    BLOCK_SIZE
                ),
            });
        }

        let mut buf = data;
        let command = buf.get_u8();
        let block_index = buf.get_u8();
        let wave_id = buf.get_u8();
        let _reserved = buf.get_u8();
        let timestamp = buf.get_u32_le();
        let coefficient = buf.get_f32_le();

        Ok(Self {
            command,
            block_index,
            wave_id,
            timestamp,
            coefficient,
        })
    }

    /// Encode to a full 150-byte block.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        buf.put_u8(self.command);
        buf.put_u8(self.block_index);
        buf.put_u8(self.wave_id);
        buf.put_u8(0);
        buf.put_u32_le(self.timestamp);
        buf.put_f32_le(self.coefficient);
        for _ in 0..HEADER_PADDING_WORDS {
            buf.put_u16_le(0);
        }
        buf
    }
}

/// One waveform data block.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WaveformBlock {
    /// Position of this block in the capture.
    pub index: u8,
    /// Capture id; must match the header.
    pub wave_id: u8,
    /// Raw samples.
    pub samples: Vec<i16>,
}

impl WaveformBlock {
    /// Samples carried by one block.
    pub const SAMPLES_PER_BLOCK: usize = 74;

    /// Parse a data block.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_SIZE {
            return Err(Error::InvalidData {
                context: format!(
                    "Waveform block too short: {} bytes (need {})",
                    data.len(),
                    BLOCK_SIZE
                ),
            });
        }

        let mut buf = data;
        let index = buf.get_u8();
        let wave_id = buf.get_u8();
        let samples = (0..Self::SAMPLES_PER_BLOCK)
            .map(|_| buf.get_i16_le())
            .collect();

        Ok(Self {
            index,
            wave_id,
            samples,
        })
    }

    /// Encode to a full 150-byte block. Missing samples are zero-filled.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        buf.put_u8(self.index);
        buf.put_u8(self.wave_id);
        for i in 0..Self::SAMPLES_PER_BLOCK {
            buf.put_i16_le(self.samples.get(i).copied().unwrap_or(0));
        }
        buf
    }
}

/// Decode a complete waveform transfer.
///
/// The transfer is cut into [`BLOCK_SIZE`] chunks; trailing bytes short of a
/// full block are ignored. Data blocks are ordered by their index, and every
/// block's wave id must match the header's.
pub fn decode_transfer(data: &[u8]) -> Result<WaveformSample> {
    let mut chunks = data.chunks_exact(BLOCK_SIZE);

    let header = match chunks.next() {
        Some(chunk) => WaveformHeader::parse(chunk)?,
        None => {
            return Err(Error::InvalidData {
                context: format!("Waveform transfer too short: {} bytes", data.len()),
            })
        }
    };

    let mut blocks = chunks
        .map(WaveformBlock::parse)
        .collect::<Result<Vec<_>>>()?;

    if blocks.is_empty() {
        return Err(Error::InvalidData {
            context: "Waveform transfer has no data blocks".to_string(),
        });
    }

    if let Some((index, block)) = blocks
        .iter()
        .enumerate()
        .find(|(_, block)| block.wave_id != header.wave_id)
    {
        return Err(Error::WaveIdMismatch {
            header: header.wave_id,
            block: block.wave_id,
            index,
        });
    }

    blocks.sort_by_key(|block| block.index);

    debug!(
        "Decoded waveform {}: {} blocks, coefficient {}",
        header.wave_id,
        blocks.len(),
        header.coefficient
    );

    Ok(WaveformSample::new(header, blocks))
}

/// Encode a header and its data blocks into one transfer.
pub fn encode_transfer(header: &WaveformHeader, blocks: &[WaveformBlock]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOCK_SIZE * (blocks.len() + 1));
    out.extend_from_slice(&header.to_bytes());
    for block in blocks {
        out.extend_from_slice(&block.to_bytes());
    }
    out
}
