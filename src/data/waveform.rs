//! Reassembled waveform captures.

use crate::protocol::{WaveformBlock, WaveformHeader};
use crate::utils::scale_sample;

/// A complete waveform capture: header plus its ordered data blocks.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WaveformSample {
    /// Capture header (timestamp, coefficient, wave id).
    pub header: WaveformHeader,
    /// Data blocks ordered by block index.
    pub blocks: Vec<WaveformBlock>,
}

impl WaveformSample {
    /// Maximum number of amplitudes produced from one capture.
    pub const MAX_SAMPLES: usize = 1600;

    /// Create a sample from a header and blocks already in order.
    pub fn new(header: WaveformHeader, blocks: Vec<WaveformBlock>) -> Self {
        Self { header, blocks }
    }

    /// Capture id.
    pub fn wave_id(&self) -> u8 {
        self.header.wave_id
    }

    /// Device timestamp of the capture.
    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    /// Scale coefficient from the header.
    pub fn coefficient(&self) -> f32 {
        self.header.coefficient
    }

    /// Raw samples across all blocks, in block order.
    pub fn raw_samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.blocks.iter().flat_map(|block| block.samples.iter().copied())
    }

    /// Flat amplitude sequence, each raw sample scaled by the header
    /// coefficient and capped at [`Self::MAX_SAMPLES`].
    pub fn amplitudes(&self) -> Vec<f64> {
        let coefficient = self.header.coefficient;
        self.raw_samples()
            .take(Self::MAX_SAMPLES)
            .map(|raw| scale_sample(raw, coefficient))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(blocks: usize, coefficient: f32) -> WaveformSample {
        let header = WaveformHeader {
            wave_id: 2,
            coefficient,
            ..Default::default()
        };
        let blocks = (0..blocks)
            .map(|i| WaveformBlock {
                index: i as u8 + 1,
                wave_id: 2,
                samples: vec![i as i16; WaveformBlock::SAMPLES_PER_BLOCK],
            })
            .collect();
        WaveformSample::new(header, blocks)
    }

    #[test]
    fn test_amplitudes_are_scaled() {
        let sample = capture(2, 0.01);
        let amplitudes = sample.amplitudes();
        assert_eq!(amplitudes.len(), 148);
        assert_eq!(amplitudes[0], 0.0);
        assert!((amplitudes[100] - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_amplitudes_are_capped() {
        // 22 blocks of 74 samples = 1628 raw samples.
        let sample = capture(22, 1.0);
        assert_eq!(sample.raw_samples().count(), 1628);
        assert_eq!(sample.amplitudes().len(), WaveformSample::MAX_SAMPLES);
    }

    #[test]
    fn test_accessors() {
        let sample = capture(1, 0.25);
        assert_eq!(sample.wave_id(), 2);
        assert_eq!(sample.timestamp(), 0);
        assert_eq!(sample.coefficient(), 0.25);
    }
}
