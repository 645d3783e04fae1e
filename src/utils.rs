//! Utility functions for the vipen-ble crate.

/// Scale applied to raw int16 live readings (advertising and live-read).
pub const RAW_VALUE_SCALE: f64 = 0.01;

/// Convert a raw int16 live reading to its engineering value.
///
/// # Example
///
/// ```
/// use vipen_ble::scale_raw;
///
/// assert!((scale_raw(250) - 2.50).abs() < 1e-9);
/// ```
#[inline]
pub fn scale_raw(raw: i16) -> f64 {
    f64::from(raw) * RAW_VALUE_SCALE
}

/// Convert a raw waveform sample to an amplitude using the header coefficient.
#[inline]
pub fn scale_sample(raw: i16, coefficient: f32) -> f64 {
    f64::from(raw) * f64::from(coefficient)
}

/// Format a byte slice as a short hex preview for log lines.
pub(crate) fn hex_preview(data: &[u8], limit: usize) -> String {
    let shown = &data[..data.len().min(limit)];
    let mut out = shown
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > limit {
        out.push_str(" ..");
    }
    out
}
