//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for ViPen communication.

use uuid::Uuid;

// ViPen measurement service
/// ViPen measurement service UUID.
pub const VIPEN_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dc4179);
/// Control characteristic: command opcodes are written here, status bits are read back.
pub const CONTROL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dc4179);
/// Live-value characteristic (Read).
pub const LIVE_READ_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dc4179);
/// Waveform control characteristic (Write).
pub const WAVEFORM_CONTROL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0004_b5a3_f393_e0a9_e50e24dc4179);
/// Waveform data characteristic (Indicate).
pub const WAVEFORM_READ_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0005_b5a3_f393_e0a9_e50e24dc4179);

// Standard descriptors
/// Client Characteristic Configuration descriptor UUID.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Check if a characteristic UUID belongs to the ViPen measurement service.
pub fn is_vipen_characteristic(uuid: &Uuid) -> bool {
    [
        CONTROL_CHARACTERISTIC_UUID,
        LIVE_READ_CHARACTERISTIC_UUID,
        WAVEFORM_CONTROL_CHARACTERISTIC_UUID,
        WAVEFORM_READ_CHARACTERISTIC_UUID,
    ]
    .contains(uuid)
}
