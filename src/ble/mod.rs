//! Bluetooth layer: the capability trait boundary the connection manager
//! drives, the production backend over `bluest`, and the GATT identifiers
//! the device is known to use.

pub mod backend;
pub mod bluest_backend;

use uuid::Uuid;

/// Standard housekeeping services every peripheral exposes; never selected
/// as the device's protocol service.
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid =
    Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
pub const UUID_GENERIC_ATTRIBUTE_SERVICE: Uuid =
    Uuid::from_u128(0x00001801_0000_1000_8000_00805f9b34fb);
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_SERVICE: Uuid =
    Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// The documented protocol service (BLE-MIDI). Some firmware variants omit
/// it from advertisements, so it is a preference, not a filter.
pub const UUID_MIDI_SERVICE: Uuid = Uuid::from_u128(0x03b80e5a_ede8_4b33_a751_6ce34ec4c700);

/// The documented data characteristic, preferred as the write channel when
/// present.
pub const UUID_MIDI_IO_CHAR: Uuid = Uuid::from_u128(0x7772e5db_3868_4112_a1a9_f2669d106bf3);

/// Returns true for services the protocol-service heuristic must skip.
pub fn is_housekeeping_service(uuid: &Uuid) -> bool {
    [
        UUID_GENERIC_ACCESS_SERVICE,
        UUID_GENERIC_ATTRIBUTE_SERVICE,
        UUID_DEVICE_INFORMATION_SERVICE,
        UUID_BATTERY_SERVICE,
    ]
    .contains(uuid)
}
