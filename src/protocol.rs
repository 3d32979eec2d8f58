//! BlueBoard binary protocol codec.
//! Pure, stateless encode/decode between raw 3-byte frames and the neutral
//! `DeviceEvent`/`DeviceCommand` model. All of the device's inverted state
//! bytes are handled here and nowhere else: on the wire, 0x00 means
//! "pressed" for buttons and "on" for LEDs.

use crate::bus::BusMessage;

/// Header byte of a footswitch event frame.
pub const HEADER_BUTTON: u8 = 0xB1;
/// Header byte of an LED confirmation frame sent by the device.
pub const HEADER_LED_ECHO: u8 = 0xA1;
/// Header byte of an outgoing LED command frame.
///
/// The LED command layout was never confirmed against hardware; it is the
/// best-documented candidate. Changing it here is enough, nothing outside
/// this module knows the frame bytes.
pub const HEADER_LED_COMMAND: u8 = 0xA2;
/// Header byte of a continuous-controller frame (expression pedal).
pub const HEADER_CONTROL: u8 = 0xB0;
/// Header byte of an outgoing program-change frame.
pub const HEADER_PROGRAM: u8 = 0xC0;

/// Wire id of button/LED 1; buttons 2-4 follow consecutively.
const SWITCH_ID_BASE: u8 = 0x10;
/// Number of footswitches (and LEDs) on the device.
pub const BUTTON_COUNT: u8 = 4;

/// First controller number for button-derived control changes (buttons
/// 1-4 map to 80-83). Fixed, no runtime configuration.
pub const BUTTON_CONTROLLER_BASE: u8 = 80;
/// First controller number reserved for LED control on the inbound path
/// (LEDs 1-4 map to 16-19).
pub const LED_CONTROLLER_BASE: u8 = 16;
/// The single channel all bridge traffic uses.
pub const BRIDGE_CHANNEL: u8 = 0;

/// An event decoded from a frame sent by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A footswitch changed state. `index` is 1-4.
    ButtonChanged { index: u8, pressed: bool },
    /// The device confirmed an LED state. Informational only; never
    /// re-encoded as an outgoing command.
    LedEcho { index: u8, on: bool },
    /// A continuous controller moved (expression pedal input).
    ControlChanged { controller: u8, value: u8 },
    /// Anything the codec does not understand. Never an error.
    Unrecognized { raw: Vec<u8> },
}

/// A command to be encoded and written to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Set LED `index` (1-4) on or off.
    SetLed { index: u8, on: bool },
    /// Forward a generic control change to the device unchanged in meaning.
    PassThroughControl { controller: u8, value: u8 },
    /// Forward a program change to the device.
    PassThroughProgram { program: u8 },
}

fn switch_id(index: u8) -> Option<u8> {
    if (1..=BUTTON_COUNT).contains(&index) {
        Some(SWITCH_ID_BASE + index - 1)
    } else {
        None
    }
}

fn index_from_switch_id(id: u8) -> Option<u8> {
    if (SWITCH_ID_BASE..SWITCH_ID_BASE + BUTTON_COUNT).contains(&id) {
        Some(id - SWITCH_ID_BASE + 1)
    } else {
        None
    }
}

/// Decodes a raw frame from the device.
///
/// Malformed input degrades to [`DeviceEvent::Unrecognized`]; this function
/// never fails, so an unknown frame cannot stop the notification stream.
pub fn decode(raw: &[u8]) -> DeviceEvent {
    let unrecognized = || DeviceEvent::Unrecognized { raw: raw.to_vec() };
    if raw.len() < 3 {
        return unrecognized();
    }
    match raw[0] {
        HEADER_BUTTON => match (index_from_switch_id(raw[1]), raw[2]) {
            // 0x00 on the wire means pressed.
            (Some(index), 0x00) => DeviceEvent::ButtonChanged { index, pressed: true },
            (Some(index), 0x01) => DeviceEvent::ButtonChanged { index, pressed: false },
            _ => unrecognized(),
        },
        HEADER_LED_ECHO => match (index_from_switch_id(raw[1]), raw[2]) {
            // Same inversion as commands: 0x00 means the LED is lit.
            (Some(index), 0x00) => DeviceEvent::LedEcho { index, on: true },
            (Some(index), 0x01) => DeviceEvent::LedEcho { index, on: false },
            _ => unrecognized(),
        },
        HEADER_CONTROL => {
            if raw[1] <= 0x7F && raw[2] <= 0x7F {
                DeviceEvent::ControlChanged { controller: raw[1], value: raw[2] }
            } else {
                unrecognized()
            }
        }
        _ => unrecognized(),
    }
}

/// Encodes a command into the device wire format.
///
/// Returns `None` for out-of-range fields (an LED index outside 1-4, a
/// controller or value above 127); callers log and drop those.
pub fn encode_command(command: &DeviceCommand) -> Option<Vec<u8>> {
    match command {
        DeviceCommand::SetLed { index, on } => {
            let id = switch_id(*index)?;
            let state = if *on { 0x00 } else { 0x01 };
            Some(vec![HEADER_LED_COMMAND, id, state])
        }
        DeviceCommand::PassThroughControl { controller, value } => {
            if *controller > 0x7F || *value > 0x7F {
                return None;
            }
            Some(vec![HEADER_CONTROL, *controller, *value])
        }
        DeviceCommand::PassThroughProgram { program } => {
            if *program > 0x7F {
                return None;
            }
            Some(vec![HEADER_PROGRAM, *program])
        }
    }
}

/// Encodes a device event back into wire format. Used by the simulator
/// side of the test suite; `Unrecognized` has no wire form.
pub fn encode_event(event: &DeviceEvent) -> Option<Vec<u8>> {
    match event {
        DeviceEvent::ButtonChanged { index, pressed } => {
            let id = switch_id(*index)?;
            Some(vec![HEADER_BUTTON, id, if *pressed { 0x00 } else { 0x01 }])
        }
        DeviceEvent::LedEcho { index, on } => {
            let id = switch_id(*index)?;
            Some(vec![HEADER_LED_ECHO, id, if *on { 0x00 } else { 0x01 }])
        }
        DeviceEvent::ControlChanged { controller, value } => {
            if *controller > 0x7F || *value > 0x7F {
                return None;
            }
            Some(vec![HEADER_CONTROL, *controller, *value])
        }
        DeviceEvent::Unrecognized { .. } => None,
    }
}

/// Maps a button change to its fixed outgoing control change.
pub fn button_control_change(index: u8, pressed: bool) -> Option<BusMessage> {
    if !(1..=BUTTON_COUNT).contains(&index) {
        return None;
    }
    Some(BusMessage::ControlChange {
        channel: BRIDGE_CHANNEL,
        controller: BUTTON_CONTROLLER_BASE + index - 1,
        value: if pressed { 127 } else { 0 },
    })
}

/// Returns the LED index (1-4) an inbound controller number addresses,
/// or `None` if the message is not LED control.
pub fn led_target(controller: u8) -> Option<u8> {
    if (LED_CONTROLLER_BASE..LED_CONTROLLER_BASE + BUTTON_COUNT).contains(&controller) {
        Some(controller - LED_CONTROLLER_BASE + 1)
    } else {
        None
    }
}
