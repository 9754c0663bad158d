//! HVS CAN frame layouts.
//!
//! All identifiers are standard 11-bit. Outbound frames are always eight bytes
//! long; unused bytes are zero. Layouts and constants here are bit-exact with
//! what the host controller expects and must not change.

use crate::battery::BatteryState;
use crate::codec::{decode, decode_scaled, encode, encode_scaled, Scale};
use crate::config::BatteryConfig;
use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

pub const MAX_PAYLOAD: usize = 8;
pub const MAX_STANDARD_ID: u16 = 0x7FF;

// Outbound, periodic
pub const ID_LIMITS: u16 = 0x110;
pub const ID_STATE: u16 = 0x150;
pub const ID_ALARM: u16 = 0x190;
pub const ID_BATTERY_INFO: u16 = 0x1D0;
pub const ID_CELL_INFO: u16 = 0x210;

// Outbound, handshake
pub const ID_INIT_VERSION: u16 = 0x250;
pub const ID_INIT_290: u16 = 0x290;
pub const ID_INIT_VENDOR: u16 = 0x2D0;
pub const ID_INIT_MODEL: u16 = 0x3D0;

// Inbound
pub const ID_DISCOVERY: u16 = 0x151;
pub const ID_INVERTER_BATTERY: u16 = 0x91;
pub const ID_INVERTER_SOC: u16 = 0xD1;
pub const ID_INVERTER_TIME: u16 = 0x111;

/// Opaque trailer of the battery-info frame. Meaning unknown; the host
/// controller expects it verbatim.
pub const BATTERY_INFO_TRAILER: i16 = 776;

pub const MODEL_NAME: &str = "Battery-Box Premium HVS";
const MODEL_SEGMENT_LEN: usize = MAX_PAYLOAD - 1;
pub const MODEL_SEGMENTS: usize = 4;
pub const INIT_SEQUENCE_LEN: usize = 3 + MODEL_SEGMENTS;

/// Longest host name a discovery frame can carry.
pub const HOST_NAME_LEN: usize = MAX_PAYLOAD - 1;
/// Room for a worst-case lossy decode: every byte replaced by U+FFFD.
pub type HostName = ArrayString<{ HOST_NAME_LEN * 3 }>;

const_assert!(MODEL_NAME.len() <= MODEL_SEGMENTS * MODEL_SEGMENT_LEN);
const_assert!(INIT_SEQUENCE_LEN == 7);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("payload of {0} bytes exceeds 8")]
    PayloadTooLong(usize),
    #[error("identifier {0:#x} is not a standard 11-bit id")]
    InvalidId(u32),
}

/// A single standard CAN data frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    pub id: u16,
    pub data: Vec<u8, MAX_PAYLOAD>,
}

impl CanFrame {
    pub fn new(id: u16, payload: &[u8]) -> Result<Self, ProtocolError> {
        if id > MAX_STANDARD_ID {
            return Err(ProtocolError::InvalidId(u32::from(id)));
        }
        let data = Vec::from_slice(payload).map_err(|()| ProtocolError::PayloadTooLong(payload.len()))?;
        Ok(Self { id, data })
    }

    /// Full eight-byte frame. Only called with the fixed identifiers above.
    fn full(id: u16, payload: [u8; MAX_PAYLOAD]) -> Self {
        Self {
            id,
            // Array and vector share MAX_PAYLOAD; the empty fallback is unreachable.
            data: Vec::from_slice(&payload).unwrap_or_default(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// `0x110 [08 64 06 FC ...]`, as used in debug logs.
    pub fn hex(&self) -> String {
        let mut out = format!("{:#05x} [", self.id);
        for (i, byte) in self.data.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&format!("{byte:02X}"));
        }
        out.push(']');
        out
    }
}

/// Charge/discharge limits as they go on the wire, after any safety override.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub voltage_max: f32,
    pub voltage_min: f32,
    pub discharge_current_max: f32,
    pub charge_current_max: f32,
}

impl Limits {
    pub fn from_state(state: &BatteryState) -> Self {
        Self {
            voltage_max: state.limit_voltage_max,
            voltage_min: state.limit_voltage_min,
            discharge_current_max: state.limit_discharge_current_max,
            charge_current_max: state.limit_charge_current_max,
        }
    }
}

pub fn limits_frame(limits: &Limits) -> CanFrame {
    let mut data = [0u8; MAX_PAYLOAD];
    encode_scaled::<u16>(&mut data, 0, limits.voltage_max, Scale::Deci);
    encode_scaled::<u16>(&mut data, 2, limits.voltage_min, Scale::Deci);
    encode_scaled::<i16>(&mut data, 4, limits.discharge_current_max, Scale::Deci);
    encode_scaled::<i16>(&mut data, 6, limits.charge_current_max, Scale::Deci);
    CanFrame::full(ID_LIMITS, data)
}

pub fn battery_info_frame(state: &BatteryState) -> CanFrame {
    let mut data = [0u8; MAX_PAYLOAD];
    encode_scaled::<i16>(&mut data, 0, state.voltage, Scale::Deci);
    encode_scaled::<i16>(&mut data, 2, state.current, Scale::Deci);
    encode_scaled::<i16>(&mut data, 4, state.temperature, Scale::Deci);
    encode(&mut data, 6, BATTERY_INFO_TRAILER);
    CanFrame::full(ID_BATTERY_INFO, data)
}

pub fn cell_info_frame(state: &BatteryState) -> CanFrame {
    let mut data = [0u8; MAX_PAYLOAD];
    encode_scaled::<u16>(&mut data, 0, state.cell_temp_max, Scale::Deci);
    encode_scaled::<u16>(&mut data, 2, state.cell_temp_min, Scale::Deci);
    CanFrame::full(ID_CELL_INFO, data)
}

/// Caller is responsible for recomputing remaining capacity first.
pub fn state_frame(state: &BatteryState) -> CanFrame {
    let mut data = [0u8; MAX_PAYLOAD];
    encode_scaled::<u16>(&mut data, 0, state.soc_percent, Scale::Centi);
    encode_scaled::<u16>(&mut data, 2, state.soh_percent, Scale::Centi);
    encode_scaled::<u16>(&mut data, 4, state.remaining_capacity_ah, Scale::Deci);
    encode_scaled::<u16>(&mut data, 6, state.full_capacity_ah, Scale::Deci);
    CanFrame::full(ID_STATE, data)
}

pub fn alarm_frame() -> CanFrame {
    CanFrame::full(ID_ALARM, [0u8; MAX_PAYLOAD])
}

/// The seven frames answering an identification request, in transmit order.
pub fn init_sequence(config: &BatteryConfig) -> [CanFrame; INIT_SEQUENCE_LEN] {
    let capacity_hwh = (config.capacity_wh / 100) as u16;
    let [capacity_hi, capacity_lo] = capacity_hwh.to_be_bytes();
    let version = CanFrame::full(
        ID_INIT_VERSION,
        [
            config.firmware_major,
            config.firmware_minor,
            0x00,
            0x66,
            capacity_hi,
            capacity_lo,
            0x02,
            0x09,
        ],
    );
    let unknown = CanFrame::full(ID_INIT_290, [0x06, 0x37, 0x10, 0xD9, 0x00, 0x00, 0x00, 0x00]);
    let vendor = CanFrame::full(ID_INIT_VENDOR, [0x00, b'B', b'Y', b'D', 0x00, 0x00, 0x00, 0x00]);
    let [m0, m1, m2, m3] = model_segments();
    [version, unknown, vendor, m0, m1, m2, m3]
}

fn model_segments() -> [CanFrame; MODEL_SEGMENTS] {
    let name = MODEL_NAME.as_bytes();
    core::array::from_fn(|index| {
        let mut data = [0u8; MAX_PAYLOAD];
        data[0] = index as u8;
        let start = (index * MODEL_SEGMENT_LEN).min(name.len());
        let end = (start + MODEL_SEGMENT_LEN).min(name.len());
        data[1..=end - start].copy_from_slice(&name[start..end]);
        CanFrame::full(ID_INIT_MODEL, data)
    })
}

/// What an inbound frame means to the emulator.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Host controller announced its own name.
    HostName(HostName),
    /// Host controller asked for the identification sequence.
    IdentificationRequest,
    InverterBattery {
        voltage: f32,
        current: f32,
        temperature: f32,
    },
    InverterSoc(f32),
    InverterTimestamp(u32),
}

/// Decode an inbound frame. Unknown identifiers, unknown discovery commands,
/// empty host names and short payloads yield `None`.
pub fn decode_inbound(frame: &CanFrame) -> Option<InboundMessage> {
    let data = frame.data.as_slice();
    match frame.id {
        ID_INVERTER_BATTERY if data.len() >= 6 => Some(InboundMessage::InverterBattery {
            voltage: decode_scaled::<u16>(data, 0, Scale::Deci),
            current: decode_scaled::<u16>(data, 2, Scale::Deci),
            temperature: decode_scaled::<u16>(data, 4, Scale::Deci),
        }),
        ID_INVERTER_SOC if data.len() >= 2 => {
            Some(InboundMessage::InverterSoc(decode_scaled::<u16>(data, 0, Scale::Deci)))
        }
        ID_INVERTER_TIME if data.len() >= 4 => {
            Some(InboundMessage::InverterTimestamp(decode::<u32>(data, 0)))
        }
        ID_DISCOVERY => match data.first() {
            Some(0x00) => parse_host_name(&data[1..]).map(InboundMessage::HostName),
            Some(0x01) => Some(InboundMessage::IdentificationRequest),
            _ => None,
        },
        _ => None,
    }
}

/// Bytes up to the first NUL. Invalid UTF-8 is kept as replacement
/// characters rather than dropping the name.
fn parse_host_name(bytes: &[u8]) -> Option<HostName> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let bytes = &bytes[..end.min(HOST_NAME_LEN)];
    if bytes.is_empty() {
        return None;
    }
    ArrayString::from(&String::from_utf8_lossy(bytes)).ok()
}
