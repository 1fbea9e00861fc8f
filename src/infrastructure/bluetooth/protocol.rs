//! Linak DPG protocol
//!
//! Pure encode/decode for the desk's proprietary command set. The DPG
//! (Desk Panel Gateway) characteristic answers one-byte property queries
//! with notifications; height and speed telemetry arrives on the
//! reference-output characteristic as a fixed 4-byte sample.

use crate::domain::position::{DeskPosition, HeightSpeed, Speed};
use crate::error::ProtocolError;
use uuid::Uuid;

/// Standard GAP device-name characteristic.
pub const DEVICE_NAME_UUID: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);

/// DPG control point: property queries are written here, replies arrive
/// as notifications on the same characteristic.
pub const DPG_COMMAND_UUID: Uuid = Uuid::from_u128(0x99fa0011_338a_1024_8a49_009c0215f78a);

/// Reference output: current height/speed, readable and notifying.
pub const REFERENCE_OUTPUT_UUID: Uuid = Uuid::from_u128(0x99fa0021_338a_1024_8a49_009c0215f78a);

/// Reference input: write-only move target.
pub const MOVE_TO_UUID: Uuid = Uuid::from_u128(0x99fa0031_338a_1024_8a49_009c0215f78a);

/// The fixed set of characteristics the desk is driven through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeskCharacteristic {
    DeviceName,
    DpgCommand,
    ReferenceOutput,
    MoveTo,
}

impl DeskCharacteristic {
    pub const ALL: [DeskCharacteristic; 4] = [
        DeskCharacteristic::DeviceName,
        DeskCharacteristic::DpgCommand,
        DeskCharacteristic::ReferenceOutput,
        DeskCharacteristic::MoveTo,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::DeviceName => DEVICE_NAME_UUID,
            Self::DpgCommand => DPG_COMMAND_UUID,
            Self::ReferenceOutput => REFERENCE_OUTPUT_UUID,
            Self::MoveTo => MOVE_TO_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DeviceName => "device name",
            Self::DpgCommand => "DPG command",
            Self::ReferenceOutput => "reference output",
            Self::MoveTo => "move to",
        }
    }
}

/// DPG property codes used in read queries.
pub const PROP_GET_CAPABILITIES: u8 = 0x80;
pub const PROP_DESK_OFFSET: u8 = 0x81;
pub const PROP_USER_ID: u8 = 0x86;
pub const PROP_MEMORY_POSITION_1: u8 = 0x89;
pub const PROP_MEMORY_POSITION_2: u8 = 0x8A;

/// Reply code echoed for desk-offset queries.
const REPLY_DESK_OFFSET: u8 = 0x81;
/// The DPG1M answers queries for *both* memory positions with this same
/// reply code; callers disambiguate by fill order.
const REPLY_MEMORY_POSITION: u8 = 0x07;

/// Byte offset of the position value inside a reply payload.
const REPLY_VALUE_OFFSET: usize = 2;

/// A decoded DPG notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpgCommand {
    /// Persisted offset between raw position 0 and the floor.
    DeskOffset(DeskPosition),
    /// One of the two stored favorite positions; the reply does not say
    /// which.
    MemoryPosition(DeskPosition),
    /// Reply types the controller does not act on (capabilities, user
    /// id, ...). Decoded without error so the device may emit them
    /// freely.
    Ignored(u8),
}

/// Build the fixed read-request payload for a DPG property query.
pub fn encode_query(command_type: u8) -> [u8; 2] {
    [0x01, command_type]
}

/// Decode a notification arriving on the DPG characteristic.
pub fn decode_notification(payload: &[u8]) -> Result<DpgCommand, ProtocolError> {
    match payload.first() {
        None => return Err(ProtocolError::BadLength(0)),
        Some(&preamble) if preamble != 0x01 => return Err(ProtocolError::BadPreamble(preamble)),
        Some(_) => {}
    }
    let code = *payload.get(1).ok_or(ProtocolError::BadLength(payload.len()))?;

    match code {
        REPLY_DESK_OFFSET => Ok(DpgCommand::DeskOffset(position_at(payload, REPLY_VALUE_OFFSET)?)),
        REPLY_MEMORY_POSITION => Ok(DpgCommand::MemoryPosition(position_at(
            payload,
            REPLY_VALUE_OFFSET,
        )?)),
        other => Ok(DpgCommand::Ignored(other)),
    }
}

/// Decode a 4-byte height/speed sample from the reference output.
pub fn decode_height_speed(payload: &[u8]) -> Result<HeightSpeed, ProtocolError> {
    if payload.len() != 4 {
        return Err(ProtocolError::BadLength(payload.len()));
    }

    let height = i16::from_le_bytes([payload[0], payload[1]]);
    let speed = i16::from_le_bytes([payload[2], payload[3]]);

    Ok(HeightSpeed {
        height: DeskPosition::new(height as i32),
        speed: Speed::new(speed),
    })
}

fn position_at(payload: &[u8], offset: usize) -> Result<DeskPosition, ProtocolError> {
    let bytes = payload
        .get(offset..offset + 2)
        .ok_or(ProtocolError::BadLength(payload.len()))?;
    Ok(DeskPosition::new(
        i16::from_le_bytes([bytes[0], bytes[1]]) as i32
    ))
}
