//! Request and response envelopes.
//!
//! Envelopes are themselves tagged records (see [wire](super::wire)). On the
//! transport they travel as uppercase hex ASCII, one envelope per
//! newline-terminated line; the link appends the newline.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::wire::{WireReader, WireWriter, WIRE_LEN, WIRE_VARINT};
use crate::{Error, Result};

/// Field numbers of the envelope records.
pub mod field {
    /// Correlation id, shared by request and response
    pub const MSG_ID: u32 = 1;
    /// Request opcode
    pub const OPCODE: u32 = 2;
    /// Response error code
    pub const ERROR: u32 = 2;
    /// Payload, repeated on responses
    pub const PAYLOAD: u32 = 3;

    /// Payload block id
    pub const BLOCK_ID: u32 = 1;
    /// Payload object type tag
    pub const OBJTYPE: u32 = 2;
    /// Payload object subtype
    pub const SUBTYPE: u32 = 3;
    /// Payload encoded body
    pub const DATA: u32 = 4;
}

/// Message ids wrap on this modulus.
pub const MSG_ID_MODULUS: u32 = 0xFFFF_FF00;

/// Request opcodes understood by the controller
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    /// Ping; prompts a handshake when unacknowledged
    None = 0,
    ReadObject = 1,
    WriteObject = 2,
    CreateObject = 3,
    DeleteObject = 4,
    ListObjects = 5,
    ReadStoredObject = 6,
    ListStoredObjects = 7,
    ClearObjects = 8,
    Reboot = 9,
    FactoryReset = 10,
    ListCompatibleObjects = 11,
    DiscoverObjects = 12,
    FirmwareUpdate = 100,
}

impl From<u8> for Opcode {
    fn from(b: u8) -> Self {
        match b {
            1 => Self::ReadObject,
            2 => Self::WriteObject,
            3 => Self::CreateObject,
            4 => Self::DeleteObject,
            5 => Self::ListObjects,
            6 => Self::ReadStoredObject,
            7 => Self::ListStoredObjects,
            8 => Self::ClearObjects,
            9 => Self::Reboot,
            10 => Self::FactoryReset,
            11 => Self::ListCompatibleObjects,
            12 => Self::DiscoverObjects,
            100 => Self::FirmwareUpdate,
            _ => Self::None,
        }
    }
}

impl From<Opcode> for &'static str {
    fn from(opcode: Opcode) -> Self {
        match opcode {
            Opcode::None => "NONE",
            Opcode::ReadObject => "READ_OBJECT",
            Opcode::WriteObject => "WRITE_OBJECT",
            Opcode::CreateObject => "CREATE_OBJECT",
            Opcode::DeleteObject => "DELETE_OBJECT",
            Opcode::ListObjects => "LIST_OBJECTS",
            Opcode::ReadStoredObject => "READ_STORED_OBJECT",
            Opcode::ListStoredObjects => "LIST_STORED_OBJECTS",
            Opcode::ClearObjects => "CLEAR_OBJECTS",
            Opcode::Reboot => "REBOOT",
            Opcode::FactoryReset => "FACTORY_RESET",
            Opcode::ListCompatibleObjects => "LIST_COMPATIBLE_OBJECTS",
            Opcode::DiscoverObjects => "DISCOVER_OBJECTS",
            Opcode::FirmwareUpdate => "FIRMWARE_UPDATE",
        }
    }
}

impl From<&Opcode> for &'static str {
    fn from(opcode: &Opcode) -> Self {
        (*opcode).into()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(self))
    }
}

impl Opcode {
    /// Gets whether the controller replies to this opcode.
    ///
    /// Reboots and firmware updates reset the connection instead of replying.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Self::Reboot | Self::FactoryReset | Self::FirmwareUpdate)
    }
}

/// Error codes returned by the controller
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceErrorCode {
    Ok = 0,
    UnknownError = 1,
    InvalidOpcode = 2,
    InsufficientPersistentStorage = 16,
    InsufficientHeap = 17,
    ObjectNotFound = 64,
    ObjectNotCreatable = 65,
    ObjectNotWritable = 66,
    ObjectNotReadable = 67,
    ObjectTooLarge = 68,
    ObjectDataNotAccepted = 69,
    CrcErrorInCommand = 70,
    CrcErrorInStoredObject = 71,
    ObjectNotDeletable = 72,
    InvalidBlockId = 73,
    InvalidStoredBlockId = 74,
    DisabledBlock = 75,
    InvalidBlockType = 76,
}

impl From<u8> for DeviceErrorCode {
    fn from(b: u8) -> Self {
        match b {
            0 => Self::Ok,
            2 => Self::InvalidOpcode,
            16 => Self::InsufficientPersistentStorage,
            17 => Self::InsufficientHeap,
            64 => Self::ObjectNotFound,
            65 => Self::ObjectNotCreatable,
            66 => Self::ObjectNotWritable,
            67 => Self::ObjectNotReadable,
            68 => Self::ObjectTooLarge,
            69 => Self::ObjectDataNotAccepted,
            70 => Self::CrcErrorInCommand,
            71 => Self::CrcErrorInStoredObject,
            72 => Self::ObjectNotDeletable,
            73 => Self::InvalidBlockId,
            74 => Self::InvalidStoredBlockId,
            75 => Self::DisabledBlock,
            76 => Self::InvalidBlockType,
            _ => Self::UnknownError,
        }
    }
}

impl From<DeviceErrorCode> for &'static str {
    fn from(code: DeviceErrorCode) -> Self {
        match code {
            DeviceErrorCode::Ok => "OK",
            DeviceErrorCode::UnknownError => "UNKNOWN_ERROR",
            DeviceErrorCode::InvalidOpcode => "INVALID_OPCODE",
            DeviceErrorCode::InsufficientPersistentStorage => "INSUFFICIENT_PERSISTENT_STORAGE",
            DeviceErrorCode::InsufficientHeap => "INSUFFICIENT_HEAP",
            DeviceErrorCode::ObjectNotFound => "OBJECT_NOT_FOUND",
            DeviceErrorCode::ObjectNotCreatable => "OBJECT_NOT_CREATABLE",
            DeviceErrorCode::ObjectNotWritable => "OBJECT_NOT_WRITABLE",
            DeviceErrorCode::ObjectNotReadable => "OBJECT_NOT_READABLE",
            DeviceErrorCode::ObjectTooLarge => "OBJECT_TOO_LARGE",
            DeviceErrorCode::ObjectDataNotAccepted => "OBJECT_DATA_NOT_ACCEPTED",
            DeviceErrorCode::CrcErrorInCommand => "CRC_ERROR_IN_COMMAND",
            DeviceErrorCode::CrcErrorInStoredObject => "CRC_ERROR_IN_STORED_OBJECT",
            DeviceErrorCode::ObjectNotDeletable => "OBJECT_NOT_DELETABLE",
            DeviceErrorCode::InvalidBlockId => "INVALID_BLOCK_ID",
            DeviceErrorCode::InvalidStoredBlockId => "INVALID_STORED_BLOCK_ID",
            DeviceErrorCode::DisabledBlock => "DISABLED_BLOCK",
            DeviceErrorCode::InvalidBlockType => "INVALID_BLOCK_TYPE",
        }
    }
}

impl From<&DeviceErrorCode> for &'static str {
    fn from(code: &DeviceErrorCode) -> Self {
        (*code).into()
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(self))
    }
}

impl DeviceErrorCode {
    /// Gets whether this code reports success.
    pub fn is_ok(&self) -> bool {
        *self == Self::Ok
    }
}

/// Envelope payload: one block in wire form
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload {
    /// Numeric block id, 0 when unaddressed
    pub block_id: u16,
    /// Wire type tag
    pub objtype: u16,
    /// Subtype discriminator
    pub subtype: u16,
    /// Encoded block body
    pub data: Vec<u8>,
}

impl Payload {
    fn encode(&self, writer: &mut WireWriter) {
        let mut inner = WireWriter::new();
        inner.put_varint_field(field::BLOCK_ID, self.block_id as u64);
        inner.put_varint_field(field::OBJTYPE, self.objtype as u64);
        if self.subtype != 0 {
            inner.put_varint_field(field::SUBTYPE, self.subtype as u64);
        }
        if !self.data.is_empty() {
            inner.put_len_field(field::DATA, &self.data);
        }
        writer.put_len_field(field::PAYLOAD, &inner.into_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut payload = Self::default();

        while let Some((tag, wire_type)) = reader.next_key()? {
            match tag {
                field::BLOCK_ID => payload.block_id = reader.read_varint()? as u16,
                field::OBJTYPE => payload.objtype = reader.read_varint()? as u16,
                field::SUBTYPE => payload.subtype = reader.read_varint()? as u16,
                field::DATA => payload.data = reader.read_len()?.to_vec(),
                _ => reader.skip(wire_type)?,
            }
        }

        Ok(payload)
    }
}

/// Request envelope written to the controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedRequest {
    /// Correlation id, matched against the response
    pub msg_id: u32,
    /// Operation to perform
    pub opcode: Opcode,
    /// Optional block payload
    pub payload: Option<Payload>,
}

impl EncodedRequest {
    /// Creates a request envelope.
    pub fn new(msg_id: u32, opcode: Opcode, payload: Option<Payload>) -> Self {
        Self {
            msg_id,
            opcode,
            payload,
        }
    }

    /// Encodes the envelope as an uppercase hex line, without the newline.
    pub fn to_line(&self) -> String {
        let mut writer = WireWriter::new();
        writer.put_varint_field(field::MSG_ID, self.msg_id as u64);
        writer.put_varint_field(field::OPCODE, self.opcode as u8 as u64);
        if let Some(payload) = &self.payload {
            payload.encode(&mut writer);
        }
        hex::encode_upper(writer.into_bytes())
    }

    /// Decodes an envelope from a hex line.
    pub fn from_line(line: &str) -> Result<Self> {
        let bytes = hex::decode(line.trim())
            .map_err(|err| Error::malformed(format!("request line is not hex: {err}")))?;
        let mut reader = WireReader::new(&bytes);

        let mut request = Self::new(0, Opcode::None, None);
        while let Some((tag, wire_type)) = reader.next_key()? {
            match (tag, wire_type) {
                (field::MSG_ID, WIRE_VARINT) => request.msg_id = reader.read_varint()? as u32,
                (field::OPCODE, WIRE_VARINT) => {
                    request.opcode = Opcode::from(reader.read_varint()? as u8)
                }
                (field::PAYLOAD, WIRE_LEN) => {
                    request.payload = Some(Payload::decode(reader.read_len()?)?)
                }
                _ => reader.skip(wire_type)?,
            }
        }

        Ok(request)
    }
}

impl fmt::Display for EncodedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request(msgId: {}, opcode: {})", self.msg_id, self.opcode)
    }
}

/// Response envelope read from the controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedResponse {
    /// Correlation id of the matching request
    pub msg_id: u32,
    /// Controller result code
    pub error: DeviceErrorCode,
    /// Zero or more block payloads
    pub payload: Vec<Payload>,
}

impl EncodedResponse {
    /// Creates a response envelope.
    pub fn new(msg_id: u32, error: DeviceErrorCode, payload: Vec<Payload>) -> Self {
        Self {
            msg_id,
            error,
            payload,
        }
    }

    /// Encodes the envelope as an uppercase hex line, without the newline.
    pub fn to_line(&self) -> String {
        let mut writer = WireWriter::new();
        writer.put_varint_field(field::MSG_ID, self.msg_id as u64);
        writer.put_varint_field(field::ERROR, self.error as u8 as u64);
        for payload in &self.payload {
            payload.encode(&mut writer);
        }
        hex::encode_upper(writer.into_bytes())
    }

    /// Decodes an envelope from a hex line.
    pub fn from_line(line: &str) -> Result<Self> {
        let bytes = hex::decode(line.trim())
            .map_err(|err| Error::malformed(format!("response line is not hex: {err}")))?;
        let mut reader = WireReader::new(&bytes);

        let mut response = Self::new(0, DeviceErrorCode::Ok, vec![]);
        while let Some((tag, wire_type)) = reader.next_key()? {
            match (tag, wire_type) {
                (field::MSG_ID, WIRE_VARINT) => response.msg_id = reader.read_varint()? as u32,
                (field::ERROR, WIRE_VARINT) => {
                    response.error = DeviceErrorCode::from(reader.read_varint()? as u8)
                }
                (field::PAYLOAD, WIRE_LEN) => {
                    response.payload.push(Payload::decode(reader.read_len()?)?)
                }
                _ => reader.skip(wire_type)?,
            }
        }

        Ok(response)
    }
}

impl fmt::Display for EncodedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response(msgId: {}, error: {}, payloads: {})",
            self.msg_id,
            self.error,
            self.payload.len(),
        )
    }
}
