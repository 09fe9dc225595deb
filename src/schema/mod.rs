//! Compiled message descriptors.
//!
//! The registry loads precompiled schema descriptors at startup and exposes,
//! per message type: the wire tag, the symbolic name, the field graph
//! (including nested record types and repeated fields), and per-field options.
//! Descriptors are data, not code; the codec walks them to transform payloads.

mod options;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::units::UnitType;
use crate::{Error, ErrorKind, Result};

pub use options::FieldFlags;

/// Wire tag matching any block type in compatibility queries.
pub const ANY_TYPE_TAG: u16 = 255;

/// Scalar and composite wire types a field can carry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Single varint, 0 or 1
    Bool,
    /// Unsigned varint, 32-bit range
    Uint32,
    /// Unsigned varint, 64-bit range
    Uint64,
    /// Zigzag-encoded varint, 32-bit range
    Sint32,
    /// Zigzag-encoded varint, 64-bit range
    Sint64,
    /// Little-endian IEEE 754 single
    Float,
    /// Length-prefixed UTF-8
    String,
    /// Length-prefixed raw bytes
    Bytes,
    /// Varint mapped to a symbolic name
    Enum,
    /// Length-prefixed nested record
    Record,
}

impl FieldType {
    /// Gets whether values of this type are varint-encoded integers.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Bool | Self::Uint32 | Self::Uint64 | Self::Sint32 | Self::Sint64 | Self::Enum
        )
    }

    /// Integer bounds after scaling, used for overflow checks.
    pub fn integer_range(&self) -> (i64, i64) {
        match self {
            Self::Bool => (0, 1),
            Self::Uint32 => (0, u32::MAX as i64),
            Self::Uint64 => (0, i64::MAX),
            Self::Sint32 => (i32::MIN as i64, i32::MAX as i64),
            Self::Sint64 => (i64::MIN, i64::MAX),
            Self::Enum => (0, u32::MAX as i64),
            _ => (i64::MIN, i64::MAX),
        }
    }
}

/// One field of a message or nested record
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FieldSpec {
    /// User-facing field name
    pub name: String,
    /// Wire field number
    pub tag: u32,
    /// Wire type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Repeated fields decode to arrays
    #[serde(default)]
    pub repeated: bool,
    /// Wire unit family for quantity fields
    #[serde(default)]
    pub unit: Option<UnitType>,
    /// Fixed-point scale: wire integer = user value * scale
    #[serde(default)]
    pub scale: Option<u32>,
    /// Target block type for typed links
    #[serde(default)]
    pub objtype: Option<String>,
    /// Record name for [FieldType::Record] fields
    #[serde(default)]
    pub record: Option<String>,
    /// Symbolic values for [FieldType::Enum] fields, and flag names
    /// (by bit index) for `bitfield` fields
    #[serde(default)]
    pub values: Option<Vec<EnumValue>>,
    /// Packed boolean options
    #[serde(default, skip_serializing_if = "FieldFlags::is_empty")]
    pub options: FieldFlags,
}

/// A named wire value of an enum or bitfield field
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EnumValue {
    pub name: String,
    pub value: i64,
}

impl FieldSpec {
    /// Looks up the wire value for a symbolic enum name.
    pub fn enum_value(&self, name: &str) -> Result<i64> {
        self.values
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::OutOfRange,
                    format!("'{name}' is not a value of field '{}'", self.name),
                )
            })
    }

    /// Looks up the symbolic name for a wire enum value.
    pub fn enum_name(&self, value: i64) -> Option<&str> {
        self.values
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|v| v.value == value)
            .map(|v| v.name.as_str())
    }
}

/// A reusable nested record type
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RecordSpec {
    pub fields: Vec<FieldSpec>,
}

impl RecordSpec {
    /// Finds a field by user-facing name.
    pub fn field_by_name(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Finds a field by wire tag.
    pub fn field_by_tag(&self, tag: u32) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.tag == tag)
    }
}

/// One block message type: wire tag, symbolic name and root field graph
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MessageSpec {
    /// Symbolic block type name, e.g. `"Pid"`
    pub name: String,
    /// Wire type code
    pub tag: u16,
    /// Subtype discriminator, 0 for single-encoding types
    #[serde(default)]
    pub subtype: u16,
    /// Interface tags this type implements
    #[serde(default, rename = "impl")]
    pub interfaces: Vec<String>,
    /// Root record fields
    pub fields: Vec<FieldSpec>,
}

impl MessageSpec {
    /// Gets the root record view of this message.
    pub fn root(&self) -> RecordSpec {
        RecordSpec {
            fields: self.fields.clone(),
        }
    }
}

/// Serialized descriptor set, the JSON shape of the compiled schemas
#[derive(Clone, Debug, Deserialize, Serialize)]
struct DescriptorSet {
    /// Interface name to wire tag
    #[serde(default)]
    interfaces: HashMap<String, u16>,
    /// Reusable nested record types
    #[serde(default)]
    records: HashMap<String, RecordSpec>,
    /// Block message types
    messages: Vec<MessageSpec>,
}

/// Registry of every known message type and nested record.
///
/// Loaded once at startup and shared read-only. Lookups by wire tag resolve
/// responses; lookups by name resolve client requests.
#[derive(Debug)]
pub struct SchemaRegistry {
    messages: Vec<MessageSpec>,
    by_tag: HashMap<(u16, u16), usize>,
    by_name: HashMap<String, usize>,
    records: HashMap<String, RecordSpec>,
    interfaces: HashMap<String, u16>,
}

impl SchemaRegistry {
    /// Loads a registry from a serialized descriptor set.
    pub fn from_json(serialized: &str) -> Result<Self> {
        let set: DescriptorSet = serde_json::from_str(serialized)?;

        let mut by_tag = HashMap::new();
        let mut by_name = HashMap::new();

        for (idx, msg) in set.messages.iter().enumerate() {
            if by_tag.insert((msg.tag, msg.subtype), idx).is_some() {
                return Err(Error::failure(format!(
                    "duplicate descriptor tag {}:{}",
                    msg.tag, msg.subtype
                )));
            }
            if by_name.insert(msg.name.clone(), idx).is_some() {
                return Err(Error::failure(format!(
                    "duplicate descriptor name {}",
                    msg.name
                )));
            }
        }

        Ok(Self {
            messages: set.messages,
            by_tag,
            by_name,
            records: set.records,
            interfaces: set.interfaces,
        })
    }

    /// Loads the descriptor set compiled into the service.
    pub fn builtin() -> Result<Self> {
        Self::from_json(include_str!("../../schemas/blocks.json"))
    }

    /// Gets every known message type.
    pub fn messages(&self) -> &[MessageSpec] {
        &self.messages
    }

    /// Resolves a message type by wire tag and subtype.
    pub fn message_by_tag(&self, tag: u16, subtype: u16) -> Result<&MessageSpec> {
        self.by_tag
            .get(&(tag, subtype))
            .map(|&idx| &self.messages[idx])
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::UnknownType,
                    format!("no descriptor for type {tag}:{subtype}"),
                )
            })
    }

    /// Resolves a message type by symbolic name.
    pub fn message_by_name(&self, name: &str) -> Result<&MessageSpec> {
        self.by_name
            .get(name)
            .map(|&idx| &self.messages[idx])
            .ok_or_else(|| {
                Error::new(ErrorKind::UnknownType, format!("no descriptor for '{name}'"))
            })
    }

    /// Resolves a nested record type by name.
    pub fn record(&self, name: &str) -> Result<&RecordSpec> {
        self.records.get(name).ok_or_else(|| {
            Error::new(ErrorKind::UnknownType, format!("no record descriptor '{name}'"))
        })
    }

    /// Gets the wire tag for a block type or interface name.
    pub fn type_tag(&self, name: &str) -> Result<u16> {
        if let Some(&tag) = self.interfaces.get(name) {
            return Ok(tag);
        }
        self.message_by_name(name).map(|msg| msg.tag)
    }

    /// Gets the symbolic name for a block type or interface tag.
    pub fn type_name(&self, tag: u16) -> Option<&str> {
        if let Some((name, _)) = self.interfaces.iter().find(|(_, &t)| t == tag) {
            return Some(name);
        }
        self.by_tag
            .iter()
            .find(|((t, _), _)| *t == tag)
            .map(|(_, &idx)| self.messages[idx].name.as_str())
    }

    /// Gets whether a concrete type satisfies a link target type.
    ///
    /// A target matches when it names the concrete type itself, an interface
    /// the type implements, or the wildcard tag.
    pub fn is_compatible(&self, concrete: &str, target: &str) -> bool {
        if concrete == target {
            return true;
        }
        if self.interfaces.get(target) == Some(&ANY_TYPE_TAG) {
            return true;
        }
        match self.message_by_name(concrete) {
            Ok(msg) => msg.interfaces.iter().any(|i| i == target),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_descriptors_load() {
        let registry = SchemaRegistry::builtin().unwrap();

        let sysinfo = registry.message_by_name("SysInfo").unwrap();
        assert_eq!(sysinfo.tag, 256);
        assert_eq!(registry.message_by_tag(256, 0).unwrap().name, "SysInfo");

        let pid = registry.message_by_name("Pid").unwrap();
        assert_eq!(pid.tag, 304);
        assert!(pid.interfaces.iter().any(|i| i == "ProcessValueInterface"));
    }

    #[test]
    fn test_unknown_type() {
        let registry = SchemaRegistry::builtin().unwrap();

        let err = registry.message_by_name("Unheard").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownType);
        let err = registry.message_by_tag(65000, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownType);
    }

    #[test]
    fn test_field_options_parsed() {
        let registry = SchemaRegistry::builtin().unwrap();
        let sensor = registry.message_by_name("TempSensorOneWire").unwrap();

        let address = sensor.root().field_by_name("address").cloned().unwrap();
        assert!(address.options.hexed());

        let value = sensor.root().field_by_name("value").cloned().unwrap();
        assert!(value.options.readonly());
        assert!(value.options.logged());
        assert_eq!(value.unit, Some(UnitType::Celsius));
    }

    #[test]
    fn test_compatibility() {
        let registry = SchemaRegistry::builtin().unwrap();

        assert!(registry.is_compatible("TempSensorOneWire", "TempSensorInterface"));
        assert!(registry.is_compatible("TempSensorOneWire", "TempSensorOneWire"));
        assert!(registry.is_compatible("TempSensorOneWire", "Any"));
        assert!(!registry.is_compatible("TempSensorOneWire", "ActuatorAnalogInterface"));
    }

    #[test]
    fn test_interface_tags() {
        let registry = SchemaRegistry::builtin().unwrap();

        assert_eq!(registry.type_tag("TempSensorInterface").unwrap(), 2);
        assert_eq!(registry.type_tag("Pid").unwrap(), 304);
        assert_eq!(registry.type_name(2), Some("TempSensorInterface"));
        assert_eq!(registry.type_name(304), Some("Pid"));
    }
}
