//! Block payload codec.
//!
//! Transforms between wire records and the user-facing representation,
//! driven by the schema registry. Wire values are metric, integer-scaled and
//! link by numeric id; user values carry units, symbolic enum names and
//! string ids. The envelope layer ([envelope]) frames encoded payloads for
//! the transport.

pub mod envelope;
pub mod wire;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::schema::{FieldSpec, FieldType, RecordSpec, SchemaRegistry};
use crate::store::BlockStore;
use crate::units::UnitConverter;
use crate::{Error, ErrorKind, Result, GENERATED_ID_PREFIX};

pub use envelope::{
    DeviceErrorCode, EncodedRequest, EncodedResponse, Opcode, Payload, MSG_ID_MODULUS,
};

use wire::{WireReader, WireWriter};

/// Field subsets a decode can be restricted to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecodeMode {
    /// Every field except `ignored` ones
    #[default]
    Default,
    /// Only fields flagged `logged`
    Logged,
    /// Only fields flagged `stored`
    Stored,
}

/// Decode configuration
#[derive(Clone, Copy, Debug, Default)]
pub struct DecodeOpts {
    pub mode: DecodeMode,
    /// Strip `readonly` fields from the output. Off by default.
    pub strip_readonly: bool,
}

/// Raw scalar pulled off the wire, before user-side transforms.
enum RawScalar {
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

/// Schema-driven transformer between user objects and wire records.
pub struct Codec {
    registry: Arc<SchemaRegistry>,
    converter: Arc<UnitConverter>,
    store: Arc<BlockStore>,
}

impl Codec {
    /// Creates a codec over the shared registry, converter and identity store.
    pub fn new(
        registry: Arc<SchemaRegistry>,
        converter: Arc<UnitConverter>,
        store: Arc<BlockStore>,
    ) -> Self {
        Self {
            registry,
            converter,
            store,
        }
    }

    /// Gets the schema registry.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Encodes a user block payload to its wire form.
    pub fn encode_block(&self, block_type: &str, data: &Map<String, Value>) -> Result<Payload> {
        let spec = self.registry.message_by_name(block_type)?;
        let mut bytes = self.encode_record(&spec.root(), data)?;
        // Wire bodies carry a trailing NUL
        bytes.push(0);

        Ok(Payload {
            block_id: 0,
            objtype: spec.tag,
            subtype: spec.subtype,
            data: bytes,
        })
    }

    /// Decodes a wire payload to its symbolic type name and user object.
    pub fn decode_block(
        &self,
        payload: &Payload,
        opts: &DecodeOpts,
    ) -> Result<(String, Map<String, Value>)> {
        let spec = self
            .registry
            .message_by_tag(payload.objtype, payload.subtype)?;
        let body = payload
            .data
            .strip_suffix(&[0u8])
            .unwrap_or(&payload.data);
        let data = self.decode_record(&spec.root(), body, opts)?;
        Ok((spec.name.clone(), data))
    }

    /// Encodes a request envelope as a transport line.
    pub fn encode_request(&self, request: &EncodedRequest) -> String {
        request.to_line()
    }

    /// Decodes a response envelope from a transport line.
    pub fn decode_response(&self, line: &str) -> Result<EncodedResponse> {
        EncodedResponse::from_line(line)
    }

    fn encode_record(&self, rec: &RecordSpec, obj: &Map<String, Value>) -> Result<Vec<u8>> {
        let mut writer = WireWriter::new();

        for (key, value) in obj {
            let Some(field) = rec.field_by_name(key) else {
                // Unknown fields are non-fatal
                log::warn!("unknown field '{key}' is not encoded");
                continue;
            };
            if field.options.readonly() {
                continue;
            }
            self.encode_field(field, value, &mut writer)?;
        }

        Ok(writer.into_bytes())
    }

    fn encode_field(&self, field: &FieldSpec, value: &Value, writer: &mut WireWriter) -> Result<()> {
        if value.is_null() {
            if field.options.null_if_zero() {
                self.put_integer(field, 0, writer);
            }
            return Ok(());
        }

        if field.repeated {
            let items = value.as_array().ok_or_else(|| {
                Error::failure(format!("field '{}' expects an array", field.name))
            })?;
            for item in items {
                self.encode_single(field, item, writer)?;
            }
            return Ok(());
        }

        self.encode_single(field, value, writer)
    }

    fn encode_single(
        &self,
        field: &FieldSpec,
        value: &Value,
        writer: &mut WireWriter,
    ) -> Result<()> {
        if field.objtype.is_some() && field.field_type.is_integer() {
            let nid = self.resolve_link(field, value)?;
            if nid == 0 && field.options.omit_if_zero() {
                return Ok(());
            }
            writer.put_varint_field(field.tag, nid);
            return Ok(());
        }

        if field.options.datetime() {
            let seconds = parse_datetime(field, value)?;
            return self.finish_integer(field, seconds as f64, writer);
        }

        if field.options.ipv4address() {
            let packed = parse_ipv4(field, value)?;
            return self.finish_integer(field, packed as f64, writer);
        }

        if field.options.bitfield() {
            let bits = parse_bitfield(field, value)?;
            writer.put_varint_field(field.tag, bits);
            return Ok(());
        }

        match field.field_type {
            FieldType::Record => {
                let name = field.record.as_deref().ok_or_else(|| {
                    Error::new(
                        ErrorKind::UnknownType,
                        format!("field '{}' names no record type", field.name),
                    )
                })?;
                let rec = self.registry.record(name)?;
                let obj = value.as_object().ok_or_else(|| {
                    Error::failure(format!("field '{}' expects an object", field.name))
                })?;
                let bytes = self.encode_record(rec, obj)?;
                writer.put_len_field(field.tag, &bytes);
                Ok(())
            }
            FieldType::String => {
                let text = value.as_str().ok_or_else(|| {
                    Error::failure(format!("field '{}' expects a string", field.name))
                })?;
                if field.options.hexstr() {
                    let bytes = hex::decode(text).map_err(|err| {
                        Error::failure(format!("field '{}' is not hex: {err}", field.name))
                    })?;
                    writer.put_len_field(field.tag, &bytes);
                } else {
                    writer.put_len_field(field.tag, text.as_bytes());
                }
                Ok(())
            }
            FieldType::Bytes => {
                let text = value.as_str().ok_or_else(|| {
                    Error::failure(format!("field '{}' expects a hex string", field.name))
                })?;
                let bytes = hex::decode(text).map_err(|err| {
                    Error::failure(format!("field '{}' is not hex: {err}", field.name))
                })?;
                writer.put_len_field(field.tag, &bytes);
                Ok(())
            }
            FieldType::Float => {
                let converted = self.numeric_value(field, value)?;
                writer.put_float_field(field.tag, converted as f32);
                Ok(())
            }
            FieldType::Bool => {
                let set = match value {
                    Value::Bool(b) => *b,
                    Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
                    _ => {
                        return Err(Error::failure(format!(
                            "field '{}' expects a boolean",
                            field.name
                        )))
                    }
                };
                writer.put_varint_field(field.tag, set as u64);
                Ok(())
            }
            FieldType::Enum => {
                let raw = match value {
                    Value::String(name) => field.enum_value(name)?,
                    Value::Number(n) => n.as_i64().ok_or_else(|| {
                        Error::failure(format!("field '{}' expects an integer", field.name))
                    })?,
                    _ => {
                        return Err(Error::failure(format!(
                            "field '{}' expects an enum name",
                            field.name
                        )))
                    }
                };
                writer.put_varint_field(field.tag, raw as u64);
                Ok(())
            }
            _ => {
                let converted = self.numeric_value(field, value)?;
                self.finish_integer(field, converted, writer)
            }
        }
    }

    /// Applies unit conversion and scaling to a numeric user value.
    fn numeric_value(&self, field: &FieldSpec, value: &Value) -> Result<f64> {
        let (raw, unit) = match value {
            Value::Object(obj) if field.unit.is_some() => {
                let raw = obj
                    .get("value")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        Error::failure(format!("field '{}' quantity has no value", field.name))
                    })?;
                (raw, obj.get("unit").and_then(Value::as_str))
            }
            Value::Number(n) => (
                n.as_f64().ok_or_else(|| {
                    Error::failure(format!("field '{}' expects a number", field.name))
                })?,
                None,
            ),
            _ => {
                return Err(Error::failure(format!(
                    "field '{}' expects a number",
                    field.name
                )))
            }
        };

        let mut converted = raw;
        if let Some(family) = field.unit {
            // Un-annotated numbers are read as the current user unit
            let unit = unit.unwrap_or_else(|| self.converter.user_unit(family));
            converted = self.converter.to_wire(family, converted, unit)?;
        }
        if let Some(scale) = field.scale {
            converted *= scale as f64;
        }

        Ok(converted)
    }

    /// Rounds, range-checks and writes a scaled integer value.
    fn finish_integer(&self, field: &FieldSpec, value: f64, writer: &mut WireWriter) -> Result<()> {
        let rounded = round_half_away(value);
        let (min, max) = field.field_type.integer_range();

        if !rounded.is_finite() || rounded < min as f64 || rounded > max as f64 {
            return Err(Error::new(
                ErrorKind::OutOfRange,
                format!("field '{}' value {value} does not fit its wire type", field.name),
            ));
        }

        let wire = rounded as i64;
        if wire == 0 && field.options.omit_if_zero() {
            return Ok(());
        }
        self.put_integer(field, wire, writer);
        Ok(())
    }

    fn put_integer(&self, field: &FieldSpec, value: i64, writer: &mut WireWriter) {
        match field.field_type {
            FieldType::Sint32 | FieldType::Sint64 => writer.put_signed_field(field.tag, value),
            _ => writer.put_varint_field(field.tag, value as u64),
        }
    }

    /// Resolves a typed-link user value to a numeric id.
    fn resolve_link(&self, field: &FieldSpec, value: &Value) -> Result<u64> {
        match value {
            Value::Number(n) => n.as_u64().ok_or_else(|| {
                Error::new(
                    ErrorKind::UnknownLink,
                    format!("field '{}' link id must be a positive integer", field.name),
                )
            }),
            Value::String(sid) => self.sid_to_nid(sid),
            Value::Object(obj) => {
                if let (Some(given), Some(target)) = (
                    obj.get("type").and_then(Value::as_str),
                    field.objtype.as_deref(),
                ) {
                    if !self.registry.is_compatible(given, target) {
                        return Err(Error::new(
                            ErrorKind::UnknownLink,
                            format!(
                                "field '{}' links to {target}, not {given}",
                                field.name
                            ),
                        ));
                    }
                }
                if let Some(nid) = obj.get("nid").and_then(Value::as_u64) {
                    return Ok(nid);
                }
                match obj.get("id").and_then(Value::as_str) {
                    Some(sid) => self.sid_to_nid(sid),
                    None => Ok(0),
                }
            }
            _ => Err(Error::new(
                ErrorKind::UnknownLink,
                format!("field '{}' expects a link", field.name),
            )),
        }
    }

    fn sid_to_nid(&self, sid: &str) -> Result<u64> {
        if let Some(nid) = self.store.nid_of(sid) {
            return Ok(nid as u64);
        }
        if sid.starts_with(GENERATED_ID_PREFIX) {
            return self.store.assign_nid(sid).map(|nid| nid as u64);
        }
        Err(Error::new(
            ErrorKind::UnknownLink,
            format!("no block named '{sid}'"),
        ))
    }

    fn decode_record(
        &self,
        rec: &RecordSpec,
        bytes: &[u8],
        opts: &DecodeOpts,
    ) -> Result<Map<String, Value>> {
        let mut reader = WireReader::new(bytes);
        let mut out = Map::new();

        while let Some((tag, wire_type)) = reader.next_key()? {
            let Some(field) = rec.field_by_tag(tag) else {
                // Unknown fields are non-fatal
                log::warn!("skipping unknown field tag {tag}");
                reader.skip(wire_type)?;
                continue;
            };

            let value = self.decode_single(field, &mut reader, opts)?;
            if field.repeated {
                match out
                    .entry(field.name.clone())
                    .or_insert_with(|| Value::Array(vec![]))
                {
                    Value::Array(items) => items.push(value),
                    _ => unreachable!("repeated fields always decode to arrays"),
                }
            } else {
                out.insert(field.name.clone(), value);
            }
        }

        // Absent fields surface with their zero value
        for field in &rec.fields {
            if !out.contains_key(&field.name) {
                if let Some(default) = self.default_value(field)? {
                    out.insert(field.name.clone(), default);
                }
            }
        }

        // Option-driven stripping happens after defaults, so filtered views
        // stay consistent between present and absent fields
        let mut filtered = Map::new();
        for (key, value) in out {
            let Some(field) = rec.field_by_name(&key) else {
                continue;
            };
            if self.keep_field(field, &value, opts) {
                filtered.insert(key, value);
            }
        }

        Ok(filtered)
    }

    fn keep_field(&self, field: &FieldSpec, value: &Value, opts: &DecodeOpts) -> bool {
        if field.options.ignored() {
            return false;
        }
        if opts.strip_readonly && field.options.readonly() {
            return false;
        }

        let flagged = match opts.mode {
            DecodeMode::Default => true,
            DecodeMode::Logged => field.options.logged(),
            DecodeMode::Stored => field.options.stored(),
        };
        if flagged {
            return true;
        }

        // Nested records are kept while they still hold flagged content
        if field.field_type == FieldType::Record {
            return match value {
                Value::Object(map) => !map.is_empty(),
                Value::Array(items) => items
                    .iter()
                    .any(|item| !item.as_object().map(Map::is_empty).unwrap_or(true)),
                _ => false,
            };
        }

        false
    }

    fn decode_single(
        &self,
        field: &FieldSpec,
        reader: &mut WireReader<'_>,
        opts: &DecodeOpts,
    ) -> Result<Value> {
        if field.field_type == FieldType::Record {
            let name = field.record.as_deref().ok_or_else(|| {
                Error::new(
                    ErrorKind::UnknownType,
                    format!("field '{}' names no record type", field.name),
                )
            })?;
            let rec = self.registry.record(name)?;
            let bytes = reader.read_len()?;
            return Ok(Value::Object(self.decode_record(rec, bytes, opts)?));
        }

        let raw = match field.field_type {
            FieldType::Float => RawScalar::Float(reader.read_float()? as f64),
            FieldType::String | FieldType::Bytes => RawScalar::Bytes(reader.read_len()?.to_vec()),
            FieldType::Sint32 | FieldType::Sint64 => RawScalar::Int(reader.read_signed()?),
            _ => {
                let value = reader.read_varint()?;
                RawScalar::Int(i64::try_from(value).map_err(|_| {
                    Error::malformed(format!("field '{}' value exceeds i64", field.name))
                })?)
            }
        };

        self.scalar_to_user(field, raw)
    }

    /// Transforms a raw wire scalar into its user representation.
    fn scalar_to_user(&self, field: &FieldSpec, raw: RawScalar) -> Result<Value> {
        match raw {
            RawScalar::Bytes(bytes) => {
                if field.field_type == FieldType::String && !field.options.hexstr() {
                    let text = String::from_utf8(bytes).map_err(|err| {
                        Error::malformed(format!("field '{}' is not UTF-8: {err}", field.name))
                    })?;
                    Ok(Value::String(text))
                } else {
                    Ok(Value::String(hex::encode(bytes)))
                }
            }
            RawScalar::Float(value) => {
                let mut value = value;
                if let Some(scale) = field.scale {
                    value /= scale as f64;
                }
                if let Some(family) = field.unit {
                    return Ok(self.quantity_value(family, value));
                }
                Ok(json_number(value))
            }
            RawScalar::Int(raw) => {
                if field.objtype.is_some() && field.field_type.is_integer() {
                    return Ok(self.link_value(field, raw));
                }
                if field.options.null_if_zero() && raw == 0 {
                    return Ok(Value::Null);
                }
                if field.options.datetime() {
                    if raw == 0 {
                        return Ok(Value::Null);
                    }
                    let moment = Utc
                        .timestamp_opt(raw, 0)
                        .single()
                        .ok_or_else(|| {
                            Error::malformed(format!(
                                "field '{}' holds an invalid timestamp",
                                field.name
                            ))
                        })?;
                    return Ok(Value::String(
                        moment.to_rfc3339_opts(SecondsFormat::Secs, true),
                    ));
                }
                if field.options.ipv4address() {
                    let addr = std::net::Ipv4Addr::from(raw as u32);
                    return Ok(Value::String(addr.to_string()));
                }
                if field.options.bitfield() {
                    let names: Vec<Value> = field
                        .values
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .filter(|v| raw & (1 << v.value) != 0)
                        .map(|v| Value::String(v.name.clone()))
                        .collect();
                    return Ok(Value::Array(names));
                }

                match field.field_type {
                    FieldType::Bool => Ok(Value::Bool(raw != 0)),
                    FieldType::Enum => match field.enum_name(raw) {
                        Some(name) => Ok(Value::String(name.to_string())),
                        None => Ok(Value::from(raw)),
                    },
                    _ => {
                        let mut value = raw as f64;
                        if let Some(scale) = field.scale {
                            value /= scale as f64;
                        }
                        if let Some(family) = field.unit {
                            return Ok(self.quantity_value(family, value));
                        }
                        if field.scale.is_some() {
                            Ok(json_number(value))
                        } else {
                            Ok(Value::from(raw))
                        }
                    }
                }
            }
        }
    }

    /// Builds the `{ value, unit }` user representation of a quantity.
    fn quantity_value(&self, family: crate::units::UnitType, wire_value: f64) -> Value {
        let user = round2(self.converter.to_user(family, wire_value));
        let unit = self.converter.user_unit(family);
        serde_json::json!({ "value": user, "unit": unit })
    }

    /// Builds the `{ id, nid, type }` user representation of a typed link.
    fn link_value(&self, field: &FieldSpec, nid: i64) -> Value {
        let target = field.objtype.clone().unwrap_or_default();
        if nid == 0 {
            return serde_json::json!({ "id": null, "nid": null, "type": target });
        }

        let sid = self.store.sid_of(nid as u16);
        serde_json::json!({ "id": sid, "nid": nid, "type": target })
    }

    /// Zero value of an absent field, `None` when the field is omitted.
    fn default_value(&self, field: &FieldSpec) -> Result<Option<Value>> {
        if field.repeated {
            return Ok(Some(Value::Array(vec![])));
        }
        match field.field_type {
            FieldType::Record => Ok(None),
            FieldType::Float => Ok(Some(self.scalar_to_user(field, RawScalar::Float(0.0))?)),
            FieldType::String | FieldType::Bytes => {
                Ok(Some(self.scalar_to_user(field, RawScalar::Bytes(vec![]))?))
            }
            _ => Ok(Some(self.scalar_to_user(field, RawScalar::Int(0))?)),
        }
    }
}

/// Parses a user datetime (ISO-8601 string or epoch seconds) to seconds.
fn parse_datetime(field: &FieldSpec, value: &Value) -> Result<i64> {
    match value {
        Value::String(text) => {
            let moment = DateTime::parse_from_rfc3339(text).map_err(|err| {
                Error::failure(format!("field '{}' is not ISO-8601: {err}", field.name))
            })?;
            Ok(moment.timestamp())
        }
        Value::Number(n) => n.as_i64().ok_or_else(|| {
            Error::failure(format!("field '{}' expects integer seconds", field.name))
        }),
        _ => Err(Error::failure(format!(
            "field '{}' expects a datetime",
            field.name
        ))),
    }
}

/// Parses a user IPv4 value (dotted quad or integer) to its packed form.
fn parse_ipv4(field: &FieldSpec, value: &Value) -> Result<u32> {
    match value {
        Value::String(text) => text
            .parse::<std::net::Ipv4Addr>()
            .map(u32::from)
            .map_err(|err| {
                Error::failure(format!("field '{}' is not an IPv4 address: {err}", field.name))
            }),
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::OutOfRange,
                    format!("field '{}' does not fit an IPv4 address", field.name),
                )
            }),
        _ => Err(Error::failure(format!(
            "field '{}' expects an IPv4 address",
            field.name
        ))),
    }
}

/// Parses a user bitfield value (array of flag names or integer) to its word.
fn parse_bitfield(field: &FieldSpec, value: &Value) -> Result<u64> {
    match value {
        Value::Array(names) => names.iter().try_fold(0u64, |acc, name| {
            let name = name.as_str().ok_or_else(|| {
                Error::failure(format!("field '{}' expects flag names", field.name))
            })?;
            let bit = field.enum_value(name)?;
            Ok(acc | (1 << bit))
        }),
        Value::Number(n) => n.as_u64().ok_or_else(|| {
            Error::failure(format!("field '{}' expects a flag word", field.name))
        }),
        _ => Err(Error::failure(format!(
            "field '{}' expects an array of flag names",
            field.name
        ))),
    }
}

/// Rounds half-away-from-zero, the controller's fixed-point convention.
fn round_half_away(value: f64) -> f64 {
    if value >= 0.0 {
        (value + 0.5).floor()
    } else {
        (value - 0.5).ceil()
    }
}

/// Rounds a decoded user value to 2 decimals, hiding conversion residue.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Builds a JSON number, mapping non-finite values to null.
fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemDatastore;
    use crate::units::TempUnit;
    use serde_json::json;

    fn codec() -> Codec {
        let registry = Arc::new(SchemaRegistry::builtin().unwrap());
        let converter = Arc::new(UnitConverter::new());
        let store = Arc::new(BlockStore::new(Arc::new(MemDatastore::new())));

        store.insert("kettle-sensor", 100, json!({})).unwrap();
        store.insert("kettle-pair", 101, json!({})).unwrap();
        store.insert("kettle-pwm", 102, json!({})).unwrap();

        Codec::new(registry, converter, store)
    }

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_quantity_round_trip_fahrenheit() -> Result<()> {
        let codec = codec();
        codec.converter.set_temperature(TempUnit::Fahrenheit);

        let data = obj(json!({ "offset": { "value": 20, "unit": "delta_degF" } }));
        let payload = codec.encode_block("TempSensorOneWire", &data)?;

        // 20 delta_degF = 100/9 delta_degC, scaled by 256 and rounded to 2844
        let body = payload.data.strip_suffix(&[0u8]).unwrap();
        let mut reader = WireReader::new(body);
        let (tag, _) = reader.next_key()?.unwrap();
        assert_eq!(tag, 2);
        assert_eq!(reader.read_signed()?, 2844);

        let (name, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;
        assert_eq!(name, "TempSensorOneWire");
        assert_eq!(decoded["offset"], json!({ "value": 20.0, "unit": "delta_degF" }));

        Ok(())
    }

    #[test]
    fn test_plain_number_is_read_as_user_unit() -> Result<()> {
        let codec = codec();
        codec.converter.set_temperature(TempUnit::Fahrenheit);

        let annotated = obj(json!({ "offset": { "value": 18, "unit": "delta_degF" } }));
        let plain = obj(json!({ "offset": 18 }));

        assert_eq!(
            codec.encode_block("TempSensorOneWire", &annotated)?,
            codec.encode_block("TempSensorOneWire", &plain)?,
        );

        Ok(())
    }

    #[test]
    fn test_datetime_and_ipv4_round_trip() -> Result<()> {
        let codec = codec();

        let data = obj(json!({
            "date": "2023-06-15T08:30:00Z",
            "ip": "192.168.0.69",
        }));
        let payload = codec.encode_block("EdgeCase", &data)?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;

        assert_eq!(decoded["date"], json!("2023-06-15T08:30:00Z"));
        assert_eq!(decoded["ip"], json!("192.168.0.69"));

        Ok(())
    }

    #[test]
    fn test_link_encoding() -> Result<()> {
        let codec = codec();

        // Known sid resolves to its nid
        let data = obj(json!({ "sensorId": "kettle-sensor" }));
        let payload = codec.encode_block("SetpointSensorPair", &data)?;
        let body = payload.data.strip_suffix(&[0u8]).unwrap();
        let mut reader = WireReader::new(body);
        let (tag, _) = reader.next_key()?.unwrap();
        assert_eq!(tag, 1);
        assert_eq!(reader.read_varint()?, 100);

        // Unknown sid fails
        let data = obj(json!({ "sensorId": "nonexistent" }));
        let err = codec.encode_block("SetpointSensorPair", &data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownLink);

        // Generated sids get a fresh nid at or above the user range
        let data = obj(json!({ "sensorId": "New|fridge-sensor" }));
        codec.encode_block("SetpointSensorPair", &data)?;
        let nid = codec.store.nid_of("New|fridge-sensor").unwrap();
        assert!(nid >= crate::USER_NID_START);

        Ok(())
    }

    #[test]
    fn test_link_decoding() -> Result<()> {
        let codec = codec();

        let data = obj(json!({ "sensorId": { "id": "kettle-sensor", "type": "TempSensorOneWire" } }));
        let payload = codec.encode_block("SetpointSensorPair", &data)?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;

        assert_eq!(
            decoded["sensorId"],
            json!({ "id": "kettle-sensor", "nid": 100, "type": "TempSensorInterface" })
        );

        // A zero nid decodes to a null link
        let data = obj(json!({ "sensorId": null }));
        let payload = codec.encode_block("SetpointSensorPair", &data)?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;
        assert_eq!(
            decoded["sensorId"],
            json!({ "id": null, "nid": null, "type": "TempSensorInterface" })
        );

        Ok(())
    }

    #[test]
    fn test_link_target_type_is_checked() {
        let codec = codec();

        let data = obj(json!({
            "sensorId": { "id": "kettle-pwm", "type": "ActuatorPwm" }
        }));
        let err = codec.encode_block("SetpointSensorPair", &data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownLink);
    }

    #[test]
    fn test_scaled_integer_overflow() {
        let codec = codec();

        // 1e7 * 256 exceeds the sint32 range
        let data = obj(json!({ "deltaValue": { "value": 10000000, "unit": "delta_degC" } }));
        let err = codec.encode_block("EdgeCase", &data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn test_omit_if_zero() -> Result<()> {
        let codec = codec();

        let data = obj(json!({ "maybeZero": 0 }));
        let payload = codec.encode_block("EdgeCase", &data)?;
        // Nothing besides the trailing NUL
        assert_eq!(payload.data, vec![0]);

        let data = obj(json!({ "maybeZero": 7 }));
        let payload = codec.encode_block("EdgeCase", &data)?;
        assert!(payload.data.len() > 1);

        Ok(())
    }

    #[test]
    fn test_null_if_zero() -> Result<()> {
        let codec = codec();

        let data = obj(json!({ "nullable": null }));
        let payload = codec.encode_block("EdgeCase", &data)?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;
        assert_eq!(decoded["nullable"], Value::Null);

        let data = obj(json!({ "nullable": 3 }));
        let payload = codec.encode_block("EdgeCase", &data)?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;
        assert_eq!(decoded["nullable"], json!(3));

        Ok(())
    }

    #[test]
    fn test_ignored_fields_are_stripped_from_decode() -> Result<()> {
        let codec = codec();

        let data = obj(json!({ "ssid": "brewery", "password": "hunter2" }));
        let payload = codec.encode_block("WiFiSettings", &data)?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;

        assert_eq!(decoded["ssid"], json!("brewery"));
        assert!(!decoded.contains_key("password"));

        Ok(())
    }

    #[test]
    fn test_readonly_fields_are_not_encoded() -> Result<()> {
        let codec = codec();

        let data = obj(json!({
            "value": { "value": 21.0, "unit": "degC" },
            "offset": { "value": 0.5, "unit": "delta_degC" },
        }));
        let payload = codec.encode_block("TempSensorOneWire", &data)?;

        let body = payload.data.strip_suffix(&[0u8]).unwrap();
        let mut reader = WireReader::new(body);
        let (tag, _) = reader.next_key()?.unwrap();
        // Only the writable offset field went out
        assert_eq!(tag, 2);
        reader.read_signed()?;
        assert_eq!(reader.next_key()?, None);

        Ok(())
    }

    #[test]
    fn test_readonly_stripping_is_opt_in() -> Result<()> {
        let codec = codec();

        let payload = codec.encode_block("TempSensorOneWire", &obj(json!({})))?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;
        assert!(decoded.contains_key("value"));

        let opts = DecodeOpts {
            strip_readonly: true,
            ..Default::default()
        };
        let (_, decoded) = codec.decode_block(&payload, &opts)?;
        assert!(!decoded.contains_key("value"));
        assert!(decoded.contains_key("offset"));

        Ok(())
    }

    #[test]
    fn test_bitfield_round_trip() -> Result<()> {
        let codec = codec();

        let data = obj(json!({ "flags": ["OVERHEATING", "DISCONNECTED"] }));
        let payload = codec.encode_block("EdgeCase", &data)?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;

        assert_eq!(decoded["flags"], json!(["OVERHEATING", "DISCONNECTED"]));

        Ok(())
    }

    #[test]
    fn test_enum_round_trip() -> Result<()> {
        let codec = codec();

        let data = obj(json!({ "tempUnit": "TEMP_FAHRENHEIT", "timeZone": "CET-1CEST" }));
        let payload = codec.encode_block("SysInfo", &data)?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;

        assert_eq!(decoded["tempUnit"], json!("TEMP_FAHRENHEIT"));
        assert_eq!(decoded["timeZone"], json!("CET-1CEST"));

        Ok(())
    }

    #[test]
    fn test_hexed_and_hexstr_round_trip() -> Result<()> {
        let codec = codec();

        let data = obj(json!({ "mac": "28c80e9a03000000", "serial": "6272657731" }));
        let payload = codec.encode_block("EdgeCase", &data)?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;

        assert_eq!(decoded["mac"], json!("28c80e9a03000000"));
        assert_eq!(decoded["serial"], json!("6272657731"));

        Ok(())
    }

    #[test]
    fn test_unknown_field_is_skipped() -> Result<()> {
        let codec = codec();

        let data = obj(json!({ "offset": 1.5, "fantasy": 42 }));
        let payload = codec.encode_block("TempSensorOneWire", &data)?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;

        assert!(!decoded.contains_key("fantasy"));
        Ok(())
    }

    #[test]
    fn test_unknown_type() {
        let codec = codec();

        let err = codec.encode_block("NoSuchBlock", &Map::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownType);

        let payload = Payload {
            block_id: 1,
            objtype: 60000,
            subtype: 0,
            data: vec![0],
        };
        let err = codec.decode_block(&payload, &DecodeOpts::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownType);
    }

    #[test]
    fn test_absent_fields_decode_to_defaults() -> Result<()> {
        let codec = codec();

        let payload = codec.encode_block("Pid", &obj(json!({})))?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;

        assert_eq!(decoded["enabled"], json!(false));
        assert_eq!(decoded["kp"], json!({ "value": 0.0, "unit": "1 / degC" }));
        assert_eq!(
            decoded["inputId"],
            json!({ "id": null, "nid": null, "type": "SetpointSensorPairInterface" })
        );

        Ok(())
    }

    #[test]
    fn test_logged_mode_restricts_output() -> Result<()> {
        let codec = codec();

        let data = obj(json!({ "logged": 5, "unLogged": 6 }));
        let payload = codec.encode_block("EdgeCase", &data)?;

        let opts = DecodeOpts {
            mode: DecodeMode::Logged,
            ..Default::default()
        };
        let (_, decoded) = codec.decode_block(&payload, &opts)?;

        assert_eq!(decoded["logged"], json!(5));
        assert!(!decoded.contains_key("unLogged"));
        assert!(!decoded.contains_key("mode"));

        Ok(())
    }

    #[test]
    fn test_stored_mode_restricts_output() -> Result<()> {
        let codec = codec();

        let data = obj(json!({
            "storedSetting": { "value": 65.0, "unit": "degC" },
            "settingEnabled": true,
        }));
        let payload = codec.encode_block("SetpointSensorPair", &data)?;

        let opts = DecodeOpts {
            mode: DecodeMode::Stored,
            ..Default::default()
        };
        let (_, decoded) = codec.decode_block(&payload, &opts)?;

        assert_eq!(decoded["settingEnabled"], json!(true));
        assert_eq!(decoded["storedSetting"], json!({ "value": 65.0, "unit": "degC" }));
        assert!(!decoded.contains_key("value"));
        assert!(!decoded.contains_key("filter"));

        Ok(())
    }

    #[test]
    fn test_nested_and_repeated_records() -> Result<()> {
        let codec = codec();

        let data = obj(json!({
            "state": { "value": { "value": 20.0, "unit": "degC" }, "settingEnabled": true },
            "additionalLinks": [
                { "connection": "kettle-sensor" },
                { "connection": null },
            ],
            "listValues": [1.0, 2.5],
        }));
        let payload = codec.encode_block("EdgeCase", &data)?;
        let (_, decoded) = codec.decode_block(&payload, &DecodeOpts::default())?;

        assert_eq!(decoded["state"]["settingEnabled"], json!(true));
        assert_eq!(decoded["state"]["value"], json!({ "value": 20.0, "unit": "degC" }));
        assert_eq!(decoded["additionalLinks"].as_array().unwrap().len(), 2);
        assert_eq!(
            decoded["additionalLinks"][0]["connection"]["id"],
            json!("kettle-sensor")
        );
        assert_eq!(decoded["listValues"], json!([1.0, 2.5]));

        Ok(())
    }
}
