//! # Brewlink
//!
//! This crate implements the service-side half of a brewing controller gateway:
//! a long-lived process that maintains a single bidirectional link to one
//! embedded controller, exposes its typed configuration/state records
//! ("blocks") to higher-level clients, and keeps persistent identity and
//! settings consistent across controller reboots and service restarts.
//!
//! The controller speaks the controlbox protocol: newline-terminated
//! hex-encoded request/response envelopes, interleaved with `<...>` annotations
//! on the same byte stream. The modules in this crate split roughly into three
//! layers:
//!
//! * Byte level: [parser] demultiplexes the inbound stream, [codec::wire]
//!   reads and writes tagged records, [ymodem] transfers firmware images.
//! * Message level: [schema] describes block payloads, [codec] transforms
//!   between wire records and unit-bearing user values, [units] converts
//!   between controller-native and user-facing units.
//! * Service level: [link] owns the transport, [command] correlates
//!   request/response traffic, [state] tracks the connection lifecycle,
//!   [sync] drives synchronization, and the [store] modules persist block
//!   identities and settings to the datastore.
//!
//! All service-level components are plain structs passed around by `Arc`;
//! there are no module-level globals. The `brewlinkd` binary wires them
//! together in [service].

#[macro_use(bitfield)]
extern crate bitfield;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Block payload codec and request/response envelopes
pub mod codec;
/// Command layer: high-level block operations over the link
pub mod command;
/// Service configuration surface
pub mod config;
/// Library error types
pub mod error;
/// Transport ownership, connection and discovery
pub mod link;
mod macros;
/// Frame parser for the inbound byte stream
pub mod parser;
/// Compiled message descriptors and per-field options
pub mod schema;
/// Service wiring and task lifecycle
pub mod service;
/// Connection state machine and handshake types
pub mod state;
/// Identity and settings persistence
pub mod store;
/// Synchronization routines between service, controller and datastore
pub mod sync;
/// Unit conversion between controller and user units
pub mod units;
/// YMODEM/1K firmware sender
pub mod ymodem;

pub use error::{Error, ErrorKind, Result};

/// First numeric id available to user-created blocks.
///
/// Everything below this value is reserved for system blocks.
pub const USER_NID_START: u16 = 100;

/// String id prefix requesting assignment of a fresh numeric id.
///
/// Clients may link to not-yet-created blocks by using `New|` ids;
/// the codec allocates a numeric id and stores the pairing on first use.
pub const GENERATED_ID_PREFIX: &str = "New|";

/// Datastore namespace for service-scoped documents.
pub const SERVICE_NAMESPACE: &str = "spark-service";
/// Datastore namespace for configuration shared by all services.
pub const GLOBAL_NAMESPACE: &str = "brewblox-global";
/// Document id for the global unit preferences.
pub const GLOBAL_UNITS_ID: &str = "units";
/// Document id for the global time zone.
pub const GLOBAL_TIME_ZONE_ID: &str = "timeZone";

/// Annotation prefix of the controller welcome (handshake) event.
pub const WELCOME_PREFIX: &str = "BREWBLOX";
/// Annotation prefix of controlbox error events.
pub const CBOX_ERR_PREFIX: &str = "CBOXERROR:";
/// Annotation emitted when the controller drops into listening mode.
pub const SETUP_MODE_PREFIX: &str = "SETUP_MODE";

/// Protocol version compiled into this service.
///
/// Compared against the `proto_version` field of the handshake;
/// a mismatch quarantines the controller (see [state]).
pub const PROTO_VERSION: &str = "3f2243a9";

/// Numeric ids of the controller's system blocks.
pub mod sys_nid {
    pub const SYSINFO: u16 = 2;
    pub const ONEWIREBUS: u16 = 4;
    pub const WIFI_SETTINGS: u16 = 5;
    pub const TOUCH_SETTINGS: u16 = 6;
    pub const DISPLAY_SETTINGS: u16 = 7;
    pub const SPARK_PINS: u16 = 19;
}

/// Default (sid, nid) pairs for system blocks.
///
/// Seeded into the identity store on every load, so system blocks are always
/// addressable by name even on a blank datastore.
pub const SYS_OBJECT_KEYS: [(&str, u16); 6] = [
    ("SystemInfo", sys_nid::SYSINFO),
    ("OneWireBus", sys_nid::ONEWIREBUS),
    ("WiFiSettings", sys_nid::WIFI_SETTINGS),
    ("TouchSettings", sys_nid::TOUCH_SETTINGS),
    ("DisplaySettings", sys_nid::DISPLAY_SETTINGS),
    ("SparkPins", sys_nid::SPARK_PINS),
];

/// A block identity: user-assigned string id and controller-assigned numeric id.
///
/// Either key may be absent when addressing a block; see
/// [store::BlockStore] for resolution rules.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BlockIdent {
    /// String id, unique per service
    #[serde(default)]
    pub id: Option<String>,
    /// Numeric id, unique per controller
    #[serde(default)]
    pub nid: Option<u16>,
}

impl BlockIdent {
    /// Creates an identity addressing a block by string id.
    pub fn by_sid<S: Into<String>>(sid: S) -> Self {
        Self {
            id: Some(sid.into()),
            nid: None,
        }
    }

    /// Creates an identity addressing a block by numeric id.
    pub fn by_nid(nid: u16) -> Self {
        Self {
            id: None,
            nid: Some(nid),
        }
    }
}

impl fmt::Display for BlockIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}]",
            self.id.as_deref().unwrap_or("-"),
            self.nid.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
        )
    }
}

/// A typed controller block with its identity and decoded payload.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Block {
    /// String id, absent for blocks never named by a client
    #[serde(default)]
    pub id: Option<String>,
    /// Numeric id assigned by the controller
    pub nid: u16,
    /// Symbolic block type, e.g. `"Pid"`
    #[serde(rename = "type")]
    pub block_type: String,
    /// Subtype discriminator for types with multiple wire encodings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<u16>,
    /// Decoded payload, shaped by the schema for `block_type`
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Block {
    /// Gets the identity keys of this block.
    pub fn ident(&self) -> BlockIdent {
        BlockIdent {
            id: self.id.clone(),
            nid: Some(self.nid),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{} {} nid={}>",
            self.block_type,
            self.id.as_deref().unwrap_or("-"),
            self.nid,
        )
    }
}
