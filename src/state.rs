//! Connection state machine.
//!
//! The connection advances `disconnected → connected → acknowledged →
//! synchronized`, with `updating` as a side channel, and may revert to
//! `disconnected` at any time. Block operations are gated on the
//! synchronized state; every wait is bounded.

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::codec::DeviceErrorCode;
use crate::{
    inner_enum, Error, ErrorKind, Result, CBOX_ERR_PREFIX, PROTO_VERSION, SETUP_MODE_PREFIX,
    WELCOME_PREFIX,
};

/// Fatal conditions that terminate the process with a distinct exit code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The controller dropped into listening mode and needs external setup
    SetupMode,
    /// The connect loop exhausted its attempt budget
    ConnectionAborted,
}

impl ExitReason {
    /// Process exit code handed to the external supervisor.
    pub fn code(&self) -> i32 {
        match self {
            Self::SetupMode => 66,
            Self::ConnectionAborted => 67,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetupMode => write!(f, "controller entered listening mode"),
            Self::ConnectionAborted => write!(f, "connection attempts exhausted"),
        }
    }
}

/// Decoded controller welcome annotation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub firmware_version: String,
    pub proto_version: String,
    pub firmware_date: String,
    pub proto_date: String,
    pub system_version: String,
    pub platform: String,
    pub reset_reason: String,
    pub reset_data: String,
    pub device_id: String,
}

impl HandshakeMessage {
    /// Parses the welcome event body.
    ///
    /// The body is a comma-separated list led by the welcome prefix:
    /// `BREWBLOX,<firmware_version>,<proto_version>,<firmware_date>,
    /// <proto_date>,<system_version>,<platform>,<reset_reason>,<reset_data>,
    /// <device_id>`.
    pub fn parse(body: &str) -> Result<Self> {
        let fields: Vec<&str> = body.split(',').collect();

        if fields.len() < 10 || fields[0] != WELCOME_PREFIX {
            return Err(Error::malformed(format!("invalid welcome event: '{body}'")));
        }

        Ok(Self {
            firmware_version: fields[1].to_string(),
            proto_version: fields[2].to_string(),
            firmware_date: fields[3].to_string(),
            proto_date: fields[4].to_string(),
            system_version: fields[5].to_string(),
            platform: fields[6].to_string(),
            reset_reason: fields[7].to_string(),
            reset_data: fields[8].to_string(),
            device_id: fields[9].to_string(),
        })
    }
}

impl fmt::Display for HandshakeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "firmware {} (proto {}) on {} [{}], reset: {}",
            self.firmware_version, self.proto_version, self.platform, self.device_id,
            self.reset_reason,
        )
    }
}

/// Description of the connected controller, replaced on each handshake
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceInfo {
    pub firmware_version: String,
    pub proto_version: String,
    pub firmware_date: String,
    pub proto_date: String,
    pub device_id: String,
    pub system_version: String,
    pub platform: String,
    pub reset_reason: String,
}

impl From<&HandshakeMessage> for DeviceInfo {
    fn from(msg: &HandshakeMessage) -> Self {
        Self {
            firmware_version: msg.firmware_version.clone(),
            proto_version: msg.proto_version.clone(),
            firmware_date: msg.firmware_date.clone(),
            proto_date: msg.proto_date.clone(),
            device_id: msg.device_id.clone(),
            system_version: msg.system_version.clone(),
            platform: msg.platform.clone(),
            reset_reason: msg.reset_reason.clone(),
        }
    }
}

/// Firmware compatibility verdict from the handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirmwareError {
    Incompatible,
}

/// Device identity verdict from the handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityError {
    InvalidDeviceId,
}

/// Classified controller event annotation
#[derive(Clone, Debug, PartialEq)]
pub enum ControllerEvent {
    /// Handshake, emitted after link-up and on ping while unacknowledged
    Welcome(HandshakeMessage),
    /// Controlbox error report, hex error code
    CboxError(DeviceErrorCode),
    /// The controller dropped into listening mode
    SetupMode,
    /// Any other event, logged and ignored
    Other(String),
}

impl ControllerEvent {
    /// Classifies an event annotation body.
    pub fn classify(body: &str) -> Self {
        if body.starts_with(WELCOME_PREFIX) {
            return match HandshakeMessage::parse(body) {
                Ok(msg) => Self::Welcome(msg),
                Err(err) => {
                    log::warn!("discarding welcome event: {err}");
                    Self::Other(body.to_string())
                }
            };
        }
        if let Some(code) = body.strip_prefix(CBOX_ERR_PREFIX) {
            return match u8::from_str_radix(code.trim(), 16) {
                Ok(code) => Self::CboxError(DeviceErrorCode::from(code)),
                Err(_) => Self::Other(body.to_string()),
            };
        }
        if body.starts_with(SETUP_MODE_PREFIX) {
            return Self::SetupMode;
        }
        Self::Other(body.to_string())
    }
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Welcome(msg) => write!(f, "Welcome({msg})"),
            Self::CboxError(code) => write!(f, "CboxError({code})"),
            Self::SetupMode => write!(f, "SetupMode"),
            Self::Other(body) => write!(f, "Other({body})"),
        }
    }
}

inner_enum!(ControllerEvent, Welcome, HandshakeMessage);

/// Point-in-time snapshot of the connection state
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatusDescription {
    pub enabled: bool,
    pub connected: bool,
    pub acknowledged: bool,
    pub synchronized: bool,
    pub updating: bool,
    pub firmware_error: Option<FirmwareError>,
    pub identity_error: Option<IdentityError>,
    pub address: Option<String>,
    pub device: Option<DeviceInfo>,
}

#[derive(Default)]
struct StatusInner {
    desc: StatusDescription,
}

/// Tracks the connection lifecycle and gates block operations.
///
/// Setters are called by the link and synchronizer; waiters use bounded
/// condvar waits and never block indefinitely.
pub struct StateMachine {
    expected_device_id: Option<String>,
    skip_version_check: bool,
    inner: Mutex<StatusInner>,
    cond: Condvar,
}

impl StateMachine {
    /// Creates a state machine with the configured identity policy.
    pub fn new(expected_device_id: Option<String>, skip_version_check: bool) -> Self {
        Self {
            expected_device_id,
            skip_version_check,
            inner: Mutex::new(StatusInner::default()),
            cond: Condvar::new(),
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut StatusDescription)) {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        f(&mut inner.desc);
        self.cond.notify_all();
    }

    /// Gets a snapshot of the current state.
    pub fn desc(&self) -> StatusDescription {
        self.inner.lock().expect("state lock poisoned").desc.clone()
    }

    /// Sets the service-level desire to connect.
    pub fn set_enabled(&self, enabled: bool) {
        self.mutate(|desc| desc.enabled = enabled);
    }

    /// Marks the transport as live.
    pub fn set_connected(&self, address: &str) {
        log::info!("connected to {address}");
        self.mutate(|desc| {
            desc.connected = true;
            desc.address = Some(address.to_string());
        });
    }

    /// Applies a received handshake.
    ///
    /// The state advances to acknowledged even when validation fails;
    /// the stored errors then stop the synchronizer, so higher layers can
    /// still report status for a quarantined controller.
    pub fn set_acknowledged(&self, handshake: &HandshakeMessage) {
        let firmware_error = if !self.skip_version_check
            && handshake.proto_version != PROTO_VERSION
        {
            log::error!(
                "incompatible firmware: proto {} does not match service proto {}",
                handshake.proto_version,
                PROTO_VERSION,
            );
            Some(FirmwareError::Incompatible)
        } else {
            None
        };

        let identity_error = match &self.expected_device_id {
            Some(expected) if !expected.is_empty() && *expected != handshake.device_id => {
                log::error!(
                    "invalid device id: {} does not match configured {expected}",
                    handshake.device_id,
                );
                Some(IdentityError::InvalidDeviceId)
            }
            _ => None,
        };

        self.mutate(|desc| {
            if !desc.connected {
                log::warn!("discarding handshake while disconnected");
                return;
            }
            desc.acknowledged = true;
            desc.firmware_error = firmware_error;
            desc.identity_error = identity_error;
            desc.device = Some(DeviceInfo::from(handshake));
        });
    }

    /// Marks synchronization as complete.
    pub fn set_synchronized(&self) {
        self.mutate(|desc| {
            if desc.acknowledged {
                desc.synchronized = true;
            }
        });
    }

    /// Enters the firmware update side channel.
    pub fn set_updating(&self) {
        self.mutate(|desc| desc.updating = true);
    }

    /// Reverts to disconnected, clearing the device description.
    pub fn set_disconnected(&self) {
        self.mutate(|desc| *desc = StatusDescription { enabled: desc.enabled, ..Default::default() });
    }

    /// Checks that block operations are currently permitted.
    pub fn check_synchronized(&self) -> Result<()> {
        let desc = self.desc();

        if desc.updating {
            return Err(Error::new(
                ErrorKind::NotSynchronized,
                "firmware update in progress",
            ));
        }
        if !desc.connected {
            return Err(Error::not_connected("controller is not connected"));
        }
        if !desc.synchronized {
            return Err(Error::new(
                ErrorKind::NotSynchronized,
                "service is not synchronized",
            ));
        }
        Ok(())
    }

    fn wait_where(
        &self,
        timeout: Duration,
        what: &str,
        pred: impl Fn(&StatusDescription) -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("state lock poisoned");

        while !pred(&inner.desc) {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::timeout(format!("timed out waiting for {what}")));
            }
            let (next, _) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .expect("state lock poisoned");
            inner = next;
        }

        Ok(())
    }

    /// Blocks until the service wants to connect.
    pub fn wait_enabled(&self, timeout: Duration) -> Result<()> {
        self.wait_where(timeout, "enabled", |desc| desc.enabled)
    }

    /// Blocks until the transport is live.
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        self.wait_where(timeout, "connected", |desc| desc.connected)
    }

    /// Blocks until a handshake was received.
    pub fn wait_acknowledged(&self, timeout: Duration) -> Result<()> {
        self.wait_where(timeout, "acknowledged", |desc| desc.acknowledged)
    }

    /// Blocks until block operations are permitted.
    pub fn wait_synchronized(&self, timeout: Duration) -> Result<()> {
        self.wait_where(timeout, "synchronized", |desc| desc.synchronized)
    }

    /// Blocks until the transport went down.
    pub fn wait_disconnected(&self, timeout: Duration) -> Result<()> {
        self.wait_where(timeout, "disconnected", |desc| !desc.connected)
    }

    /// Gets whether block operations are permitted.
    pub fn is_synchronized(&self) -> bool {
        self.desc().synchronized
    }

    /// Gets whether a handshake was received.
    pub fn is_acknowledged(&self) -> bool {
        self.desc().acknowledged
    }

    /// Gets whether the transport is live.
    pub fn is_connected(&self) -> bool {
        self.desc().connected
    }
}
