//! Service configuration surface.
//!
//! Every option is available as a command line flag and an environment
//! variable with the `BREWLINK_` prefix. Unknown flags are warned about and
//! ignored, so a fleet-wide supervisor can pass newer options to older
//! service versions.

use std::fmt;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::link::LinkConfig;

/// Discovery strategies for unconfigured devices
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum DiscoveryMode {
    /// Try every discovery mechanism
    #[default]
    All,
    /// Only USB serial enumeration
    Usb,
    /// Only network (mDNS) discovery
    Mdns,
}

impl fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Usb => write!(f, "usb"),
            Self::Mdns => write!(f, "mdns"),
        }
    }
}

/// Parsed service configuration
#[derive(Clone, Debug, Parser)]
#[command(name = "brewlinkd", about = "Brewing controller gateway service")]
pub struct ServiceConfig {
    /// Service name; doubles as the service settings document id
    #[arg(long, env = "BREWLINK_NAME", default_value = "spark")]
    pub name: String,

    /// Enable debug logging
    #[arg(long, env = "BREWLINK_DEBUG")]
    pub debug: bool,

    /// Connect to a simulator instead of a controller
    #[arg(long, env = "BREWLINK_SIMULATION")]
    pub simulation: bool,

    /// Use the in-process mock transport (test only)
    #[arg(long, env = "BREWLINK_MOCK")]
    pub mock: bool,

    /// Controller hostname or address for TCP connections
    #[arg(long, env = "BREWLINK_DEVICE_HOST")]
    pub device_host: Option<String>,

    /// Controller TCP port
    #[arg(long, env = "BREWLINK_DEVICE_PORT", default_value_t = 8332)]
    pub device_port: u16,

    /// Serial device path, e.g. /dev/ttyACM0
    #[arg(long, env = "BREWLINK_DEVICE_SERIAL")]
    pub device_serial: Option<String>,

    /// Expected controller device id; mismatches quarantine the controller
    #[arg(long, env = "BREWLINK_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Discovery strategy when no address is configured
    #[arg(long, env = "BREWLINK_DISCOVERY", value_enum, default_value_t)]
    pub discovery: DiscoveryMode,

    /// Response timeout for controller commands, in seconds
    #[arg(long, env = "BREWLINK_COMMAND_TIMEOUT", default_value_t = 5.0)]
    pub command_timeout: f64,

    /// Interval between state broadcasts, in seconds
    #[arg(long, env = "BREWLINK_BROADCAST_INTERVAL", default_value_t = 5.0)]
    pub broadcast_interval: f64,

    /// Accept controllers with a mismatched protocol version
    #[arg(long, env = "BREWLINK_SKIP_VERSION_CHECK")]
    pub skip_version_check: bool,

    /// Interval between block backups, in seconds
    #[arg(long, env = "BREWLINK_BACKUP_INTERVAL", default_value_t = 3600.0)]
    pub backup_interval: f64,

    /// Retry interval after a failed backup, in seconds
    #[arg(long, env = "BREWLINK_BACKUP_RETRY_INTERVAL", default_value_t = 300.0)]
    pub backup_retry_interval: f64,

    /// Interval between controller time synchronizations, in seconds
    #[arg(long, env = "BREWLINK_TIME_SYNC_INTERVAL", default_value_t = 900.0)]
    pub time_sync_interval: f64,

    /// Protocol used by the messaging adapter
    #[arg(long, env = "BREWLINK_MQTT_PROTOCOL", default_value = "mqtt")]
    pub mqtt_protocol: String,

    /// Hostname of the message broker
    #[arg(long, env = "BREWLINK_MQTT_HOST", default_value = "eventbus")]
    pub mqtt_host: String,

    /// Port of the message broker
    #[arg(long, env = "BREWLINK_MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Topic for history data
    #[arg(long, env = "BREWLINK_HISTORY_TOPIC", default_value = "brewcast/history")]
    pub history_topic: String,

    /// Topic prefix for datastore change notifications
    #[arg(long, env = "BREWLINK_DATASTORE_TOPIC", default_value = "brewcast/datastore")]
    pub datastore_topic: String,

    /// Topic for service state publications
    #[arg(long, env = "BREWLINK_STATE_TOPIC", default_value = "brewcast/state")]
    pub state_topic: String,

    /// Base url of the datastore service
    #[arg(
        long,
        env = "BREWLINK_DATASTORE_URL",
        default_value = "http://history:5000/history/datastore"
    )]
    pub datastore_url: String,
}

/// Long flags accepted by this version.
const KNOWN_FLAGS: [&str; 22] = [
    "name",
    "datastore-url",
    "debug",
    "simulation",
    "mock",
    "device-host",
    "device-port",
    "device-serial",
    "device-id",
    "discovery",
    "command-timeout",
    "broadcast-interval",
    "skip-version-check",
    "backup-interval",
    "backup-retry-interval",
    "time-sync-interval",
    "mqtt-protocol",
    "mqtt-host",
    "mqtt-port",
    "history-topic",
    "datastore-topic",
    "state-topic",
];

/// Drops unknown long flags (and their values) with a warning.
fn sanitize_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut kept = vec![];
    let mut args = args.into_iter().map(Into::into).peekable();

    if let Some(program) = args.next() {
        kept.push(program);
    }

    while let Some(arg) = args.next() {
        let Some(name) = arg.strip_prefix("--") else {
            kept.push(arg);
            continue;
        };
        let name = name.split('=').next().unwrap_or_default();

        let known = name == "help"
            || name == "version"
            || KNOWN_FLAGS.contains(&name);
        if known {
            kept.push(arg);
            continue;
        }

        log::warn!("ignoring unknown flag --{name}");
        // Swallow a separate value token as well
        let takes_value = !arg.contains('=');
        if takes_value {
            if let Some(next) = args.peek() {
                if !next.starts_with("--") {
                    args.next();
                }
            }
        }
    }

    kept
}

impl ServiceConfig {
    /// Parses process arguments, ignoring unknown flags.
    pub fn from_args() -> Self {
        Self::parse_from(sanitize_args(std::env::args()))
    }

    /// Parses the given arguments, ignoring unknown flags.
    pub fn from_iter<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::parse_from(sanitize_args(args))
    }

    /// Gets the command response timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout)
    }

    /// Gets the transport-relevant configuration subset.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            name: self.name.clone(),
            simulation: self.simulation,
            mock: self.mock,
            device_host: self.device_host.clone(),
            device_port: self.device_port,
            device_serial: self.device_serial.clone(),
            device_id: self.device_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_iter(["brewlinkd"]);

        assert_eq!(config.name, "spark");
        assert!(!config.debug);
        assert_eq!(config.device_port, 8332);
        assert_eq!(config.discovery, DiscoveryMode::All);
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.datastore_topic, "brewcast/datastore");
    }

    #[test]
    fn test_explicit_values() {
        let config = ServiceConfig::from_iter([
            "brewlinkd",
            "--name=fridge",
            "--device-host",
            "192.168.0.10",
            "--command-timeout=2.5",
            "--skip-version-check",
            "--discovery=usb",
        ]);

        assert_eq!(config.name, "fridge");
        assert_eq!(config.device_host.as_deref(), Some("192.168.0.10"));
        assert_eq!(config.command_timeout(), Duration::from_millis(2500));
        assert!(config.skip_version_check);
        assert_eq!(config.discovery, DiscoveryMode::Usb);
    }

    #[test]
    fn test_unknown_flags_are_ignored() {
        let config = ServiceConfig::from_iter([
            "brewlinkd",
            "--future-feature=9000",
            "--name=fridge",
            "--other-unknown",
            "value",
            "--debug",
        ]);

        assert_eq!(config.name, "fridge");
        assert!(config.debug);
    }

    #[test]
    fn test_link_config_subset() {
        let config = ServiceConfig::from_iter(["brewlinkd", "--simulation", "--name=sim"]);
        let link = config.link_config();

        assert!(link.simulation);
        assert_eq!(link.name, "sim");
        assert_eq!(link.device_port, 8332);
    }
}
