//! Synchronization between service, controller and datastore.
//!
//! After startup the link and this synchronizer cooperate to advance the
//! state machine. The synchronizer waits for a live transport, prompts the
//! controller until a handshake arrives, validates it, loads the identity
//! store for the acknowledged device, pushes the global settings to the
//! controller, and only then marks the service synchronized. It repeats the
//! cycle after every disconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map};

use crate::command::Commander;
use crate::state::{FirmwareError, IdentityError, StateMachine};
use crate::store::{BlockStore, SettingsStore};
use crate::units::{TempUnit, UnitConverter};
use crate::{sys_nid, BlockIdent, Error, ErrorKind, Result};

/// Total budget for obtaining a handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);
/// Interval between handshake prompts.
pub const PING_INTERVAL: Duration = Duration::from_secs(2);

/// Drives the connected → acknowledged → synchronized transitions.
pub struct Synchronizer {
    state: Arc<StateMachine>,
    commander: Arc<Commander>,
    settings: Arc<SettingsStore>,
    converter: Arc<UnitConverter>,
    block_store: Arc<BlockStore>,
    service_name: String,
    simulation: bool,
    handshake_timeout: Duration,
    stopped: AtomicBool,
}

impl Synchronizer {
    pub fn new(
        state: Arc<StateMachine>,
        commander: Arc<Commander>,
        settings: Arc<SettingsStore>,
        converter: Arc<UnitConverter>,
        block_store: Arc<BlockStore>,
        service_name: &str,
        simulation: bool,
    ) -> Self {
        Self {
            state,
            commander,
            settings,
            converter,
            block_store,
            service_name: service_name.to_string(),
            simulation,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            stopped: AtomicBool::new(false),
        }
    }

    /// Overrides the handshake budget; used by tests.
    #[cfg(test)]
    pub(crate) fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Requests loop shutdown.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Identity-store document key for the acknowledged controller.
    ///
    /// Simulation services are identified by service name, so a simulator
    /// reconfigured to a real controller cannot clobber its data.
    fn device_name(&self) -> Result<String> {
        if self.simulation {
            return Ok(format!("simulator__{}", self.service_name));
        }

        self.state
            .desc()
            .device
            .map(|device| device.device_id)
            .ok_or_else(|| Error::failure("no acknowledged device"))
    }

    /// One-time datastore synchronization at service startup.
    pub fn sync_datastore(self: &Arc<Self>) {
        if let Err(err) = self.settings.fetch_all() {
            log::warn!("could not fetch settings: {err}");
        }
        self.apply_converter_units();
        self.state
            .set_enabled(self.settings.service_settings().enabled);

        let listener = Arc::downgrade(self);
        self.settings.add_global_listener(Box::new(move || {
            if let Some(sync) = listener.upgrade() {
                sync.on_global_settings_change();
            }
        }));
    }

    /// Applies the global temperature preference to the unit converter.
    fn apply_converter_units(&self) {
        let unit = self.settings.temperature();
        self.converter.set_temperature(unit);
        log::info!("service temperature unit set to {unit}");
    }

    /// Callback for global settings change notifications.
    ///
    /// While not synchronized the push is deferred; the next synchronization
    /// cycle writes the current settings anyway.
    pub fn on_global_settings_change(&self) {
        self.apply_converter_units();

        if self.state.is_synchronized() {
            if let Err(err) = self.sync_sysinfo() {
                log::error!("could not push settings to controller: {err}");
            }
        }
    }

    /// Prompts and validates the handshake.
    fn sync_handshake(&self) -> Result<()> {
        let deadline = Instant::now() + self.handshake_timeout;

        while !self.state.is_acknowledged() {
            if self.is_stopped() {
                return Err(Error::cancelled("synchronizer stopped"));
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout("no handshake received"));
            }

            log::info!("prompting handshake...");
            if let Err(err) = self.commander.ping() {
                log::debug!("handshake prompt error: {err}");
            }
            let _ = self.state.wait_acknowledged(PING_INTERVAL);
        }

        let desc = self.state.desc();
        if desc.firmware_error == Some(FirmwareError::Incompatible) {
            return Err(Error::new(
                ErrorKind::IncompatibleFirmware,
                "controller firmware is incompatible with this service",
            ));
        }
        if desc.identity_error == Some(IdentityError::InvalidDeviceId) {
            return Err(Error::new(
                ErrorKind::InvalidDeviceId,
                "controller device id does not match the configured id",
            ));
        }

        Ok(())
    }

    /// Loads the identity store for the acknowledged device.
    fn sync_block_store(&self) -> Result<()> {
        let device_name = self.device_name()?;
        self.block_store.load(&device_name);
        Ok(())
    }

    /// Pushes time zone and temperature unit to the controller.
    ///
    /// This is a patch on the system info block, so unrelated fields are
    /// preserved.
    fn sync_sysinfo(&self) -> Result<()> {
        let timezone = self.settings.timezone_settings();
        let temp_unit = match self.settings.temperature() {
            TempUnit::Fahrenheit => "TEMP_FAHRENHEIT",
            TempUnit::Celsius => "TEMP_CELSIUS",
        };
        log::info!(
            "controller time zone: {} ({}), temp unit: {temp_unit}",
            timezone.posix_value,
            timezone.name,
        );

        let mut changes = Map::new();
        changes.insert("timeZone".into(), json!(timezone.posix_value));
        changes.insert("tempUnit".into(), json!(temp_unit));

        let sysinfo = self
            .commander
            .patch_block_unsynced(&BlockIdent::by_nid(sys_nid::SYSINFO), &changes)?;

        if let Some(uptime) = sysinfo.data.get("uptime").and_then(|q| q.get("value")) {
            log::info!("controller uptime: {uptime} s");
        }
        if let Some(rate) = sysinfo.data.get("updatesPerSecond") {
            log::info!("controller updates per second: {rate}");
        }

        Ok(())
    }

    /// Runs the full synchronization sequence once.
    pub fn synchronize(&self) -> Result<()> {
        self.sync_handshake()?;
        self.sync_block_store()?;
        self.sync_sysinfo()?;
        self.state.set_synchronized();
        log::info!("service synchronized");
        Ok(())
    }

    /// Runs the synchronization loop until [stop](Self::stop).
    pub fn run(self: &Arc<Self>) {
        self.sync_datastore();

        loop {
            if self.is_stopped() {
                return;
            }
            if self.state.wait_connected(Duration::from_secs(1)).is_err() {
                continue;
            }

            match self.synchronize() {
                Ok(()) => (),
                Err(err) if err.kind() == ErrorKind::IncompatibleFirmware => {
                    // Quarantined: stay at acknowledged, do not retry
                    log::error!("incompatible firmware version detected");
                }
                Err(err) if err.kind() == ErrorKind::InvalidDeviceId => {
                    log::error!("invalid device id detected");
                }
                Err(err) if err.kind() == ErrorKind::Cancelled => return,
                Err(err) => {
                    log::error!("failed to synchronize: {err}");
                    self.commander_reconnect();
                }
            }

            // Wait out the rest of this connection
            while self.state.wait_disconnected(Duration::from_secs(1)).is_err() {
                if self.is_stopped() {
                    return;
                }
            }
        }
    }

    fn commander_reconnect(&self) {
        // The link supervisor handles cleanup and backoff
        self.commander.start_link_reconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, DeviceErrorCode, EncodedRequest, EncodedResponse, Opcode, Payload};
    use crate::command::Commander;
    use crate::link::{mock_pair, Link, LinkConfig};
    use crate::schema::SchemaRegistry;
    use crate::state::HandshakeMessage;
    use crate::store::{Datastore, DatastoreValue, MemDatastore};
    use std::io::{BufRead, BufReader, Write};
    use std::thread;

    const WELCOME: &str = "BREWBLOX,fw,3f2243a9,fwd,pd,sys,photon,64,0,abcd1234";

    struct SyncHarness {
        sync: Arc<Synchronizer>,
        state: Arc<StateMachine>,
        link: Arc<Link>,
        settings: Arc<SettingsStore>,
        datastore: Arc<MemDatastore>,
        server: thread::JoinHandle<Result<()>>,
        controller: thread::JoinHandle<()>,
    }

    struct ReadAdapter(Box<dyn std::io::Read + Send>);

    impl std::io::Read for ReadAdapter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            loop {
                match self.0.read(buf) {
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                    other => return other,
                }
            }
        }
    }

    /// A controller double that answers pings with a handshake annotation
    /// and block requests with a SysInfo payload.
    fn sync_harness(handshake: &'static str, timeout: Duration) -> SyncHarness {
        let registry = Arc::new(SchemaRegistry::builtin().unwrap());
        let converter = Arc::new(UnitConverter::new());
        let datastore = Arc::new(MemDatastore::new());
        let store = Arc::new(BlockStore::new(datastore.clone()));
        let codec = Arc::new(Codec::new(registry.clone(), converter.clone(), store.clone()));
        let state = Arc::new(StateMachine::new(None, false));
        let settings = Arc::new(SettingsStore::new(datastore.clone(), "test"));
        let link = Arc::new(Link::new(LinkConfig::default(), state.clone(), settings.clone()));

        let commander = Arc::new(Commander::new(
            link.clone(),
            codec,
            store.clone(),
            state.clone(),
            Duration::from_millis(400),
        ));
        link.set_handler(commander.clone());

        let sync = Arc::new(
            Synchronizer::new(
                state.clone(),
                commander,
                settings.clone(),
                converter,
                store,
                "test",
                false,
            )
            .with_handshake_timeout(timeout),
        );

        let (local, remote) = mock_pair();
        let server = {
            let link = Arc::clone(&link);
            thread::spawn(move || link.serve(local))
        };

        let controller_codec = Codec::new(
            registry,
            Arc::new(UnitConverter::new()),
            Arc::new(BlockStore::new(Arc::new(MemDatastore::new()))),
        );
        let controller = thread::spawn(move || {
            let crate::link::Connection {
                reader, mut writer, ..
            } = remote;
            let mut lines = BufReader::new(ReadAdapter(reader)).lines();
            while let Some(Ok(line)) = lines.next() {
                let request = match EncodedRequest::from_line(&line) {
                    Ok(request) => request,
                    Err(_) => continue,
                };
                let out = match request.opcode {
                    Opcode::None => {
                        // A ping always gets an empty response; the welcome
                        // annotation travels separately on the same stream
                        let response =
                            EncodedResponse::new(request.msg_id, DeviceErrorCode::Ok, vec![]);
                        if handshake.is_empty() {
                            format!("{}\n", response.to_line())
                        } else {
                            format!("<!{handshake}>{}\n", response.to_line())
                        }
                    }
                    Opcode::ReadObject | Opcode::WriteObject => {
                        let data = request
                            .payload
                            .as_ref()
                            .filter(|p| !p.data.is_empty())
                            .map(|p| p.data.clone())
                            .unwrap_or_else(|| {
                                controller_codec
                                    .encode_block("SysInfo", &serde_json::Map::new())
                                    .unwrap()
                                    .data
                            });
                        let response = EncodedResponse::new(
                            request.msg_id,
                            DeviceErrorCode::Ok,
                            vec![Payload {
                                block_id: sys_nid::SYSINFO,
                                objtype: 256,
                                subtype: 0,
                                data,
                            }],
                        );
                        format!("{}\n", response.to_line())
                    }
                    _ => continue,
                };
                if writer.write_all(out.as_bytes()).is_err() {
                    return;
                }
            }
        });

        while !link.is_connected() {
            thread::sleep(Duration::from_millis(5));
        }

        SyncHarness {
            sync,
            state,
            link,
            settings,
            datastore,
            server,
            controller,
        }
    }

    impl SyncHarness {
        fn shutdown(self) {
            self.sync.stop();
            self.link.close();
            let _ = self.server.join();
            let _ = self.controller.join();
        }
    }

    #[test]
    fn test_synchronize_happy_path() {
        let harness = sync_harness(WELCOME, Duration::from_secs(5));

        harness.sync.synchronize().unwrap();

        assert!(harness.state.is_synchronized());
        let desc = harness.state.desc();
        assert_eq!(desc.device.unwrap().device_id, "abcd1234");

        harness.shutdown();
    }

    #[test]
    fn test_handshake_timeout_leaves_connected_unacknowledged() {
        // The controller double never sends a welcome
        let harness = sync_harness("", Duration::from_millis(700));

        let err = harness.sync.synchronize().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(harness.state.is_connected());
        assert!(!harness.state.is_acknowledged());

        harness.shutdown();
    }

    #[test]
    fn test_incompatible_firmware_blocks_synchronization() {
        let harness = sync_harness(
            "BREWBLOX,fw,00000000,fwd,pd,sys,photon,64,0,abcd1234",
            Duration::from_secs(5),
        );

        let err = harness.sync.synchronize().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleFirmware);

        // Acknowledged, but never synchronized
        assert!(harness.state.is_acknowledged());
        assert!(!harness.state.is_synchronized());
        let wait = harness.state.wait_synchronized(Duration::from_millis(100));
        assert_eq!(wait.unwrap_err().kind(), ErrorKind::Timeout);

        harness.shutdown();
    }

    #[test]
    fn test_sysinfo_patch_reaches_controller() {
        let harness = sync_harness(WELCOME, Duration::from_secs(5));

        let mut doc = DatastoreValue::new(crate::GLOBAL_NAMESPACE, crate::GLOBAL_UNITS_ID);
        doc.content
            .insert("temperature".into(), serde_json::json!("degF"));
        harness.datastore.set(&doc).unwrap();
        harness.settings.fetch_all().unwrap();

        harness.sync.synchronize().unwrap();
        assert_eq!(harness.settings.temperature(), TempUnit::Fahrenheit);

        harness.shutdown();
    }

    #[test]
    fn test_device_name_for_simulation() {
        let datastore = Arc::new(MemDatastore::new());
        let store = Arc::new(BlockStore::new(datastore.clone()));
        let registry = Arc::new(SchemaRegistry::builtin().unwrap());
        let converter = Arc::new(UnitConverter::new());
        let codec = Arc::new(Codec::new(registry, converter.clone(), store.clone()));
        let state = Arc::new(StateMachine::new(None, false));
        let settings = Arc::new(SettingsStore::new(datastore, "my-sim"));
        let link = Arc::new(Link::new(LinkConfig::default(), state.clone(), settings.clone()));
        let commander = Arc::new(Commander::new(
            link,
            codec,
            store.clone(),
            state.clone(),
            Duration::from_millis(100),
        ));

        let simulated = Synchronizer::new(
            state.clone(),
            commander.clone(),
            settings.clone(),
            converter.clone(),
            store.clone(),
            "my-sim",
            true,
        );
        assert_eq!(simulated.device_name().unwrap(), "simulator__my-sim");

        // Without simulation, the handshake device id is used
        state.set_connected("mock://");
        state.set_acknowledged(&HandshakeMessage::parse(WELCOME).unwrap());
        let hardware = Synchronizer::new(
            state.clone(),
            commander,
            settings,
            converter,
            store,
            "my-sim",
            false,
        );
        assert_eq!(hardware.device_name().unwrap(), "abcd1234");
    }
}
