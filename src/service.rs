//! Service wiring and task lifecycle.
//!
//! Builds the component graph (no module-level globals; everything is passed
//! explicitly), spawns the long-running tasks, and shuts them down in
//! reverse order. The long-running tasks are: the identity-store flusher,
//! the synchronizer, and the link supervisor. Firmware updates run on a
//! transient task per update.

use std::sync::{mpsc, Arc};
use std::thread;

use crate::codec::Codec;
use crate::command::Commander;
use crate::config::{DiscoveryMode, ServiceConfig};
use crate::link::Link;
use crate::schema::SchemaRegistry;
use crate::state::{ExitReason, StateMachine};
use crate::store::{BlockStore, Datastore, HttpDatastore, SettingsStore, FETCH_TIMEOUT};
use crate::sync::Synchronizer;
use crate::units::UnitConverter;
use crate::ymodem::{self, FileSender};
use crate::{Error, Result};

/// The assembled service: every component plus the exit intent channel.
pub struct Service {
    config: ServiceConfig,
    state: Arc<StateMachine>,
    link: Arc<Link>,
    commander: Arc<Commander>,
    synchronizer: Arc<Synchronizer>,
    block_store: Arc<BlockStore>,
    settings: Arc<SettingsStore>,
    exit_rx: mpsc::Receiver<ExitReason>,
}

impl Service {
    /// Builds the component graph from configuration.
    pub fn build(config: ServiceConfig) -> Result<Self> {
        let datastore: Arc<dyn Datastore> =
            Arc::new(HttpDatastore::new(&config.datastore_url, FETCH_TIMEOUT)?);
        Self::build_with_datastore(config, datastore)
    }

    /// Builds the component graph against an explicit datastore backend.
    pub fn build_with_datastore(
        config: ServiceConfig,
        datastore: Arc<dyn Datastore>,
    ) -> Result<Self> {
        let registry = Arc::new(SchemaRegistry::builtin()?);
        let converter = Arc::new(UnitConverter::new());
        let block_store = Arc::new(BlockStore::new(Arc::clone(&datastore)));
        let codec = Arc::new(Codec::new(
            Arc::clone(&registry),
            Arc::clone(&converter),
            Arc::clone(&block_store),
        ));

        // Simulators are identified by service name, not by device id
        let expected_device_id = if config.simulation {
            None
        } else {
            config.device_id.clone()
        };
        let state = Arc::new(StateMachine::new(
            expected_device_id,
            config.skip_version_check,
        ));
        let settings = Arc::new(SettingsStore::new(Arc::clone(&datastore), &config.name));
        let link = Arc::new(Link::new(
            config.link_config(),
            Arc::clone(&state),
            Arc::clone(&settings),
        ));

        let commander = Arc::new(Commander::new(
            Arc::clone(&link),
            codec,
            Arc::clone(&block_store),
            Arc::clone(&state),
            config.command_timeout(),
        ));
        link.set_handler(Arc::clone(&commander) as Arc<dyn crate::link::LinkHandler>);

        let synchronizer = Arc::new(Synchronizer::new(
            Arc::clone(&state),
            Arc::clone(&commander),
            Arc::clone(&settings),
            converter,
            Arc::clone(&block_store),
            &config.name,
            config.simulation,
        ));

        if config.discovery == DiscoveryMode::Mdns {
            // The built-in discoverer only covers USB; an external mDNS
            // implementation is plugged in through Link::set_discoverer
            log::warn!("mdns discovery is not built in; using USB enumeration");
        }

        let (exit_tx, exit_rx) = mpsc::channel();
        link.set_exit_channel(exit_tx);

        Ok(Self {
            config,
            state,
            link,
            commander,
            synchronizer,
            block_store,
            settings,
            exit_rx,
        })
    }

    /// Gets the connection state machine.
    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    /// Gets the command layer, for API adapters.
    pub fn commander(&self) -> &Arc<Commander> {
        &self.commander
    }

    /// Gets the settings store, for API and messaging adapters.
    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    /// Gets the identity store.
    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.block_store
    }

    /// Transfers a firmware image after putting the controller in update
    /// mode. Runs on the calling (transient) task.
    pub fn flash_firmware(&self, filename: &str, image: &[u8]) -> Result<()> {
        let address = self.state.desc().address;

        self.commander.firmware_update()?;

        let conn = match self.config.device_serial.as_deref() {
            Some(port) => crate::link::connect_serial(port)?,
            None => {
                let host = address
                    .as_deref()
                    .and_then(|addr| addr.split(':').next())
                    .map(str::to_string)
                    .or_else(|| self.config.device_host.clone())
                    .ok_or_else(|| Error::failure("no update endpoint known"))?;
                ymodem::connect(&host, self.config.device_port)?
            }
        };

        FileSender::new(conn).send(filename, image)
    }

    /// Runs the service until a fatal condition raises an exit intent.
    ///
    /// Tasks start in dependency order and stop in reverse, each with a
    /// bounded shutdown: the flusher issues its final bounded write, the
    /// link and synchronizer loops observe their stop flags within one
    /// poll interval.
    pub fn run(self) -> ExitReason {
        let flusher = {
            let store = Arc::clone(&self.block_store);
            thread::Builder::new()
                .name("block-flusher".into())
                .spawn(move || store.run_flusher())
                .expect("spawning the flusher task cannot fail")
        };
        let sync = {
            let synchronizer = Arc::clone(&self.synchronizer);
            thread::Builder::new()
                .name("synchronizer".into())
                .spawn(move || synchronizer.run())
                .expect("spawning the synchronizer task cannot fail")
        };
        let link = {
            let link = Arc::clone(&self.link);
            thread::Builder::new()
                .name("link".into())
                .spawn(move || link.run())
                .expect("spawning the link task cannot fail")
        };

        log::info!("service '{}' is running", self.config.name);
        let reason = match self.exit_rx.recv() {
            Ok(reason) => reason,
            // Every sender dropped; treat as an aborted connection
            Err(_) => ExitReason::ConnectionAborted,
        };
        log::error!("shutting down: {reason}");

        // Reverse order: link first, flusher last so it can still persist
        self.link.close();
        if let Err(err) = link.join() {
            log::warn!("link task panicked: {err:?}");
        }
        self.synchronizer.stop();
        if let Err(err) = sync.join() {
            log::warn!("synchronizer task panicked: {err:?}");
        }
        self.block_store.shutdown();
        if let Err(err) = flusher.join() {
            log::warn!("flusher task panicked: {err:?}");
        }

        reason
    }
}
