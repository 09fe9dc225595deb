//! Transport ownership and the connection supervisor.
//!
//! The link owns the byte-level transport, feeds inbound bytes through the
//! frame parser, classifies controller events for the state machine, and
//! serializes outbound writes. A supervisor loop reconnects with exponential
//! backoff; exhausting the attempt budget terminates the process with an
//! exit intent so an external supervisor can restart it.

mod discovery;
mod transport;

use std::io::Read;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::parser::FrameParser;
use crate::state::{ControllerEvent, ExitReason, StateMachine};
use crate::store::SettingsStore;
use crate::{Error, ErrorKind, Result};

pub use discovery::{DiscoveredDevice, Discoverer, UsbDiscoverer, KNOWN_USB_DEVICES};
pub use transport::{
    connect_serial, connect_tcp, mock_pair, Connection, DEFAULT_BAUD_RATE, READ_TIMEOUT,
};

/// Initial reconnect backoff.
pub const BASE_RETRY_INTERVAL: Duration = Duration::from_secs(2);
/// Backoff ceiling.
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(30);
/// Connect attempts before the process surrenders.
pub const CONNECT_RETRY_COUNT: u32 = 20;

/// Callbacks wired to the command layer
pub trait LinkHandler: Send + Sync {
    /// A complete data line arrived.
    fn on_response(&self, line: String);
    /// The transport went down; outstanding requests must fail.
    fn on_disconnect(&self);
}

/// Transport-relevant configuration subset
#[derive(Clone, Debug, Default)]
pub struct LinkConfig {
    pub name: String,
    pub simulation: bool,
    pub mock: bool,
    pub device_host: Option<String>,
    pub device_port: u16,
    pub device_serial: Option<String>,
    pub device_id: Option<String>,
}

/// Interruptible sleep shared by the supervisor loop.
#[derive(Default)]
struct Stopper {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl Stopper {
    fn stop(&self) {
        *self.stopped.lock().expect("stop lock poisoned") = true;
        self.cond.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock().expect("stop lock poisoned")
    }

    /// Sleeps for the given duration; returns true when stopped.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock().expect("stop lock poisoned");
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .cond
                .wait_timeout(stopped, deadline - now)
                .expect("stop lock poisoned");
            stopped = next;
        }
        true
    }
}

/// Owns the controller transport and its reconnect lifecycle.
pub struct Link {
    config: LinkConfig,
    state: Arc<StateMachine>,
    settings: Arc<SettingsStore>,
    handler: RwLock<Option<Arc<dyn LinkHandler>>>,
    discoverer: RwLock<Arc<dyn Discoverer>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    connected: AtomicBool,
    reset_requested: AtomicBool,
    stopper: Stopper,
    exit_tx: Mutex<Option<mpsc::Sender<ExitReason>>>,
    // Keeps the far end of the mock transport alive
    mock_remote: Mutex<Option<Connection>>,
}

impl Link {
    /// Creates a link; no connection is attempted until [run](Self::run).
    pub fn new(config: LinkConfig, state: Arc<StateMachine>, settings: Arc<SettingsStore>) -> Self {
        Self {
            config,
            state,
            settings,
            handler: RwLock::new(None),
            discoverer: RwLock::new(Arc::new(UsbDiscoverer::new())),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            stopper: Stopper::default(),
            exit_tx: Mutex::new(None),
            mock_remote: Mutex::new(None),
        }
    }

    /// Wires the command layer callbacks.
    pub fn set_handler(&self, handler: Arc<dyn LinkHandler>) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    /// Replaces the discovery collaborator (e.g. with an mDNS implementation).
    pub fn set_discoverer(&self, discoverer: Arc<dyn Discoverer>) {
        *self.discoverer.write().expect("discoverer lock poisoned") = discoverer;
    }

    /// Wires the process exit intent channel.
    pub fn set_exit_channel(&self, tx: mpsc::Sender<ExitReason>) {
        *self.exit_tx.lock().expect("exit lock poisoned") = Some(tx);
    }

    /// Gets whether the transport is live.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Writes one line, appending the newline the controller expects.
    ///
    /// Concurrent writers are serialized on the transport lock.
    pub fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        let writer = writer
            .as_mut()
            .ok_or_else(|| Error::not_connected("link is not connected"))?;

        log::debug!("writing: {line}");
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Flushes buffered outbound bytes.
    pub fn drain(&self) -> Result<()> {
        if let Some(writer) = self
            .writer
            .lock()
            .expect("writer lock poisoned")
            .as_mut()
        {
            writer.flush()?;
        }
        Ok(())
    }

    /// Tears down the current connection; the supervisor will reconnect.
    pub fn start_reconnect(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Stops the supervisor and closes the connection.
    pub fn close(&self) {
        self.stopper.stop();
        self.reset_requested.store(true, Ordering::SeqCst);
        *self.mock_remote.lock().expect("mock lock poisoned") = None;
    }

    fn stopped(&self) -> bool {
        self.stopper.is_stopped()
    }

    fn request_exit(&self, reason: ExitReason) {
        log::error!("{reason}; exiting");
        self.stopper.stop();
        if let Some(tx) = self.exit_tx.lock().expect("exit lock poisoned").as_ref() {
            let _ = tx.send(reason);
        }
    }

    fn retry_interval(&self) -> Duration {
        self.settings
            .service_settings()
            .retry_interval_secs
            .map(Duration::from_secs_f64)
            .unwrap_or(BASE_RETRY_INTERVAL)
    }

    fn store_retry_interval(&self, interval: Duration) {
        let mut settings = self.settings.service_settings();
        settings.retry_interval_secs = Some(interval.as_secs_f64());
        if let Err(err) = self.settings.commit_service_settings(settings) {
            log::debug!("could not persist retry interval: {err}");
        }
    }

    fn reset_retry_interval(&self) {
        self.store_retry_interval(BASE_RETRY_INTERVAL);
    }

    fn increase_retry_interval(&self) {
        let current = self.retry_interval();
        let next = Duration::from_secs_f64((current.as_secs_f64() * 1.5).round());
        self.store_retry_interval(next.min(MAX_RETRY_INTERVAL).max(BASE_RETRY_INTERVAL));
    }

    /// Opens a transport per the configured selection order:
    /// simulation, TCP host, serial device, discovery.
    fn connect(&self) -> Result<Connection> {
        if self.config.mock {
            let (local, remote) = mock_pair();
            *self.mock_remote.lock().expect("mock lock poisoned") = Some(remote);
            return Ok(local);
        }
        if self.config.simulation {
            let host = self.config.device_host.as_deref().unwrap_or("localhost");
            return connect_tcp(host, self.config.device_port);
        }
        if let Some(host) = self.config.device_host.as_deref() {
            return connect_tcp(host, self.config.device_port);
        }
        if let Some(port) = self.config.device_serial.as_deref() {
            return connect_serial(port);
        }

        let discoverer = Arc::clone(&self.discoverer.read().expect("discoverer lock poisoned"));
        match discoverer.discover(self.config.device_id.as_deref())? {
            DiscoveredDevice::Serial(port) => connect_serial(&port),
            DiscoveredDevice::Tcp(host, port) => connect_tcp(&host, port),
        }
    }

    /// Serves one established connection until it fails or is torn down.
    ///
    /// Returns `Ok` only for a clean stop; any transport failure is an error
    /// so the supervisor backs off before reconnecting.
    pub(crate) fn serve(&self, conn: Connection) -> Result<()> {
        let Connection {
            address,
            mut reader,
            writer,
        } = conn;

        *self.writer.lock().expect("writer lock poisoned") = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        self.reset_requested.store(false, Ordering::SeqCst);
        self.state.set_connected(&address);

        let result = self.read_loop(&mut *reader);

        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock().expect("writer lock poisoned") = None;
        self.state.set_disconnected();
        if let Some(handler) = self.handler.read().expect("handler lock poisoned").as_ref() {
            handler.on_disconnect();
        }
        log::info!("closed connection to {address}");

        result
    }

    fn read_loop(&self, reader: &mut (dyn Read + Send)) -> Result<()> {
        let mut parser = FrameParser::new();
        let mut buf = [0u8; 256];

        loop {
            if self.stopped() {
                return Ok(());
            }
            if self.reset_requested.swap(false, Ordering::SeqCst) {
                return Err(Error::new(
                    ErrorKind::ConnectionReset,
                    "reconnect requested",
                ));
            }

            match reader.read(&mut buf) {
                Ok(0) => return Err(Error::new(ErrorKind::ConnectionReset, "EOF received")),
                Ok(n) => {
                    parser.push(&String::from_utf8_lossy(&buf[..n]));
                    for event in parser.events().collect::<Vec<_>>() {
                        self.handle_event(&event)?;
                    }
                    if let Some(handler) =
                        self.handler.read().expect("handler lock poisoned").as_ref()
                    {
                        for line in parser.data() {
                            handler.on_response(line);
                        }
                    }
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::TimedOut
                        || err.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn handle_event(&self, body: &str) -> Result<()> {
        match ControllerEvent::classify(body) {
            ControllerEvent::Welcome(msg) => {
                log::info!("handshake received: {msg}");
                self.state.set_acknowledged(&msg);
            }
            ControllerEvent::CboxError(code) => {
                log::error!("controlbox error: {code}");
            }
            ControllerEvent::SetupMode => {
                self.request_exit(ExitReason::SetupMode);
                return Err(Error::new(
                    ErrorKind::ConnectionReset,
                    "controller entered listening mode",
                ));
            }
            ControllerEvent::Other(body) => {
                log::info!("controller event: {body}");
            }
        }
        Ok(())
    }

    /// Runs the connection supervisor until [close](Self::close).
    pub fn run(&self) {
        let mut retry_count: u32 = 0;

        loop {
            if self.stopped() {
                return;
            }
            if retry_count >= CONNECT_RETRY_COUNT {
                self.increase_retry_interval();
                self.request_exit(ExitReason::ConnectionAborted);
                return;
            }
            if retry_count == 1 {
                log::info!("retrying connection...");
            }
            if retry_count > 0 && self.stopper.sleep(self.retry_interval()) {
                return;
            }

            while self.state.wait_enabled(Duration::from_secs(1)).is_err() {
                if self.stopped() {
                    return;
                }
            }

            match self.connect() {
                Ok(conn) => {
                    retry_count = 0;
                    self.reset_retry_interval();
                    if let Err(err) = self.serve(conn) {
                        log::warn!("connection closed: {err}");
                        retry_count += 1;
                        self.increase_retry_interval();
                    }
                }
                Err(err) => {
                    if err.kind() == ErrorKind::DiscoveryAborted {
                        log::error!("device discovery failed: {err}");
                    } else {
                        log::warn!("connect failed: {err}");
                    }
                    retry_count += 1;
                    self.increase_retry_interval();
                }
            }
        }
    }
}
