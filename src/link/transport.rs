//! Byte-level transports behind the link.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::time::Duration;

use crate::{Error, Result};

/// Baud rate of the controller's USB serial port.
pub const DEFAULT_BAUD_RATE: u32 = 57600;
/// Poll interval of blocking reads; the reader checks its stop flag this often.
pub const READ_TIMEOUT: Duration = Duration::from_millis(250);
/// Budget for establishing a TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An open byte stream to the controller, split into its two directions.
pub struct Connection {
    pub address: String,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Opens a TCP connection, as used for networked controllers and simulators.
pub fn connect_tcp(host: &str, port: u16) -> Result<Connection> {
    let address = format!("{host}:{port}");
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::failure(format!("could not resolve {address}")))?;

    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_nodelay(true)?;

    let reader = stream.try_clone()?;
    Ok(Connection {
        address,
        reader: Box::new(reader),
        writer: Box::new(stream),
    })
}

/// Opens a local serial device.
pub fn connect_serial(port_name: &str) -> Result<Connection> {
    let port = serialport::new(port_name, DEFAULT_BAUD_RATE)
        .timeout(READ_TIMEOUT)
        .open()?;
    let reader = port.try_clone()?;

    Ok(Connection {
        address: port_name.to_string(),
        reader: Box::new(reader),
        writer: Box::new(port),
    })
}

struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(READ_TIMEOUT) {
                Ok(bytes) => self.pending = bytes,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::from(io::ErrorKind::TimedOut))
                }
                // Peer dropped: EOF
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        let len = buf.len().min(self.pending.len());
        buf[..len].copy_from_slice(&self.pending[..len]);
        self.pending.drain(..len);
        Ok(len)
    }
}

struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Creates an in-memory duplex pair: the link-side connection and the
/// "controller"-side connection tests and the mock transport drive.
pub fn mock_pair() -> (Connection, Connection) {
    let (to_remote_tx, to_remote_rx) = mpsc::channel();
    let (to_local_tx, to_local_rx) = mpsc::channel();

    let local = Connection {
        address: "mock://local".into(),
        reader: Box::new(ChannelReader {
            rx: to_local_rx,
            pending: vec![],
        }),
        writer: Box::new(ChannelWriter { tx: to_remote_tx }),
    };
    let remote = Connection {
        address: "mock://remote".into(),
        reader: Box::new(ChannelReader {
            rx: to_remote_rx,
            pending: vec![],
        }),
        writer: Box::new(ChannelWriter { tx: to_local_tx }),
    };

    (local, remote)
}
