//! YMODEM/1K firmware sender.
//!
//! After a firmware update command, the controller hands its stream over to
//! the firmware updater. The sender reconnects to that endpoint, triggers
//! the transfer, and ships the image in 1024-byte STX packets:
//!
//! 1. Write `\n` until the peer emits a `FIRMWARE_UPDATER` annotation.
//!    A controlbox welcome annotation here means the wrong endpoint
//!    answered.
//! 2. Write `F\n` until `READY_FOR_FIRMWARE` appears.
//! 3. Write a single space repeatedly until two ACKs are observed.
//! 4. Send the file header packet, then the data packets (sequence starting
//!    at 1, wrapping at 256), then EOT, then an all-zero closing header.
//!
//! CRC bytes are transmitted as zeros; the receiver does not validate them,
//! but they must be present for framing. A NAK is retried once after a
//! short delay. The controller reboots when the connection closes.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use crate::link::{connect_tcp, Connection};
use crate::parser::FrameParser;
use crate::{Error, ErrorKind, Result};

/// Start of a 128-byte packet (unused by this sender)
pub const SOH: u8 = 0x01;
/// Start of a 1024-byte packet
pub const STX: u8 = 0x02;
/// End of transfer
pub const EOT: u8 = 0x04;
/// Positive acknowledgement
pub const ACK: u8 = 0x06;
/// Negative acknowledgement
pub const NAK: u8 = 0x15;
/// Transfer cancelled by the receiver
pub const CAN: u8 = 0x18;
/// Continue prompt from the receiver, ignored
pub const CONTINUE: u8 = 0x43;

/// Payload bytes per packet.
pub const DATA_LEN: usize = 1024;
/// Full packet length: mark, sequence, negated sequence, data, two CRC bytes.
pub const PACKET_LEN: usize = DATA_LEN + 5;

/// Annotation prefix of the updater handshake.
pub const UPDATER_PREFIX: &str = "FIRMWARE_UPDATER";
/// Annotation signalling YMODEM readiness.
pub const READY_EVENT: &str = "READY_FOR_FIRMWARE";

/// Newline prompts before giving up on the updater handshake.
pub const HANDSHAKE_ATTEMPTS: usize = 20;
/// Transfer-mode prompts before giving up.
pub const READY_ATTEMPTS: usize = 10;
/// Delay before the single retry after a NAK.
pub const NAK_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Budget for one control-byte response.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
/// Delay between TCP connection attempts to the update endpoint.
pub const TCP_CONNECT_INTERVAL: Duration = Duration::from_secs(3);
/// TCP connection attempts before giving up.
pub const CONNECT_ATTEMPTS: usize = 5;

/// Connects to the firmware update endpoint.
///
/// The controller needs a moment to reopen its listener after the update
/// command, so refused connections are retried on an interval.
pub fn connect(host: &str, port: u16) -> Result<Connection> {
    let mut last = None;

    for _ in 0..CONNECT_ATTEMPTS {
        thread::sleep(TCP_CONNECT_INTERVAL);
        match connect_tcp(host, port) {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                log::debug!("update endpoint refused, retrying: {err}");
                last = Some(err);
            }
        }
    }

    Err(last.unwrap_or_else(|| Error::new(ErrorKind::ConnectionReset, "no connection attempts")))
}

/// Sends one firmware image over an established update connection.
pub struct FileSender {
    conn: Connection,
    parser: FrameParser,
    /// Annotations seen so far; phases may consume events that arrived early
    events: Vec<String>,
    bytes: VecDeque<u8>,
}

impl FileSender {
    /// Wraps an update-endpoint connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            parser: FrameParser::new(),
            events: vec![],
            bytes: VecDeque::new(),
        }
    }

    /// Transfers the image. The connection should be closed afterwards;
    /// the controller reboots on its own.
    pub fn send(&mut self, filename: &str, image: &[u8]) -> Result<()> {
        self.trigger_updater()?;
        self.trigger_transfer()?;
        self.await_transfer_active()?;
        self.transfer(filename, image)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.conn.writer.write_all(bytes)?;
        self.conn.writer.flush()?;
        Ok(())
    }

    /// One read; false on timeout, error on EOF.
    fn read_more(&mut self) -> Result<bool> {
        let mut buf = [0u8; 256];
        match self.conn.reader.read(&mut buf) {
            Ok(0) => Err(Error::new(ErrorKind::ConnectionReset, "update endpoint closed")),
            Ok(n) => {
                log::trace!("recv: {:02x?}", &buf[..n]);
                self.parser.push(&String::from_utf8_lossy(&buf[..n]));
                self.events.extend(self.parser.events());
                self.bytes.extend(&buf[..n]);
                Ok(true)
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn find_event(&self, prefix: &str) -> Option<&str> {
        self.events
            .iter()
            .find(|event| event.starts_with(prefix))
            .map(String::as_str)
    }

    /// Writes a prompt, then waits out the window for a matching event.
    fn prompt_for_event(
        &mut self,
        prompt: &[u8],
        prefix: &str,
        attempts: usize,
    ) -> Result<String> {
        for attempt in 0..attempts {
            if attempt > 0 {
                log::debug!("repeating prompt for {prefix}...");
            }
            self.write(prompt)?;

            let deadline = Instant::now() + Duration::from_secs(1);
            loop {
                if self.find_event(crate::WELCOME_PREFIX).is_some() {
                    return Err(Error::new(
                        ErrorKind::ConnectionReset,
                        "connected to the controlbox protocol, not the updater",
                    ));
                }
                if let Some(event) = self.find_event(prefix) {
                    return Ok(event.to_string());
                }
                if Instant::now() >= deadline {
                    break;
                }
                self.read_more()?;
            }
        }

        Err(Error::timeout(format!("no {prefix} event received")))
    }

    /// Prompts until the firmware updater announces itself.
    fn trigger_updater(&mut self) -> Result<()> {
        let handshake = self.prompt_for_event(b"\n", UPDATER_PREFIX, HANDSHAKE_ATTEMPTS)?;
        log::info!("updater handshake received: {handshake}");
        Ok(())
    }

    /// Prompts until the updater is ready to receive the file.
    fn trigger_transfer(&mut self) -> Result<()> {
        self.prompt_for_event(b"F\n", READY_EVENT, READY_ATTEMPTS)?;
        log::info!("updater is ready for firmware");
        Ok(())
    }

    /// Pings with spaces until two ACKs confirm the YMODEM receiver runs.
    fn await_transfer_active(&mut self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut acks = 0;

        while acks < 2 {
            if Instant::now() >= deadline {
                return Err(Error::timeout("YMODEM receiver did not acknowledge"));
            }
            self.write(b" ")?;
            self.read_more()?;
            while let Some(byte) = self.bytes.pop_front() {
                if byte == ACK {
                    acks += 1;
                }
            }
        }

        Ok(())
    }

    fn transfer(&mut self, filename: &str, image: &[u8]) -> Result<()> {
        let packets = image.len().div_ceil(DATA_LEN);
        log::info!("starting file transfer for {filename} ({} bytes)", image.len());

        // File header: null-terminated name, space-terminated size
        let mut header = Vec::with_capacity(filename.len() + 12);
        header.extend_from_slice(filename.as_bytes());
        header.push(0);
        header.extend_from_slice(format!("{} ", image.len()).as_bytes());

        let response = self.send_data(0, &header)?;
        if response != ACK {
            return Err(Error::new(
                ErrorKind::UpdateFailed,
                format!("header rejected with 0x{response:02x}"),
            ));
        }

        for (index, chunk) in image.chunks(DATA_LEN).enumerate() {
            let seq = ((index + 1) & 0xFF) as u8;
            log::debug!("sending packet {} / {packets}", index + 1);

            let response = self.send_data(seq, chunk)?;
            if response != ACK {
                return Err(Error::new(
                    ErrorKind::UpdateFailed,
                    format!("packet {} rejected with 0x{response:02x}", index + 1),
                ));
            }
        }

        log::debug!("sending EOT");
        self.bytes.clear();
        self.write(&[EOT])?;
        if self.read_control()? != ACK {
            return Err(Error::new(ErrorKind::UpdateFailed, "EOT was not acknowledged"));
        }

        log::debug!("sending closing header");
        if let Err(err) = self.send_data(0, &[]) {
            // The controller may reboot before acknowledging
            log::debug!("no response to closing header: {err}");
        }

        log::info!("file transfer done");
        Ok(())
    }

    /// Sends one padded data packet, retrying once after a NAK.
    fn send_data(&mut self, seq: u8, data: &[u8]) -> Result<u8> {
        let mut packet = Vec::with_capacity(PACKET_LEN);
        packet.push(STX);
        packet.push(seq);
        packet.push(0xFF - seq);
        packet.extend_from_slice(data);
        packet.resize(3 + DATA_LEN, 0);
        // CRC bytes are present for framing only
        packet.extend_from_slice(&[0, 0]);
        debug_assert_eq!(packet.len(), PACKET_LEN);

        let mut response = self.send_packet(&packet)?;
        if response == NAK {
            log::debug!("retrying packet {seq}...");
            thread::sleep(NAK_RETRY_DELAY);
            response = self.send_packet(&packet)?;
        }

        Ok(response)
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<u8> {
        self.bytes.clear();
        self.write(packet)?;
        self.read_control()
    }

    /// Awaits the next control byte, skipping continue prompts.
    fn read_control(&mut self) -> Result<u8> {
        let deadline = Instant::now() + CONTROL_TIMEOUT;

        loop {
            while let Some(byte) = self.bytes.pop_front() {
                match byte {
                    CONTINUE => continue,
                    ACK | NAK | CAN => return Ok(byte),
                    other => log::trace!("skipping stray byte 0x{other:02x}"),
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout("no control byte received"));
            }
            self.read_more()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock_pair;
    use std::io::Read;
    use std::thread;

    /// Received packets, as captured by the scripted receiver.
    #[derive(Debug, PartialEq, Eq)]
    enum Frame {
        Packet { seq: u8, neg: u8, data: Vec<u8> },
        Eot,
    }

    /// A receiver double speaking the updater side of the protocol.
    fn receiver(mut conn: crate::link::Connection) -> thread::JoinHandle<Vec<Frame>> {
        thread::spawn(move || {
            let mut frames = vec![];
            let mut buf: Vec<u8> = vec![];
            let mut chunk = [0u8; 2048];
            let mut triggered = false;
            let mut ready = false;
            let mut acks_sent = 0;

            loop {
                match conn.reader.read(&mut chunk) {
                    Ok(0) => return frames,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(_) => return frames,
                }

                loop {
                    if !triggered {
                        if buf.contains(&b'\n') {
                            buf.clear();
                            triggered = true;
                            conn.writer
                                .write_all(b"<!FIRMWARE_UPDATER,brewblox,fw,proto,fd,pd,sys>")
                                .unwrap();
                        }
                        break;
                    }
                    if !ready {
                        if buf.contains(&b'F') {
                            buf.clear();
                            ready = true;
                            conn.writer.write_all(b"<!READY_FOR_FIRMWARE>").unwrap();
                        }
                        break;
                    }
                    if acks_sent < 2 {
                        if buf.first() == Some(&b' ') {
                            buf.remove(0);
                            acks_sent += 1;
                            conn.writer.write_all(&[ACK]).unwrap();
                            continue;
                        }
                        break;
                    }

                    // Transfer phase: drop stray ping bytes, then read framed
                    // packets or a bare EOT
                    while buf.first().is_some_and(|&b| b != STX && b != EOT) {
                        buf.remove(0);
                    }
                    if buf.first() == Some(&EOT) {
                        buf.remove(0);
                        frames.push(Frame::Eot);
                        conn.writer.write_all(&[ACK]).unwrap();
                        continue;
                    }
                    if buf.len() >= PACKET_LEN && buf[0] == STX {
                        let packet: Vec<u8> = buf.drain(..PACKET_LEN).collect();
                        let is_header = packet[1] == 0;
                        frames.push(Frame::Packet {
                            seq: packet[1],
                            neg: packet[2],
                            data: packet[3..3 + DATA_LEN].to_vec(),
                        });
                        conn.writer.write_all(&[ACK]).unwrap();
                        if is_header && frames.len() == 1 {
                            conn.writer.write_all(&[CONTINUE]).unwrap();
                        }
                        continue;
                    }
                    break;
                }
            }
        })
    }

    #[test]
    fn test_three_packet_transfer() {
        let (local, remote) = mock_pair();
        let capture = receiver(remote);

        // 2.5 packets of payload, padded to 3
        let image: Vec<u8> = (0..2560u32).map(|i| (i % 251) as u8).collect();
        let mut sender = FileSender::new(local);
        sender.send("firmware.bin", &image).unwrap();
        drop(sender);

        let frames = capture.join().unwrap();
        assert_eq!(frames.len(), 6);

        // File header: name, NUL, size, space
        match &frames[0] {
            Frame::Packet { seq: 0, neg: 0xFF, data } => {
                assert!(data.starts_with(b"firmware.bin\x002560 "));
            }
            other => panic!("unexpected first frame: {other:?}"),
        }

        // Data packets count up, and the negated sequence always matches
        for (idx, frame) in frames[1..4].iter().enumerate() {
            match frame {
                Frame::Packet { seq, neg, data } => {
                    assert_eq!(*seq, idx as u8 + 1);
                    assert_eq!(*neg, 0xFF - seq);
                    let offset = idx * DATA_LEN;
                    let expected_len = DATA_LEN.min(image.len() - offset);
                    assert_eq!(&data[..expected_len], &image[offset..offset + expected_len]);
                    // Final packet is padded with zeros
                    assert!(data[expected_len..].iter().all(|&b| b == 0));
                }
                other => panic!("unexpected data frame: {other:?}"),
            }
        }

        assert_eq!(frames[4], Frame::Eot);
        match &frames[5] {
            Frame::Packet { seq: 0, data, .. } => {
                assert!(data.iter().all(|&b| b == 0));
            }
            other => panic!("unexpected closing frame: {other:?}"),
        }
    }

    #[test]
    fn test_wrong_endpoint_resets() {
        let (local, mut remote) = mock_pair();

        let responder = thread::spawn(move || {
            let mut buf = [0u8; 64];
            loop {
                match remote.reader.read(&mut buf) {
                    Ok(0) => return,
                    Ok(_) => break,
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(_) => return,
                }
            }
            remote
                .writer
                .write_all(b"<!BREWBLOX,fw,3f2243a9,fd,pd,sys,photon,64,0,abcd>")
                .unwrap();
            // Hold the connection open until the sender notices
            thread::sleep(Duration::from_millis(500));
        });

        let mut sender = FileSender::new(local);
        let err = sender.send("firmware.bin", &[0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);

        responder.join().unwrap();
    }

    #[test]
    fn test_nak_triggers_single_retry() {
        let (local, remote) = mock_pair();

        let responder = thread::spawn(move || {
            let mut conn = remote;
            let mut buf: Vec<u8> = vec![];
            let mut chunk = [0u8; 2048];
            let mut greeted = false;
            let mut packets_seen = 0;

            loop {
                match conn.reader.read(&mut chunk) {
                    Ok(0) => return packets_seen,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(_) => return packets_seen,
                }

                if !greeted {
                    if buf.contains(&b'\n') {
                        buf.clear();
                        greeted = true;
                        conn.writer
                            .write_all(b"<!FIRMWARE_UPDATER,a,b,c,d,e,f>")
                            .unwrap();
                        conn.writer.write_all(b"<!READY_FOR_FIRMWARE>").unwrap();
                        conn.writer.write_all(&[ACK, ACK]).unwrap();
                    }
                    continue;
                }

                while buf.first().is_some_and(|&b| b != STX) {
                    buf.remove(0);
                }
                if buf.len() >= PACKET_LEN {
                    buf.drain(..PACKET_LEN);
                    packets_seen += 1;
                    if packets_seen == 1 {
                        // Reject the header once, accept the retry
                        conn.writer.write_all(&[NAK]).unwrap();
                    } else {
                        conn.writer.write_all(&[ACK]).unwrap();
                        return packets_seen;
                    }
                }
            }
        });

        let mut sender = FileSender::new(local);
        sender.trigger_updater().unwrap();
        sender.trigger_transfer().unwrap();
        sender.await_transfer_active().unwrap();

        let response = sender.send_data(0, b"name\x0016 ").unwrap();
        assert_eq!(response, ACK);
        drop(sender);
        assert_eq!(responder.join().unwrap(), 2);
    }
}
