//! GSIOC transport channel.
//!
//! GSIOC is a half-duplex, master/slave protocol over RS-232. One device at a time
//! is addressed; the host then sends either an immediate command (a single byte,
//! answered byte by byte with the host acknowledging each one) or a buffered
//! command (echoed byte by byte and terminated with `\r`).
//!
//! # Wire Protocol
//!
//! ```text
//! connect:    host 0xFF, (settle), host id|0x80, device <any byte>, (settle, drain)
//! immediate:  host c, device b0, host ACK, device b1, host ACK, ..., device bn|0x80
//!             device '#' -> command not recognized
//! buffered:   host '\n', device ... '\n'
//!             host c0, device c0 ('#' -> busy, resend c0), ..., host '\r', device '\r'
//! ```
//!
//! Every exchange is strictly request/response; nothing is pipelined.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, trace, warn};

use lh_core::error::{LhResult, LiquidHandlerError};
use lh_core::serial::{drain_serial_buffer, DynSerial};
use lh_core::settings::GsiocTiming;

use crate::codex::{BufferedCommand, ImmediateCommand};

/// Disconnects every device on the bus.
pub const DISCONNECT_ALL: u8 = 0xFF;
/// Host acknowledgement of an immediate-response byte.
pub const ACK: u8 = 0x06;
/// Device reply to an unknown immediate command, or to a buffered byte it cannot
/// accept yet.
pub const NOT_RECOGNIZED: u8 = b'#';
/// Number of device ids on a GSIOC bus.
pub const MAX_DEVICE_ID: u8 = 64;

const MAX_DRAIN_BYTES: usize = 16;
const ERROR_TAIL_BYTES: usize = 4;

/// Half-duplex GSIOC channel over one serial port.
pub struct GsiocChannel {
    port: DynSerial,
    timing: GsiocTiming,
    connected: Option<u8>,
}

impl std::fmt::Debug for GsiocChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GsiocChannel")
            .field("timing", &self.timing)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl GsiocChannel {
    /// Wrap an open port.
    pub fn new(port: DynSerial, timing: GsiocTiming) -> Self {
        Self {
            port,
            timing,
            connected: None,
        }
    }

    /// Open a serial port with GSIOC line settings.
    #[cfg(feature = "serial")]
    pub async fn open(port_path: &str, baud_rate: u32, timing: GsiocTiming) -> LhResult<Self> {
        let port = lh_core::serial::open_gsioc_port(port_path, baud_rate).await?;
        Ok(Self::new(Box::new(port), timing))
    }

    /// Device addressed by the last successful [`connect`](Self::connect).
    pub fn connected_device(&self) -> Option<u8> {
        self.connected
    }

    /// Timing in use.
    pub fn timing(&self) -> &GsiocTiming {
        &self.timing
    }

    /// Address device `id`, disconnecting every other device first.
    ///
    /// # Errors
    ///
    /// - [`LiquidHandlerError::InvalidParameter`] if `id` is 64 or above
    /// - [`LiquidHandlerError::Connection`] if the device does not answer
    #[instrument(skip(self), fields(device = id), err)]
    pub async fn connect(&mut self, id: u8) -> LhResult<()> {
        if id >= MAX_DEVICE_ID {
            return Err(LiquidHandlerError::invalid(format!(
                "GSIOC device id {id} outside 0..{MAX_DEVICE_ID}"
            )));
        }

        self.connected = None;
        self.write_byte(DISCONNECT_ALL).await?;
        sleep_if_nonzero(self.timing.disconnect_settle).await;

        self.write_byte(id + 0x80).await?;
        let Some(answer) = self.read_byte().await? else {
            return Err(LiquidHandlerError::connection(format!(
                "could not connect to device {id}"
            )));
        };
        trace!(answer, "Device answered address");

        sleep_if_nonzero(self.timing.connect_settle).await;
        let stale = drain_serial_buffer(&mut self.port, MAX_DRAIN_BYTES, self.timing.connect_settle)
            .await;
        if stale > 0 {
            debug!(stale, "Discarded stale bytes after connect");
        }

        self.connected = Some(id);
        Ok(())
    }

    /// Send an immediate command to the connected device and collect its answer.
    ///
    /// An unknown command is not an error: the device answers `#` and this returns
    /// a descriptive `"Command <c> not recognized"` string.
    #[instrument(skip(self, command), fields(device = ?self.connected, command = %char::from(command.command_byte())), err)]
    pub async fn immediate_command<C: ImmediateCommand + ?Sized>(
        &mut self,
        command: &C,
    ) -> LhResult<String> {
        let byte = command.command_byte();
        if !byte.is_ascii() {
            return Err(LiquidHandlerError::invalid(format!(
                "immediate command byte {byte:#04x} is not ASCII"
            )));
        }

        sleep_if_nonzero(self.timing.immediate_delay).await;
        self.write_byte(byte).await?;

        let mut response = Vec::new();
        loop {
            let Some(b) = self.read_byte().await? else {
                return Err(LiquidHandlerError::connection(format!(
                    "no response to immediate command '{}'",
                    char::from(byte)
                )));
            };
            if b == NOT_RECOGNIZED {
                let message = format!("Command {} not recognized", char::from(byte));
                warn!("{}", message);
                return Ok(message);
            }
            if b < 0x80 {
                response.push(b);
                self.write_byte(ACK).await?;
            } else {
                response.push(b - 0x80);
                break;
            }
        }

        let text = String::from_utf8_lossy(&response).into_owned();
        debug!(response = %text, "Immediate response");
        Ok(text)
    }

    /// Send a buffered command to the connected device.
    ///
    /// The whole exchange (every byte plus the terminator) must finish within
    /// `per_byte_budget * (len + 1)`. A `#` echo means the device is busy; the same
    /// byte is resent until it is echoed or the budget runs out, which fails with
    /// [`LiquidHandlerError::Connection`].
    #[instrument(skip(self, command), fields(device = ?self.connected, command = %command.command_string()), err)]
    pub async fn buffered_command<C: BufferedCommand + ?Sized>(
        &mut self,
        command: &C,
    ) -> LhResult<()> {
        let text = command.command_string();
        if !text.is_ascii() {
            return Err(LiquidHandlerError::invalid(format!(
                "buffered command {text:?} is not ASCII"
            )));
        }
        let mut bytes = text.clone().into_bytes();
        bytes.push(b'\r');

        self.start_buffered().await?;

        let budget = self.timing.buffered_budget(bytes.len());
        match tokio::time::timeout(budget, self.echo_bytes(&bytes)).await {
            Ok(Ok(exchanges)) => {
                trace!(exchanges, "Buffered command echoed");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LiquidHandlerError::connection(format!(
                "timed out while awaiting echo of buffered command '{text}'"
            ))),
        }
    }

    async fn start_buffered(&mut self) -> LhResult<()> {
        self.write_byte(b'\n').await?;
        loop {
            match self.read_byte().await? {
                Some(b'\n') => return Ok(()),
                Some(_) => continue,
                None => {
                    return Err(LiquidHandlerError::connection(
                        "device did not acknowledge start of buffered command",
                    ))
                }
            }
        }
    }

    async fn echo_bytes(&mut self, bytes: &[u8]) -> LhResult<usize> {
        let mut exchanges = 0usize;
        let mut index = 0usize;

        while let Some(&c) = bytes.get(index) {
            self.write_byte(c).await?;
            exchanges += 1;

            let Some(echo) = self.read_byte().await? else {
                return Err(LiquidHandlerError::connection(format!(
                    "no echo for byte '{}'",
                    char::from(c).escape_default()
                )));
            };

            if echo == c {
                if c == b'\r' {
                    return Ok(exchanges);
                }
                index += 1;
            } else if c != NOT_RECOGNIZED && echo == NOT_RECOGNIZED {
                trace!(byte = c, "Device busy, resending");
            } else {
                let mut tail = vec![echo];
                for _ in 0..ERROR_TAIL_BYTES {
                    match self.read_byte().await? {
                        Some(b) => tail.push(b),
                        None => break,
                    }
                }
                return Err(LiquidHandlerError::connection(format!(
                    "unrecognized response '{}' while sending '{}'",
                    String::from_utf8_lossy(&tail).escape_default(),
                    char::from(c).escape_default()
                )));
            }
        }

        Err(LiquidHandlerError::connection(
            "exhausted command without terminating on '\\r'",
        ))
    }

    async fn write_byte(&mut self, byte: u8) -> LhResult<()> {
        self.port.write_all(&[byte]).await?;
        self.port.flush().await?;
        Ok(())
    }

    /// One byte, or `None` if the device stayed silent for the read timeout.
    async fn read_byte(&mut self) -> LhResult<Option<u8>> {
        let mut buf = [0u8; 1];
        match tokio::time::timeout(self.timing.read_timeout, self.port.read(&mut buf)).await {
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) => Ok(Some(buf[0])),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }
}

async fn sleep_if_nonzero(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codex::gx241::{GetMotorStatus, HomeMotors};
    use crate::codex::CustomImmediate;
    use tokio::io::DuplexStream;

    fn channel() -> (GsiocChannel, DuplexStream) {
        let (host, device) = tokio::io::duplex(64);
        (GsiocChannel::new(Box::new(host), GsiocTiming::fast()), device)
    }

    async fn read_one(device: &mut DuplexStream) -> u8 {
        let mut b = [0u8; 1];
        device.read_exact(&mut b).await.unwrap();
        b[0]
    }

    #[tokio::test]
    async fn connect_sends_disconnect_then_address() {
        let (mut chan, mut device) = channel();
        let task = tokio::spawn(async move {
            assert_eq!(read_one(&mut device).await, DISCONNECT_ALL);
            assert_eq!(read_one(&mut device).await, 30 + 0x80);
            device.write_all(&[30 + 0x80]).await.unwrap();
            device
        });

        chan.connect(30).await.unwrap();
        assert_eq!(chan.connected_device(), Some(30));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_to_silent_device_fails() {
        let (mut chan, _device) = channel();
        let err = chan.connect(5).await.unwrap_err();
        assert!(matches!(err, LiquidHandlerError::Connection(_)));
        assert_eq!(chan.connected_device(), None);
    }

    #[tokio::test]
    async fn connect_rejects_out_of_range_id() {
        let (mut chan, mut device) = channel();
        let err = chan.connect(64).await.unwrap_err();
        assert!(matches!(err, LiquidHandlerError::InvalidParameter(_)));

        // nothing reached the wire
        drop(chan);
        let mut rest = Vec::new();
        device.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn immediate_acknowledges_each_byte() {
        let (mut chan, mut device) = channel();
        let task = tokio::spawn(async move {
            assert_eq!(read_one(&mut device).await, b'A');
            device.write_all(&[65]).await.unwrap();
            assert_eq!(read_one(&mut device).await, ACK);
            device.write_all(&[65 + 128]).await.unwrap();
            device
        });

        let response = chan
            .immediate_command(&CustomImmediate::new("A").unwrap())
            .await
            .unwrap();
        assert_eq!(response, "AA");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn immediate_unrecognized_is_not_an_error() {
        let (mut chan, mut device) = channel();
        let task = tokio::spawn(async move {
            assert_eq!(read_one(&mut device).await, b'M');
            device.write_all(b"#").await.unwrap();
            device
        });

        let response = chan.immediate_command(&GetMotorStatus).await.unwrap();
        assert_eq!(response, "Command M not recognized");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn buffered_retries_busy_byte() {
        let (mut chan, mut device) = channel();
        let task = tokio::spawn(async move {
            assert_eq!(read_one(&mut device).await, b'\n');
            device.write_all(b"\n").await.unwrap();

            // first attempt at 'H' is refused
            assert_eq!(read_one(&mut device).await, b'H');
            device.write_all(b"#").await.unwrap();
            assert_eq!(read_one(&mut device).await, b'H');
            device.write_all(b"H").await.unwrap();
            assert_eq!(read_one(&mut device).await, b'\r');
            device.write_all(b"\r").await.unwrap();
            device
        });

        chan.buffered_command(&HomeMotors).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn buffered_mismatch_reads_error_tail() {
        let (mut chan, mut device) = channel();
        let task = tokio::spawn(async move {
            assert_eq!(read_one(&mut device).await, b'\n');
            device.write_all(b"\n").await.unwrap();
            assert_eq!(read_one(&mut device).await, b'H');
            device.write_all(b"E12xy").await.unwrap();
            device
        });

        let err = chan.buffered_command(&HomeMotors).await.unwrap_err();
        match err {
            LiquidHandlerError::Connection(msg) => assert!(msg.contains("E12xy"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn buffered_times_out_on_endless_busy() {
        let (mut chan, mut device) = channel();
        let task = tokio::spawn(async move {
            assert_eq!(read_one(&mut device).await, b'\n');
            device.write_all(b"\n").await.unwrap();
            loop {
                let mut b = [0u8; 1];
                if device.read(&mut b).await.unwrap_or(0) == 0 {
                    break;
                }
                if device.write_all(b"#").await.is_err() {
                    break;
                }
            }
        });

        let err = chan.buffered_command(&HomeMotors).await.unwrap_err();
        match &err {
            LiquidHandlerError::Connection(msg) => assert!(msg.contains("timed out"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_protocol());
        drop(chan);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn scripted_wire_exchange() {
        let port = tokio_test::io::Builder::new()
            .write(b"%")
            .read(b"G")
            .write(&[ACK])
            .read(&[b'X' | 0x80])
            .write(b"\n")
            .read(b"\n")
            .write(b"H")
            .read(b"H")
            .write(b"\r")
            .read(b"\r")
            .build();
        let mut chan = GsiocChannel::new(Box::new(port), GsiocTiming::fast());

        let reply = chan
            .immediate_command(&CustomImmediate::new("%").unwrap())
            .await
            .unwrap();
        assert_eq!(reply, "GX");
        chan.buffered_command(&HomeMotors).await.unwrap();
    }
}
