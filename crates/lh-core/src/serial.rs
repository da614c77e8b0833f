//! Serial Port Abstractions for the GSIOC bus
//!
//! Shared types and utilities for async serial communication, used by the GSIOC
//! channel and the driver crate.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//!
//! # Utilities
//!
//! - [`open_gsioc_port`]: Open a port with the GSIOC line settings (requires the
//!   `serial` feature)
//! - [`drain_serial_buffer`]: Drain stale bytes from a port
//!
//! # Example
//!
//! ```rust,ignore
//! use lh_core::serial::{open_gsioc_port, drain_serial_buffer, DynSerial};
//!
//! let mut port: DynSerial = Box::new(open_gsioc_port("/dev/ttyUSB0", 19200).await?);
//! let discarded = drain_serial_buffer(&mut port, 16, Duration::from_millis(50)).await;
//! ```

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing and the simulated bus)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Baud rate used by every GSIOC device.
pub const GSIOC_BAUD_RATE: u32 = 19200;

/// Open a serial port with GSIOC line settings: 8 data bits, even parity,
/// one stop bit, no flow control.
///
/// The port is opened inside `spawn_blocking` so the runtime is not stalled by
/// the OS open call.
///
/// # Errors
///
/// Returns [`LiquidHandlerError::Connection`](crate::error::LiquidHandlerError::Connection)
/// if the port cannot be opened.
#[cfg(feature = "serial")]
pub async fn open_gsioc_port(
    port_path: &str,
    baud_rate: u32,
) -> crate::error::LhResult<tokio_serial::SerialStream> {
    use crate::error::LiquidHandlerError;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::Even)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                LiquidHandlerError::connection(format!(
                    "failed to open GSIOC port {}: {}",
                    port_path_owned, e
                ))
            })
    })
    .await
    .map_err(|e| {
        LiquidHandlerError::connection(format!("spawn_blocking for port opening failed: {e}"))
    })?
}

/// Drain stale bytes from a serial port.
///
/// Reads and discards until `max_bytes` have been consumed, the port reports no
/// more data, or `window` elapses. Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    max_bytes: usize,
    window: Duration,
) -> usize {
    let mut scratch = [0u8; 32];
    let deadline = tokio::time::Instant::now() + window;
    let mut discarded = 0usize;

    while discarded < max_bytes {
        let want = (max_bytes - discarded).min(scratch.len());
        match tokio::time::timeout_at(deadline, port.read(&mut scratch[..want])).await {
            Ok(Ok(n)) if n > 0 => discarded += n,
            // EOF, read error, or the window closed
            _ => break,
        }
    }

    discarded
}
