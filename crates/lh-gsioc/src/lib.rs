//! GSIOC transport for Gilson devices.
//!
//! - [`channel`]: the half-duplex byte protocol ([`GsiocChannel`])
//! - [`codex`]: typed commands for the GX-241 arm, syringe pump and injector
//! - [`sim`]: a simulated bus for tests and dry runs

pub mod channel;
pub mod codex;
pub mod sim;

pub use channel::GsiocChannel;
pub use codex::{BufferedCommand, DeviceStatus, ImmediateCommand};
pub use sim::{SimDevice, SimKind, SimulatedBus};
