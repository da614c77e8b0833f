//! Simulated GSIOC bus.
//!
//! Plays the device side of the protocol on one half of a `tokio::io::duplex`
//! pair. Used by tests and by dry runs of the CLI. The simulation is shallow:
//! devices echo buffered commands, answer immediate commands from a table, report
//! busy for a configurable number of motor-status polls after each buffered
//! command, and the arm tracks its XY/Z position from move and home commands.
//!
//! # Example
//!
//! ```rust,ignore
//! let bus = SimulatedBus::gilson(DeviceIds::default());
//! let channel = GsiocChannel::new(bus.attach(), GsiocTiming::fast());
//! // ... drive the channel ...
//! assert_eq!(bus.commands(30), vec!["H"]);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::trace;

use lh_core::serial::DynSerial;
use lh_core::settings::DeviceIds;

use crate::channel::{ACK, DISCONNECT_ALL, NOT_RECOGNIZED};
use crate::codex::gx241::parse_xy;

/// How a simulated device interprets buffered commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    /// Tracks XY/Z from `X`, `Z` and `H` commands.
    Arm,
    /// Tracks the valve from `PN`/`PR` commands.
    Pump,
    /// Tracks the injector valve from `VI`/`VL`.
    Injector,
    /// Echoes only.
    Generic,
}

/// One simulated device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    kind: SimKind,
    responses: HashMap<u8, String>,
    idle_status: String,
    busy_polls: u32,
    busy_remaining: u32,
    reject_next: u32,
    commands: Vec<String>,
    exchanges: Vec<usize>,
}

impl SimDevice {
    /// A device answering nothing but its address.
    pub fn new(kind: SimKind, idle_status: &str) -> Self {
        Self {
            kind,
            responses: HashMap::new(),
            idle_status: idle_status.to_string(),
            busy_polls: 0,
            busy_remaining: 0,
            reject_next: 0,
            commands: Vec::new(),
            exchanges: Vec::new(),
        }
    }

    /// Answer immediate command `byte` with `response`.
    pub fn with_response(mut self, byte: u8, response: &str) -> Self {
        self.responses.insert(byte, response.to_string());
        self
    }

    fn respond(&mut self, byte: u8) -> Option<String> {
        if byte == b'M' {
            if self.busy_remaining > 0 {
                self.busy_remaining -= 1;
                return Some("R".repeat(self.idle_status.len().max(1)));
            }
            return Some(self.idle_status.clone());
        }
        self.responses.get(&byte).cloned()
    }

    fn apply(&mut self, command: &str) {
        self.busy_remaining = self.busy_polls;
        match self.kind {
            SimKind::Arm => self.apply_arm(command),
            SimKind::Pump => {
                if let Some(rest) = command.strip_prefix('P') {
                    if let Some(valve) = rest.chars().next().filter(|c| *c == 'N' || *c == 'R') {
                        self.responses.insert(b'P', format!("{valve}:0"));
                    }
                }
            }
            SimKind::Injector => match command {
                "VI" => {
                    self.responses.insert(b'X', "I".to_string());
                }
                "VL" => {
                    self.responses.insert(b'X', "L".to_string());
                }
                _ => {}
            },
            SimKind::Generic => {}
        }
    }

    fn apply_arm(&mut self, command: &str) {
        let (mut x, mut y) = self
            .responses
            .get(&b'X')
            .and_then(|r| parse_xy(r))
            .unwrap_or((0.0, 0.0));
        let mut z: f64 = self
            .responses
            .get(&b'Z')
            .and_then(|r| r.trim().parse().ok())
            .unwrap_or(0.0);

        if command == "H" {
            (x, y, z) = (0.0, 0.0, 0.0);
        } else if let Some(rest) = command.strip_prefix('X') {
            let (x_part, y_part) = match rest.split_once('/') {
                Some((a, b)) => (a, Some(b)),
                None => (rest, None),
            };
            if let Some(v) = leading_number(x_part) {
                x = v;
            }
            if let Some(v) = y_part.and_then(leading_number) {
                y = v;
            }
        } else if let Some(rest) = command.strip_prefix('Z') {
            if let Some(v) = leading_number(rest) {
                z = v;
            }
        } else {
            return;
        }

        self.responses.insert(b'X', format!("{x}/{y}"));
        self.responses.insert(b'Z', format!("{z}"));
        self.responses.insert(b'P', format!("{x}/{y}/{z}"));
    }
}

fn leading_number(part: &str) -> Option<f64> {
    part.split(':').next()?.parse().ok()
}

#[derive(Debug, Default)]
struct BusState {
    devices: BTreeMap<u8, SimDevice>,
    acks: usize,
}

/// A bus of simulated devices. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// A GX-241 arm, syringe pump and direct injector at the given ids.
    pub fn gilson(ids: DeviceIds) -> Self {
        let bus = Self::new();
        bus.add_device(
            ids.handler,
            SimDevice::new(SimKind::Arm, "PPP")
                .with_response(b'%', "GX-241 II v2.0.2.5")
                .with_response(b'e', "0")
                .with_response(b'X', "0/0")
                .with_response(b'Z', "125")
                .with_response(b'P', "0/0/125")
                .with_response(b'Q', "X=0/400 Y=0/300 Z=0/125")
                .with_response(b'*', "PPP 0/0/125 VL E0")
                .with_response(b'n', "0")
                .with_response(b'$', "$"),
        );
        bus.add_device(
            ids.pump,
            SimDevice::new(SimKind::Pump, "PP")
                .with_response(b'%', "GX Syringe Pump v1.0.6.9")
                .with_response(b'e', "0")
                .with_response(b'F', "1000 0.1-10 (1)")
                .with_response(b'P', "N:0")
                .with_response(b'$', "$"),
        );
        bus.add_device(
            ids.injector,
            SimDevice::new(SimKind::Injector, "P")
                .with_response(b'%', "GX D Inject v1.1.0")
                .with_response(b'e', "0")
                .with_response(b'X', "L")
                .with_response(b'$', "$"),
        );
        bus
    }

    /// Add (or replace) a device.
    pub fn add_device(&self, id: u8, device: SimDevice) {
        self.state.lock().devices.insert(id, device);
    }

    /// Buffered commands device `id` has accepted, in order.
    pub fn commands(&self, id: u8) -> Vec<String> {
        self.state
            .lock()
            .devices
            .get(&id)
            .map(|d| d.commands.clone())
            .unwrap_or_default()
    }

    /// Host bytes exchanged per buffered command of device `id`, after the preamble.
    pub fn exchange_counts(&self, id: u8) -> Vec<usize> {
        self.state
            .lock()
            .devices
            .get(&id)
            .map(|d| d.exchanges.clone())
            .unwrap_or_default()
    }

    /// ACK bytes received from the host.
    pub fn ack_count(&self) -> usize {
        self.state.lock().acks
    }

    /// Refuse the next `n` buffered bytes sent to device `id` with `#`.
    pub fn reject_next(&self, id: u8, n: u32) {
        if let Some(d) = self.state.lock().devices.get_mut(&id) {
            d.reject_next = n;
        }
    }

    /// Report busy for `polls` motor-status queries after each buffered command.
    pub fn set_busy_polls(&self, id: u8, polls: u32) {
        if let Some(d) = self.state.lock().devices.get_mut(&id) {
            d.busy_polls = polls;
        }
    }

    /// Set the answer to immediate command `byte`.
    pub fn set_response(&self, id: u8, byte: u8, response: &str) {
        if let Some(d) = self.state.lock().devices.get_mut(&id) {
            d.responses.insert(byte, response.to_string());
        }
    }

    /// Forget recorded commands.
    pub fn clear_log(&self) {
        for device in self.state.lock().devices.values_mut() {
            device.commands.clear();
            device.exchanges.clear();
        }
    }

    /// Spawn the device side on the current runtime and return the host side.
    ///
    /// The device task ends when the host side is dropped.
    pub fn attach(&self) -> DynSerial {
        let (host, device) = tokio::io::duplex(256);
        let bus = self.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.serve(device).await {
                trace!(error = %e, "Simulated bus closed");
            }
        });
        Box::new(host)
    }

    async fn serve(self, mut wire: DuplexStream) -> std::io::Result<()> {
        let mut connected: Option<u8> = None;
        // (command bytes, exchanges) while inside a buffered command
        let mut buffered: Option<(Vec<u8>, usize)> = None;

        loop {
            let mut byte = [0u8; 1];
            if wire.read(&mut byte).await? == 0 {
                return Ok(());
            }
            let b = byte[0];

            if b == DISCONNECT_ALL {
                connected = None;
                buffered = None;
                continue;
            }

            if let Some((text, exchanges)) = buffered.as_mut() {
                let Some(id) = connected else {
                    buffered = None;
                    continue;
                };
                *exchanges += 1;
                let reply = {
                    let mut state = self.state.lock();
                    match state.devices.get_mut(&id) {
                        Some(device) if device.reject_next > 0 && b != NOT_RECOGNIZED => {
                            device.reject_next -= 1;
                            NOT_RECOGNIZED
                        }
                        Some(device) if b == b'\r' => {
                            let command = String::from_utf8_lossy(text).into_owned();
                            device.apply(&command);
                            device.commands.push(command);
                            device.exchanges.push(*exchanges);
                            b
                        }
                        Some(_) => {
                            text.push(b);
                            b
                        }
                        None => b,
                    }
                };
                if b == b'\r' && reply == b'\r' {
                    buffered = None;
                }
                wire.write_all(&[reply]).await?;
                continue;
            }

            if b >= 0x80 {
                let id = b - 0x80;
                if self.state.lock().devices.contains_key(&id) {
                    connected = Some(id);
                    wire.write_all(&[b]).await?;
                } else {
                    connected = None;
                }
                continue;
            }

            let Some(id) = connected else {
                continue;
            };

            if b == b'\n' {
                buffered = Some((Vec::new(), 0));
                wire.write_all(b"\n").await?;
                continue;
            }

            if b == ACK {
                continue;
            }

            let response = self
                .state
                .lock()
                .devices
                .get_mut(&id)
                .and_then(|d| d.respond(b));
            match response {
                Some(text) if !text.is_empty() => {
                    let bytes = text.as_bytes();
                    let last = bytes.len() - 1;
                    for (i, &r) in bytes.iter().enumerate() {
                        if i == last {
                            wire.write_all(&[r | 0x80]).await?;
                        } else {
                            wire.write_all(&[r]).await?;
                            let mut ack = [0u8; 1];
                            if wire.read(&mut ack).await? == 0 {
                                return Ok(());
                            }
                            if ack[0] == ACK {
                                self.state.lock().acks += 1;
                            }
                        }
                    }
                }
                _ => wire.write_all(&[NOT_RECOGNIZED]).await?,
            }
        }
    }
}
