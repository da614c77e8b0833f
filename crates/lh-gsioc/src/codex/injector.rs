//! GX direct injection module (firmware 1.1.0).

use super::{buffered_command, immediate_command};

pub use super::{ClearError, GetModuleId, RaiseError, ReadError, Reset};

buffered_command!(
    /// Throw the valve to inject (`VI`).
    SwitchInject,
    "VI"
);

buffered_command!(
    /// Throw the valve to load (`VL`).
    SwitchLoad,
    "VL"
);

immediate_command!(
    /// Valve state (`X`).
    GetInjectorStatus,
    b'X',
    "'i' where i is R for moving, L for load position, and I for inject position"
);

/// Decoded injector valve state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectorState {
    /// `R`: the valve is moving.
    Moving,
    /// `L`
    Load,
    /// `I`
    Inject,
}

impl InjectorState {
    /// Decode a [`GetInjectorStatus`] response.
    pub fn parse(response: &str) -> Option<Self> {
        match response.trim() {
            "R" => Some(Self::Moving),
            "L" => Some(Self::Load),
            "I" => Some(Self::Inject),
            _ => None,
        }
    }
}

/// Description of an injector error number.
pub fn describe_error(code: u32) -> Option<&'static str> {
    Some(match code {
        0 => "No Error",
        1 => "Unknown command",
        2 => "Invalid NV-RAM address",
        3 => "Previous move not complete",
        4 => "Invalid position requested",
        _ => return None,
    })
}
