//! Command codex for Gilson GSIOC devices.
//!
//! Commands come in two shapes:
//!
//! - [`ImmediateCommand`]: a single ASCII byte; the device answers at once.
//! - [`BufferedCommand`]: an ASCII string the device queues and executes. No answer
//!   beyond the byte echo.
//!
//! Building a command only formats bytes. Parameter checks that the firmware would
//! reject happen in constructors, so a command that exists can be sent.
//!
//! Device modules:
//! - [`gx241`]: the GX-241 arm
//! - [`pump`]: the GX syringe pump
//! - [`injector`]: the GX direct injection module

use std::fmt;

use lh_core::error::{LhResult, LiquidHandlerError};

pub mod gx241;
pub mod injector;
pub mod pump;

/// A command executed from the device's buffer.
pub trait BufferedCommand: fmt::Debug + Send + Sync {
    /// Wire text, without the trailing carriage return.
    fn command_string(&self) -> String;
}

/// A single-byte command answered at once.
pub trait ImmediateCommand: fmt::Debug + Send + Sync {
    /// The command byte. Must be below 128.
    fn command_byte(&self) -> u8;

    /// Description of the expected answer.
    fn response_format(&self) -> &'static str {
        "Response format not defined"
    }
}

macro_rules! immediate_command {
    ($(#[$meta:meta])* $name:ident, $byte:expr, $format:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name;

        impl $crate::codex::ImmediateCommand for $name {
            fn command_byte(&self) -> u8 {
                $byte
            }

            fn response_format(&self) -> &'static str {
                $format
            }
        }
    };
}

macro_rules! buffered_command {
    ($(#[$meta:meta])* $name:ident, $text:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name;

        impl $crate::codex::BufferedCommand for $name {
            fn command_string(&self) -> String {
                $text.to_string()
            }
        }
    };
}

pub(crate) use buffered_command;
pub(crate) use immediate_command;

// =============================================================================
// Commands shared by every GSIOC device
// =============================================================================

immediate_command!(
    /// Firmware identification (`%`).
    GetModuleId,
    b'%',
    "'<module name> va.b.c.d' with the firmware version"
);

immediate_command!(
    /// Reset the device (`$`).
    Reset,
    b'$',
    "echo"
);

immediate_command!(
    /// Current error number (`e`).
    ReadError,
    b'e',
    "'n' where n is an error number"
);

buffered_command!(
    /// Clear the error state (`e`).
    ClearError,
    "e"
);

/// Set the error state manually (`e<n>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaiseError(pub u32);

impl BufferedCommand for RaiseError {
    fn command_string(&self) -> String {
        format!("e{}", self.0)
    }
}

/// Any buffered command, for debugging and firmware features not covered here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomBuffered(pub String);

impl BufferedCommand for CustomBuffered {
    fn command_string(&self) -> String {
        self.0.clone()
    }
}

/// Any immediate command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomImmediate {
    byte: u8,
}

impl CustomImmediate {
    /// Accepts exactly one ASCII character.
    pub fn new(command: &str) -> LhResult<Self> {
        match command.as_bytes() {
            [byte] if byte.is_ascii() => Ok(Self { byte: *byte }),
            _ => Err(LiquidHandlerError::invalid(format!(
                "immediate commands are a single ASCII character, got {command:?}"
            ))),
        }
    }
}

impl ImmediateCommand for CustomImmediate {
    fn command_byte(&self) -> u8 {
        self.byte
    }
}

// =============================================================================
// Status letters and formatting helpers
// =============================================================================

/// Motor status letter reported by the `M` and `*` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// `E`
    Error,
    /// `R` (running)
    Busy,
    /// `U` (unpowered)
    Off,
    /// `P` (parked)
    Parked,
}

impl DeviceStatus {
    /// Decode a status letter.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'E' => Some(Self::Error),
            'R' => Some(Self::Busy),
            'U' => Some(Self::Off),
            'P' => Some(Self::Parked),
            _ => None,
        }
    }

    /// The wire letter.
    pub fn as_char(self) -> char {
        match self {
            Self::Error => 'E',
            Self::Busy => 'R',
            Self::Off => 'U',
            Self::Parked => 'P',
        }
    }

    /// Decode every recognised letter of a status response.
    pub fn parse_all(response: &str) -> Vec<Self> {
        response.chars().filter_map(Self::from_char).collect()
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Busy => write!(f, "busy"),
            Self::Off => write!(f, "off"),
            Self::Parked => write!(f, "parked"),
        }
    }
}

/// Whether a motor-status response reports any motor as running.
pub fn any_busy(response: &str) -> bool {
    response.contains(DeviceStatus::Busy.as_char())
}

/// Fixed-point formatting with trailing zeros (and a bare point) removed.
///
/// `format_trimmed(20.0, 3)` is `"20"`, `format_trimmed(1.25, 2)` is `"1.25"`.
pub fn format_trimmed(value: f64, decimals: usize) -> String {
    let text = format!("{value:.decimals$}");
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}
