//! GX syringe pump (firmware 1.0.6.9).

use serde::{Deserialize, Serialize};

use lh_core::error::{LhResult, LiquidHandlerError};

use super::{buffered_command, format_trimmed, immediate_command, BufferedCommand};

pub use super::{ClearError, GetModuleId, RaiseError, ReadError, Reset};

/// Syringe sizes the pump firmware accepts (uL).
pub const VALID_SYRINGE_SIZES: [u32; 6] = [100, 250, 500, 1000, 5000, 10000];

/// Which side of the valve the syringe is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Valve {
    /// `N`: the needle.
    Needle,
    /// `R`: the system-fluid reservoir.
    Reservoir,
}

impl Valve {
    /// The wire letter.
    pub fn as_char(self) -> char {
        match self {
            Valve::Needle => 'N',
            Valve::Reservoir => 'R',
        }
    }
}

immediate_command!(
    /// Syringe size and flow-rate range (`F`).
    GetSyringeSize,
    b'F',
    "'syringe size[ul] min-max (default)[mL/min]'"
);

immediate_command!(
    /// Valve and syringe motor status (`M`).
    GetMotorStatus,
    b'M',
    "'ab' where a is the valve motor status and b is the syringe motor status. Each is E (error), R (running), U (unpowered), or P (parked)"
);

immediate_command!(
    /// Valve position and syringe volume (`P`).
    GetSyringeStatus,
    b'P',
    "'n:v.vvv' where n is the valve position (R/N) and v.vvv the volume in the syringe in uL ('?' if not homed)"
);

buffered_command!(
    /// Stop the syringe (`PX`).
    PumpStop,
    "PX"
);

buffered_command!(
    /// Home the syringe (`p`).
    HomePump,
    "p"
);

/// Declare the installed syringe size (`@4=<v>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetSyringeSize {
    volume_ul: u32,
}

impl SetSyringeSize {
    /// Accepts only sizes in [`VALID_SYRINGE_SIZES`].
    pub fn new(volume_ul: u32) -> LhResult<Self> {
        if !VALID_SYRINGE_SIZES.contains(&volume_ul) {
            return Err(LiquidHandlerError::invalid(format!(
                "syringe volume {volume_ul} uL is not one of {VALID_SYRINGE_SIZES:?}"
            )));
        }
        Ok(Self { volume_ul })
    }
}

impl BufferedCommand for SetSyringeSize {
    fn command_string(&self) -> String {
        format!("@4={}", self.volume_ul)
    }
}

/// Run the syringe (`P<valve>:<volume>[:<rate>]`).
///
/// Positive volumes aspirate, negative volumes dispense (uL). The flow rate is in
/// mL/min.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunPump {
    valve: Valve,
    volume_ul: f64,
    flow_rate: Option<f64>,
}

impl RunPump {
    /// Build the command. Dispensing into the reservoir is rejected.
    pub fn new(valve: Valve, volume_ul: f64, flow_rate: Option<f64>) -> LhResult<Self> {
        if valve == Valve::Reservoir && volume_ul <= 0.0 {
            return Err(LiquidHandlerError::invalid(
                "cannot dispense to the reservoir",
            ));
        }
        Ok(Self {
            valve,
            volume_ul,
            flow_rate,
        })
    }

    /// Signed volume in uL.
    pub fn volume_ul(&self) -> f64 {
        self.volume_ul
    }
}

impl BufferedCommand for RunPump {
    fn command_string(&self) -> String {
        let mut cmd = format!(
            "P{}:{}",
            self.valve.as_char(),
            format_trimmed(self.volume_ul, 3)
        );
        if let Some(rate) = self.flow_rate {
            cmd.push(':');
            cmd.push_str(&format_trimmed(rate, 2));
        }
        cmd
    }
}

/// Description of a syringe-pump error number.
pub fn describe_error(code: u32) -> Option<&'static str> {
    Some(match code {
        0 => "No Error",
        10 => "Unknown buffered command",
        11 => "Invalid NV-RAM address",
        12 => "Safety stop activated",
        16 => "character limit",
        20 => "Pump command while not homed",
        22 => "Pump command while busy",
        24 => "invalid Syringe position",
        26 => "Invalid syringe volume",
        28 => "Invalid flow rate",
        30 => "Invalid syringe size",
        32 => "Invalid valve position",
        34 => "Missing valve encoder",
        88 => "Error unknown",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_pump_wire_format() {
        let cmd = RunPump::new(Valve::Needle, 20.0, Some(1.0)).unwrap();
        assert_eq!(cmd.command_string(), "PN:20:1");

        let cmd = RunPump::new(Valve::Needle, -12.3456, Some(0.25)).unwrap();
        assert_eq!(cmd.command_string(), "PN:-12.346:0.25");

        let cmd = RunPump::new(Valve::Reservoir, 500.0, None).unwrap();
        assert_eq!(cmd.command_string(), "PR:500");
    }

    #[test]
    fn reservoir_only_aspirates() {
        assert!(RunPump::new(Valve::Reservoir, -5.0, None).is_err());
        assert!(RunPump::new(Valve::Reservoir, 0.0, None).is_err());
    }

    #[test]
    fn syringe_sizes() {
        assert_eq!(SetSyringeSize::new(1000).unwrap().command_string(), "@4=1000");
        assert!(SetSyringeSize::new(750).is_err());
    }

    #[test]
    fn error_table() {
        assert_eq!(describe_error(28), Some("Invalid flow rate"));
        assert_eq!(describe_error(13), None);
    }
}
