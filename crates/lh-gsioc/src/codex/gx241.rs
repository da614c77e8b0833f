//! GX-241 II liquid handler arm (firmware 2.0.2.5).

use super::{buffered_command, format_trimmed, immediate_command, BufferedCommand};

pub use super::{ClearError, GetModuleId, RaiseError, ReadError, Reset};

immediate_command!(
    /// Motor, injector and error summary (`*`).
    GetStatusSummary,
    b'*',
    "'Motor Status, X/Y/Z positions, Valve (Load/Inject), Error Number' (eg PPPP 100/20/125 VI E0)"
);

immediate_command!(
    /// X, Y and Z motor status (`M`).
    GetMotorStatus,
    b'M',
    "'xyz' where each is E (error), R (running), U (unpowered), or P (parked)"
);

immediate_command!(
    /// Liquid-level detector oscillator frequency (`n`).
    GetLiquidLevelFrequency,
    b'n',
    "Current frequency of the LLD oscillator in Hz"
);

immediate_command!(
    /// Current X, Y and Z position (`P`).
    GetXyzPosition,
    b'P',
    "'X/Y/Z' in mm (resolved to 0.1 mm)"
);

immediate_command!(
    /// Travel range of each axis (`Q`).
    GetTravelRanges,
    b'Q',
    "'Axis=min/max' for each axis (X, Y, and Z; in order)"
);

immediate_command!(
    /// Current X and Y (`X`).
    GetXyCoordinates,
    b'X',
    "'xxx.xx/yyy.yy' for the X and Y positions in mm"
);

immediate_command!(
    /// Current Z (`Z`).
    GetZCoordinate,
    b'Z',
    "'zzz.zz' for the Z height (high-up, low-down) in mm"
);

buffered_command!(
    /// Home all arm axes (`H`).
    HomeMotors,
    "H"
);

/// Requested power state for one motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotorPower {
    /// `x`
    #[default]
    NoChange,
    /// `0`
    Off,
    /// `1`
    On,
}

impl MotorPower {
    fn as_char(self) -> char {
        match self {
            MotorPower::NoChange => 'x',
            MotorPower::Off => '0',
            MotorPower::On => '1',
        }
    }
}

/// Power each motor on or off (`E<x><y><z>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetMotorStatus {
    /// X motor.
    pub x: MotorPower,
    /// Y motor.
    pub y: MotorPower,
    /// Z motor.
    pub z: MotorPower,
}

impl BufferedCommand for SetMotorStatus {
    fn command_string(&self) -> String {
        format!("E{}{}{}", self.x.as_char(), self.y.as_char(), self.z.as_char())
    }
}

/// Optional speed (mm/s) and drive power (%) for one axis.
///
/// A drive power can only be given together with a speed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisMotion {
    /// Speed in mm/s (firmware default 125, maximum 150).
    pub speed: f64,
    /// Drive power in percent (default and maximum 100).
    pub drive: Option<f64>,
}

impl AxisMotion {
    /// Speed only.
    pub fn speed(speed: f64) -> Self {
        Self { speed, drive: None }
    }

    /// Speed and drive power.
    pub fn with_drive(speed: f64, drive: f64) -> Self {
        Self {
            speed,
            drive: Some(drive),
        }
    }

    fn append_to(motion: Option<AxisMotion>, cmd: &mut String) {
        if let Some(m) = motion {
            cmd.push(':');
            cmd.push_str(&format_trimmed(m.speed, 1));
            if let Some(drive) = m.drive {
                cmd.push(':');
                cmd.push_str(&format_trimmed(drive, 0));
            }
        }
    }
}

/// Move the arm in XY (`X<px>[:sx[:dx]][/py[:sy[:dy]]]`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveXy {
    /// X target (mm).
    pub x: f64,
    /// X speed and drive.
    pub x_motion: Option<AxisMotion>,
    /// Y target (mm); `None` leaves Y where it is.
    pub y: Option<f64>,
    /// Y speed and drive, only sent with a Y target.
    pub y_motion: Option<AxisMotion>,
}

impl MoveXy {
    /// Move both axes at the same speed.
    pub fn to(x: f64, y: f64, speed: f64) -> Self {
        Self {
            x,
            x_motion: Some(AxisMotion::speed(speed)),
            y: Some(y),
            y_motion: Some(AxisMotion::speed(speed)),
        }
    }
}

impl BufferedCommand for MoveXy {
    fn command_string(&self) -> String {
        let mut cmd = format!("X{}", format_trimmed(self.x, 1));
        AxisMotion::append_to(self.x_motion, &mut cmd);
        if let Some(y) = self.y {
            cmd.push('/');
            cmd.push_str(&format_trimmed(y, 1));
            AxisMotion::append_to(self.y_motion, &mut cmd);
        }
        cmd
    }
}

/// Move the arm in Z (`Z<pz>[:sz[:dz]]`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveZ {
    /// Z target (mm).
    pub z: f64,
    /// Z speed and drive.
    pub motion: Option<AxisMotion>,
}

impl MoveZ {
    /// Move at `speed`.
    pub fn to(z: f64, speed: f64) -> Self {
        Self {
            z,
            motion: Some(AxisMotion::speed(speed)),
        }
    }
}

impl BufferedCommand for MoveZ {
    fn command_string(&self) -> String {
        let mut cmd = format!("Z{}", format_trimmed(self.z, 1));
        AxisMotion::append_to(self.motion, &mut cmd);
        cmd
    }
}

/// Move in Z but stop at the first liquid/air boundary (`z<pz>[:sz[:dz]]`).
///
/// Read the stopping height back with [`GetZCoordinate`]; if it equals the
/// target, no boundary was found.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveZUntilPhaseChange {
    /// Z target (mm).
    pub z: f64,
    /// Z speed (firmware default 40) and drive.
    pub motion: Option<AxisMotion>,
}

impl BufferedCommand for MoveZUntilPhaseChange {
    fn command_string(&self) -> String {
        let mut cmd = format!("z{}", format_trimmed(self.z, 1));
        AxisMotion::append_to(self.motion, &mut cmd);
        cmd
    }
}

/// Parse an `x/y` coordinate response.
pub fn parse_xy(response: &str) -> Option<(f64, f64)> {
    let (x, y) = response.trim().split_once('/')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// Parse a `z` coordinate response.
pub fn parse_z(response: &str) -> Option<f64> {
    response.trim().parse().ok()
}

/// Description of a GX-241 error number.
pub fn describe_error(code: u32) -> Option<&'static str> {
    Some(match code {
        0 => "No Error",
        10 => "Unknown command",
        11 => "Invalid NV-RAM address",
        12 => "Safety stop activated",
        13 => "Bad parameter entered",
        14 => "FIFO Full",
        15 => "FIFO Add",
        16 => "Character limit",
        17 => "X Axis park location",
        18 => "Y Axis park location",
        20 => "X Axis not homed",
        21 => "Y Axis not homed",
        22 => "Z Axis not homed",
        24 => "X Axis moving",
        25 => "Y Axis moving",
        26 => "Z Axis moving",
        28 => "X Axis stall",
        29 => "Y Axis stall",
        30 => "Z Axis stall",
        32 => "X Axis encoder",
        33 => "Y Axis encoder",
        34 => "Z Axis encoder",
        36 => "X Axis speed range",
        37 => "Y Axis speed range",
        38 => "Z Axis speed range",
        40 => "X Axis target range",
        41 => "Y Axis target range",
        42 => "Z Axis target range",
        99 => "Accessory Error",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codex::ImmediateCommand;

    #[test]
    fn move_xy_wire_format() {
        assert_eq!(MoveXy::to(100.0, 100.0, 50.0).command_string(), "X100:50/100:50");

        let bare = MoveXy {
            x: 12.5,
            x_motion: None,
            y: None,
            y_motion: None,
        };
        assert_eq!(bare.command_string(), "X12.5");

        let driven = MoveXy {
            x: 10.0,
            x_motion: Some(AxisMotion::with_drive(40.0, 80.0)),
            y: Some(0.0),
            y_motion: None,
        };
        assert_eq!(driven.command_string(), "X10:40:80/0");
    }

    #[test]
    fn move_z_wire_format() {
        assert_eq!(MoveZ::to(125.0, 25.0).command_string(), "Z125:25");
        let descend = MoveZUntilPhaseChange {
            z: 40.0,
            motion: Some(AxisMotion::with_drive(10.0, 50.0)),
        };
        assert_eq!(descend.command_string(), "z40:10:50");
    }

    #[test]
    fn motor_power() {
        let cmd = SetMotorStatus {
            x: MotorPower::On,
            y: MotorPower::Off,
            z: MotorPower::NoChange,
        };
        assert_eq!(cmd.command_string(), "E10x");
    }

    #[test]
    fn queries() {
        assert_eq!(GetMotorStatus.command_byte(), b'M');
        assert_eq!(GetXyCoordinates.command_byte(), b'X');
        assert_eq!(parse_xy("150.5/20"), Some((150.5, 20.0)));
        assert_eq!(parse_xy("junk"), None);
        assert_eq!(parse_z(" 125.00 "), Some(125.0));
    }

    #[test]
    fn error_table() {
        assert_eq!(describe_error(0), Some("No Error"));
        assert_eq!(describe_error(30), Some("Z Axis stall"));
        assert_eq!(describe_error(19), None);
    }
}
