//! Immutable handler settings.
//!
//! Everything that used to be a tunable constant (speeds, flow rates, syringe size,
//! travel height, device ids, GSIOC timing) lives here. Settings are deserialized
//! once at startup and passed by reference; nothing mutates them afterwards.
//!
//! Units: distances in mm, speeds in mm/s, volumes in uL, flow rates in mL/min.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LhResult, LiquidHandlerError};

/// Complete handler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HandlerSettings {
    /// Serial line and GSIOC timing.
    pub serial: SerialSettings,
    /// GSIOC ids of the devices on the bus.
    pub devices: DeviceIds,
    /// Arm motion defaults and limits.
    pub motion: MotionSettings,
    /// Syringe pump defaults.
    pub pump: PumpSettings,
    /// What to do when the driver starts.
    pub startup: StartupSettings,
}

/// Serial port settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    /// Line speed. GSIOC devices ship at 19200.
    pub baud_rate: u32,
    /// Protocol timing.
    pub timing: GsiocTiming,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            timing: GsiocTiming::default(),
        }
    }
}

/// GSIOC timing budget.
///
/// The defaults are what the hardware needs; tests shrink them to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GsiocTiming {
    /// How long a single-byte read may wait before the device counts as silent.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Pause after the disconnect-all byte.
    #[serde(with = "humantime_serde")]
    pub disconnect_settle: Duration,
    /// Pause after a successful address handshake, before draining.
    #[serde(with = "humantime_serde")]
    pub connect_settle: Duration,
    /// Pause before each immediate command byte.
    #[serde(with = "humantime_serde")]
    pub immediate_delay: Duration,
    /// Time allowed per byte of a buffered command (plus one for the terminator).
    #[serde(with = "humantime_serde")]
    pub per_byte_budget: Duration,
}

impl Default for GsiocTiming {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            disconnect_settle: Duration::from_secs(1),
            connect_settle: Duration::from_millis(200),
            immediate_delay: Duration::from_millis(20),
            per_byte_budget: Duration::from_millis(200),
        }
    }
}

impl GsiocTiming {
    /// Zero settle times and a short read timeout, for simulated buses.
    pub fn fast() -> Self {
        Self {
            read_timeout: Duration::from_millis(250),
            disconnect_settle: Duration::ZERO,
            connect_settle: Duration::ZERO,
            immediate_delay: Duration::ZERO,
            per_byte_budget: Duration::from_millis(100),
        }
    }

    /// Overall budget for a buffered command of `len` bytes including the terminator.
    pub fn buffered_budget(&self, len: usize) -> Duration {
        self.per_byte_budget * (len as u32 + 1)
    }
}

/// GSIOC ids (0..64) of the devices on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIds {
    /// GX-241 arm.
    pub handler: u8,
    /// GX syringe pump.
    pub pump: u8,
    /// GX direct injector.
    pub injector: u8,
}

impl Default for DeviceIds {
    fn default() -> Self {
        Self {
            handler: 30,
            pump: 2,
            injector: 6,
        }
    }
}

/// What the driver does when a device stays busy past the motor-wait budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MotorWaitTimeoutPolicy {
    /// Log a warning and carry on.
    #[default]
    Warn,
    /// Return [`LiquidHandlerError::MotorWaitTimeout`].
    Fail,
}

/// Arm motion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    /// Default XY speed (mm/s).
    pub xy_speed: f64,
    /// Default Z speed (mm/s).
    pub z_speed: f64,
    /// Travel height, also the Z upper limit when no deck is loaded.
    pub max_z: f64,
    /// Z lower limit when no deck is loaded.
    pub min_z: f64,
    /// How long to poll the motor status after a buffered command.
    #[serde(with = "humantime_serde")]
    pub motor_wait_timeout: Duration,
    /// Behaviour when the motor-wait budget runs out.
    pub motor_wait_policy: MotorWaitTimeoutPolicy,
    /// Read the position back after homing instead of assuming (0, 0, 0).
    pub verify_home_position: bool,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            xy_speed: 50.0,
            z_speed: 25.0,
            max_z: 125.0,
            min_z: 5.0,
            motor_wait_timeout: Duration::from_secs(60),
            motor_wait_policy: MotorWaitTimeoutPolicy::Warn,
            verify_home_position: false,
        }
    }
}

/// Syringe pump settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    /// Installed syringe volume (uL).
    pub syringe_volume_ul: f64,
    /// Default flow rate (mL/min).
    pub flow_rate: f64,
    /// Flow rate used when priming (mL/min).
    pub priming_flow_rate: f64,
    /// Air gap kept at the needle tip between operations (uL).
    pub system_air_gap_ul: f64,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            syringe_volume_ul: 1000.0,
            flow_rate: 1.0,
            priming_flow_rate: 5.0,
            system_air_gap_ul: 20.0,
        }
    }
}

/// Startup behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupSettings {
    /// Home the arm when the driver initializes.
    pub home_arm: bool,
    /// Home the syringe pump when the driver initializes.
    pub home_pump: bool,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            home_arm: true,
            home_pump: false,
        }
    }
}

impl HandlerSettings {
    /// Reject settings the hardware cannot honour.
    pub fn validate(&self) -> LhResult<()> {
        for (name, id) in [
            ("handler", self.devices.handler),
            ("pump", self.devices.pump),
            ("injector", self.devices.injector),
        ] {
            if id >= 64 {
                return Err(LiquidHandlerError::invalid(format!(
                    "{name} device id {id} outside 0..64"
                )));
            }
        }
        if self.motion.min_z >= self.motion.max_z {
            return Err(LiquidHandlerError::invalid(format!(
                "min_z {} must be below max_z {}",
                self.motion.min_z, self.motion.max_z
            )));
        }
        if self.pump.syringe_volume_ul <= 0.0 {
            return Err(LiquidHandlerError::invalid("syringe volume must be positive"));
        }
        if self.motion.xy_speed <= 0.0 || self.motion.z_speed <= 0.0 {
            return Err(LiquidHandlerError::invalid("arm speeds must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hardware() {
        let settings = HandlerSettings::default();
        assert_eq!(settings.devices.handler, 30);
        assert_eq!(settings.devices.pump, 2);
        assert_eq!(settings.devices.injector, 6);
        assert_eq!(settings.motion.max_z, 125.0);
        assert_eq!(settings.pump.syringe_volume_ul, 1000.0);
        assert_eq!(settings.pump.system_air_gap_ul, 20.0);
        assert_eq!(settings.serial.baud_rate, 19200);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn buffered_budget_counts_terminator() {
        let timing = GsiocTiming::default();
        // "H\r" is two bytes, plus one
        assert_eq!(timing.buffered_budget(2), Duration::from_millis(600));
    }

    #[test]
    fn rejects_out_of_range_id() {
        let mut settings = HandlerSettings::default();
        settings.devices.pump = 64;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: HandlerSettings = serde_json::from_str(
            r#"{"motion": {"motor_wait_timeout": "5s", "motor_wait_policy": "fail"}}"#,
        )
        .unwrap();
        assert_eq!(settings.motion.motor_wait_timeout, Duration::from_secs(5));
        assert_eq!(settings.motion.motor_wait_policy, MotorWaitTimeoutPolicy::Fail);
        assert_eq!(settings.motion.xy_speed, 50.0);
    }
}
