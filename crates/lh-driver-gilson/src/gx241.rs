//! Gilson GX-241 II Liquid Handler Driver
//!
//! Reference: GX-241 II, GX Syringe Pump and GX Direct Injection Module GSIOC
//! command guides.
//!
//! Protocol Overview:
//! - Format: GSIOC (immediate single-byte queries, echoed buffered commands)
//! - Baud: 19200, 8E1, no flow control
//! - One bus, three devices: arm (id 30), syringe pump (id 2), injector (id 6)
//!
//! Every buffered command is followed by a motor wait: the driver polls the
//! device's motor status until no motor reports running. Arm position is tracked
//! from the commands sent; it is unknown until the arm is homed or moved.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lh_driver_gilson::Gx241Driver;
//!
//! let mut driver = Gx241Driver::open(settings).await?;
//! driver.initialize().await?;
//! driver.move_xy(Point2D::new(100.0, 100.0), 50.0).await?;
//! driver.aspirate(20.0, 1.0).await?;
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, instrument, warn};

use lh_core::capabilities::PipettingBackend;
use lh_core::deck::{Point2D, TravelBounds};
use lh_core::error::{LhResult, LiquidHandlerError};
use lh_core::resources::{ResourceConfig, SYSTEM_FLUID_KEY};
use lh_core::settings::{HandlerSettings, MotorWaitTimeoutPolicy};
use lh_gsioc::codex::{self, any_busy, gx241, injector, pump, BufferedCommand, ImmediateCommand};
use lh_gsioc::GsiocChannel;

/// Volumes below this magnitude (uL) are rejected.
const MIN_PUMP_VOLUME_UL: f64 = 0.001;

// =============================================================================
// Device selection
// =============================================================================

/// One of the three devices on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GilsonDevice {
    /// GX-241 arm.
    Arm,
    /// GX syringe pump.
    Pump,
    /// GX direct injector.
    Injector,
}

impl GilsonDevice {
    fn describe_error(self, code: u32) -> Option<&'static str> {
        match self {
            GilsonDevice::Arm => gx241::describe_error(code),
            GilsonDevice::Pump => pump::describe_error(code),
            GilsonDevice::Injector => injector::describe_error(code),
        }
    }
}

impl std::fmt::Display for GilsonDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GilsonDevice::Arm => write!(f, "arm"),
            GilsonDevice::Pump => write!(f, "pump"),
            GilsonDevice::Injector => write!(f, "injector"),
        }
    }
}

/// Error state read from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceErrorState {
    /// Raw response.
    pub raw: String,
    /// Parsed error number.
    pub code: Option<u32>,
    /// Description from the device's error table.
    pub description: Option<&'static str>,
}

// =============================================================================
// Gx241Driver
// =============================================================================

/// Driver for the GX-241 II arm and its syringe pump and injector.
///
/// The driver owns the GSIOC channel; commands run strictly one after another.
pub struct Gx241Driver {
    channel: GsiocChannel,
    settings: HandlerSettings,
    bounds: Option<TravelBounds>,
    resources: Option<ResourceConfig>,
    xy: Option<Point2D>,
    z: Option<f64>,
}

impl std::fmt::Debug for Gx241Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gx241Driver")
            .field("channel", &self.channel)
            .field("bounds", &self.bounds)
            .field("xy", &self.xy)
            .field("z", &self.z)
            .finish_non_exhaustive()
    }
}

impl Gx241Driver {
    /// Open the configured serial port.
    ///
    /// Does not touch the hardware beyond opening the port; call
    /// [`initialize`](Self::initialize) for the startup sequence.
    pub async fn open(settings: HandlerSettings) -> LhResult<Self> {
        settings.validate()?;
        let channel = GsiocChannel::open(
            &settings.serial.port,
            settings.serial.baud_rate,
            settings.serial.timing.clone(),
        )
        .await?;
        info!(port = %settings.serial.port, "Opened GSIOC port");
        Ok(Self::new(channel, settings))
    }

    /// Wrap an existing channel (a simulated bus, for instance).
    pub fn new(channel: GsiocChannel, settings: HandlerSettings) -> Self {
        Self {
            channel,
            settings,
            bounds: None,
            resources: None,
            xy: None,
            z: None,
        }
    }

    /// Clamp moves to these travel bounds.
    pub fn with_bounds(mut self, bounds: Option<TravelBounds>) -> Self {
        self.bounds = bounds;
        self
    }

    /// Track reservoir draws in this resource file.
    pub fn with_resources(mut self, resources: Option<ResourceConfig>) -> Self {
        self.resources = resources;
        self
    }

    /// Resource file in use, if any.
    pub fn resources(&self) -> Option<&ResourceConfig> {
        self.resources.as_ref()
    }

    /// Startup sequence: home the arm and/or pump as configured, then draw the
    /// system air gap.
    #[instrument(skip(self), err)]
    pub async fn initialize(&mut self) -> LhResult<()> {
        if self.settings.startup.home_arm {
            self.home_arm().await?;
        }
        if self.settings.startup.home_pump {
            self.home_pump().await?;
        }
        let air_gap = self.settings.pump.system_air_gap_ul;
        let rate = self.settings.pump.flow_rate;
        self.aspirate(air_gap, rate).await
    }

    fn device_id(&self, device: GilsonDevice) -> u8 {
        match device {
            GilsonDevice::Arm => self.settings.devices.handler,
            GilsonDevice::Pump => self.settings.devices.pump,
            GilsonDevice::Injector => self.settings.devices.injector,
        }
    }

    // =========================================================================
    // Bus primitives
    // =========================================================================

    /// Connect, send a buffered command and wait for the device's motors to stop.
    pub async fn buffered<C: BufferedCommand + ?Sized>(
        &mut self,
        device: GilsonDevice,
        command: &C,
    ) -> LhResult<()> {
        self.buffered_no_wait(device, command).await?;
        self.motor_wait(device).await
    }

    /// Connect and send a buffered command without waiting for completion.
    pub async fn buffered_no_wait<C: BufferedCommand + ?Sized>(
        &mut self,
        device: GilsonDevice,
        command: &C,
    ) -> LhResult<()> {
        let id = self.device_id(device);
        self.channel.connect(id).await?;
        self.channel.buffered_command(command).await
    }

    /// Connect and send an immediate command.
    pub async fn immediate<C: ImmediateCommand + ?Sized>(
        &mut self,
        device: GilsonDevice,
        command: &C,
    ) -> LhResult<String> {
        let id = self.device_id(device);
        self.channel.connect(id).await?;
        self.channel.immediate_command(command).await
    }

    /// Poll the motor status of the connected device until nothing is running.
    ///
    /// Past the motor-wait budget the configured policy applies: warn and return,
    /// or fail with [`LiquidHandlerError::MotorWaitTimeout`].
    #[instrument(skip(self), fields(device = %device), err)]
    pub async fn motor_wait(&mut self, device: GilsonDevice) -> LhResult<()> {
        let budget = self.settings.motion.motor_wait_timeout;
        let start = tokio::time::Instant::now();
        let status = codex::CustomImmediate::new("M")?;

        loop {
            let response = self.channel.immediate_command(&status).await?;
            if !any_busy(&response) {
                return Ok(());
            }

            let waited = start.elapsed();
            if waited > budget {
                return match self.settings.motion.motor_wait_policy {
                    MotorWaitTimeoutPolicy::Warn => {
                        warn!(?waited, "Motor wait timed out, continuing");
                        Ok(())
                    }
                    MotorWaitTimeoutPolicy::Fail => Err(LiquidHandlerError::MotorWaitTimeout {
                        device: self.device_id(device),
                        waited,
                    }),
                };
            }
        }
    }

    // =========================================================================
    // Arm
    // =========================================================================

    /// Home the arm. Position becomes (0, 0, 0), or is read back when
    /// `verify_home_position` is set.
    #[instrument(skip(self), err)]
    pub async fn home_arm(&mut self) -> LhResult<()> {
        self.buffered(GilsonDevice::Arm, &gx241::HomeMotors).await?;
        if self.settings.motion.verify_home_position {
            let (xy, z) = self.current_coordinates().await?;
            self.xy = Some(xy);
            self.z = Some(z);
        } else {
            self.xy = Some(Point2D::new(0.0, 0.0));
            self.z = Some(0.0);
        }
        Ok(())
    }

    /// Move in XY, clamped to the travel bounds when configured.
    #[instrument(skip(self), fields(x = target.x, y = target.y, speed), err)]
    pub async fn move_xy(&mut self, target: Point2D, speed: f64) -> LhResult<()> {
        let target = match &self.bounds {
            Some(bounds) => bounds.clamp_xy(target),
            None => target,
        };
        self.buffered(GilsonDevice::Arm, &gx241::MoveXy::to(target.x, target.y, speed))
            .await?;
        self.xy = Some(target);
        Ok(())
    }

    /// Move in Z, clamped to the travel bounds (or `[min_z, max_z]`).
    #[instrument(skip(self), fields(z = target, speed), err)]
    pub async fn move_z(&mut self, target: f64, speed: f64) -> LhResult<()> {
        let target = match &self.bounds {
            Some(bounds) => bounds.clamp_z(target),
            None => target.clamp(self.settings.motion.min_z, self.settings.motion.max_z),
        };
        self.buffered(GilsonDevice::Arm, &gx241::MoveZ::to(target, speed))
            .await?;
        self.z = Some(target);
        Ok(())
    }

    /// Power the arm motors on or off.
    pub async fn set_motor_power(
        &mut self,
        x: gx241::MotorPower,
        y: gx241::MotorPower,
        z: gx241::MotorPower,
    ) -> LhResult<()> {
        self.buffered_no_wait(GilsonDevice::Arm, &gx241::SetMotorStatus { x, y, z })
            .await
    }

    /// Read the arm position from the hardware.
    pub async fn current_coordinates(&mut self) -> LhResult<(Point2D, f64)> {
        let xy = self
            .immediate(GilsonDevice::Arm, &gx241::GetXyCoordinates)
            .await?;
        let (x, y) = gx241::parse_xy(&xy).ok_or_else(|| {
            LiquidHandlerError::connection(format!("unparseable XY response '{xy}'"))
        })?;
        let z = self.channel.immediate_command(&gx241::GetZCoordinate).await?;
        let z = gx241::parse_z(&z).ok_or_else(|| {
            LiquidHandlerError::connection(format!("unparseable Z response '{z}'"))
        })?;
        Ok((Point2D::new(x, y), z))
    }

    // =========================================================================
    // Syringe pump
    // =========================================================================

    /// Run the syringe. Positive volumes aspirate, negative volumes dispense.
    ///
    /// Validation happens before anything is sent.
    #[instrument(skip(self), fields(volume_ul, valve = ?valve, flow_rate), err)]
    pub async fn pump(
        &mut self,
        volume_ul: f64,
        valve: pump::Valve,
        flow_rate: Option<f64>,
        wait: bool,
    ) -> LhResult<()> {
        if !volume_ul.is_finite() || volume_ul.abs() < MIN_PUMP_VOLUME_UL {
            return Err(LiquidHandlerError::invalid(format!(
                "pump volume {volume_ul} uL is too small"
            )));
        }
        let command = pump::RunPump::new(valve, volume_ul, flow_rate)?;
        if wait {
            self.buffered(GilsonDevice::Pump, &command).await
        } else {
            self.buffered_no_wait(GilsonDevice::Pump, &command).await
        }
    }

    /// Home the syringe.
    #[instrument(skip(self), err)]
    pub async fn home_pump(&mut self) -> LhResult<()> {
        self.buffered(GilsonDevice::Pump, &pump::HomePump).await
    }

    /// Stop the syringe immediately.
    pub async fn stop_pump(&mut self) -> LhResult<()> {
        self.buffered_no_wait(GilsonDevice::Pump, &pump::PumpStop)
            .await
    }

    /// Declare the installed syringe size.
    pub async fn set_syringe_size(&mut self, volume_ul: u32) -> LhResult<()> {
        let command = pump::SetSyringeSize::new(volume_ul)?;
        self.buffered(GilsonDevice::Pump, &command).await
    }

    /// Syringe size and flow-rate range as reported by the pump.
    pub async fn syringe_size(&mut self) -> LhResult<String> {
        self.immediate(GilsonDevice::Pump, &pump::GetSyringeSize)
            .await
    }

    /// Draw `volume_ul` of system fluid and debit the resource file.
    #[instrument(skip(self), fields(volume_ul, flow_rate), err)]
    pub async fn draw_from_reservoir(&mut self, volume_ul: f64, flow_rate: f64) -> LhResult<()> {
        let volume_ul = volume_ul.abs();
        self.pump(volume_ul, pump::Valve::Reservoir, Some(flow_rate), true)
            .await?;
        if let Some(resources) = &self.resources {
            if !resources.update_number(SYSTEM_FLUID_KEY, None, |ml| ml - volume_ul / 1000.0) {
                warn!(path = %resources.path().display(), "System fluid level not updated");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Injector
    // =========================================================================

    /// Current injector valve state.
    pub async fn injector_state(&mut self) -> LhResult<injector::InjectorState> {
        let response = self
            .immediate(GilsonDevice::Injector, &injector::GetInjectorStatus)
            .await?;
        injector::InjectorState::parse(&response).ok_or_else(|| {
            LiquidHandlerError::connection(format!("unexpected injector status '{response}'"))
        })
    }

    /// Switch the injector to load.
    #[instrument(skip(self), err)]
    pub async fn injector_load(&mut self) -> LhResult<()> {
        self.buffered_no_wait(GilsonDevice::Injector, &injector::SwitchLoad)
            .await?;
        self.injector_wait().await
    }

    /// Switch the injector to inject.
    #[instrument(skip(self), err)]
    pub async fn injector_inject(&mut self) -> LhResult<()> {
        self.buffered_no_wait(GilsonDevice::Injector, &injector::SwitchInject)
            .await?;
        self.injector_wait().await
    }

    async fn injector_wait(&mut self) -> LhResult<()> {
        let budget = self.settings.motion.motor_wait_timeout;
        let start = tokio::time::Instant::now();
        loop {
            let response = self
                .channel
                .immediate_command(&injector::GetInjectorStatus)
                .await?;
            if injector::InjectorState::parse(&response) != Some(injector::InjectorState::Moving) {
                return Ok(());
            }
            if start.elapsed() > budget {
                return match self.settings.motion.motor_wait_policy {
                    MotorWaitTimeoutPolicy::Warn => {
                        warn!("Injector still moving after {:?}", budget);
                        Ok(())
                    }
                    MotorWaitTimeoutPolicy::Fail => Err(LiquidHandlerError::MotorWaitTimeout {
                        device: self.settings.devices.injector,
                        waited: start.elapsed(),
                    }),
                };
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Read a device's error state.
    pub async fn read_error(&mut self, device: GilsonDevice) -> LhResult<DeviceErrorState> {
        let raw = self.immediate(device, &codex::ReadError).await?;
        let code = raw.trim().parse::<u32>().ok();
        Ok(DeviceErrorState {
            description: code.and_then(|c| device.describe_error(c)),
            code,
            raw,
        })
    }

    /// Clear a device's error state.
    pub async fn clear_error(&mut self, device: GilsonDevice) -> LhResult<()> {
        self.buffered_no_wait(device, &codex::ClearError).await
    }

    /// Labelled answers to the arm's status queries.
    pub async fn query_arm(&mut self) -> LhResult<Vec<(&'static str, String)>> {
        let mut out = vec![(
            "module",
            self.immediate(GilsonDevice::Arm, &gx241::GetModuleId).await?,
        )];
        out.push(("status", self.channel.immediate_command(&gx241::GetStatusSummary).await?));
        out.push(("motors", self.channel.immediate_command(&gx241::GetMotorStatus).await?));
        out.push(("position", self.channel.immediate_command(&gx241::GetXyzPosition).await?));
        out.push(("ranges", self.channel.immediate_command(&gx241::GetTravelRanges).await?));
        out.push(("error", self.channel.immediate_command(&gx241::ReadError).await?));
        Ok(out)
    }

    /// Labelled answers to the pump's status queries.
    pub async fn query_pump(&mut self) -> LhResult<Vec<(&'static str, String)>> {
        let mut out = vec![(
            "module",
            self.immediate(GilsonDevice::Pump, &pump::GetModuleId).await?,
        )];
        out.push(("syringe", self.channel.immediate_command(&pump::GetSyringeSize).await?));
        out.push(("motors", self.channel.immediate_command(&pump::GetMotorStatus).await?));
        out.push(("status", self.channel.immediate_command(&pump::GetSyringeStatus).await?));
        out.push(("error", self.channel.immediate_command(&pump::ReadError).await?));
        Ok(out)
    }

    /// Labelled answers to the injector's status queries.
    pub async fn query_injector(&mut self) -> LhResult<Vec<(&'static str, String)>> {
        let mut out = vec![(
            "module",
            self.immediate(GilsonDevice::Injector, &injector::GetModuleId)
                .await?,
        )];
        out.push((
            "valve",
            self.channel
                .immediate_command(&injector::GetInjectorStatus)
                .await?,
        ));
        out.push(("error", self.channel.immediate_command(&injector::ReadError).await?));
        Ok(out)
    }
}

#[async_trait]
impl PipettingBackend for Gx241Driver {
    fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    fn current_xy(&self) -> Option<Point2D> {
        self.xy
    }

    fn current_z(&self) -> Option<f64> {
        self.z
    }

    async fn home_arm(&mut self) -> LhResult<()> {
        Gx241Driver::home_arm(self).await
    }

    async fn home_pump(&mut self) -> LhResult<()> {
        Gx241Driver::home_pump(self).await
    }

    async fn move_xy(&mut self, target: Point2D, speed: f64) -> LhResult<()> {
        Gx241Driver::move_xy(self, target, speed).await
    }

    async fn move_z(&mut self, target: f64, speed: f64) -> LhResult<()> {
        Gx241Driver::move_z(self, target, speed).await
    }

    async fn aspirate(&mut self, volume_ul: f64, flow_rate: f64) -> LhResult<()> {
        self.pump(volume_ul.abs(), pump::Valve::Needle, Some(flow_rate), true)
            .await
    }

    async fn dispense(&mut self, volume_ul: f64, flow_rate: f64) -> LhResult<()> {
        self.pump(-volume_ul.abs(), pump::Valve::Needle, Some(flow_rate), true)
            .await
    }

    async fn aspirate_from_reservoir(&mut self, volume_ul: f64, flow_rate: f64) -> LhResult<()> {
        self.draw_from_reservoir(volume_ul, flow_rate).await
    }
}
