//! A backend that records calls instead of moving hardware.
//!
//! Used for dry runs (print what a sequence would do) and by tests to assert the
//! exact motion and pump calls an operation produces.

use std::fmt;

use async_trait::async_trait;

use lh_core::capabilities::PipettingBackend;
use lh_core::deck::Point2D;
use lh_core::error::LhResult;
use lh_core::settings::HandlerSettings;

/// One backend call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackendCall {
    /// `home_arm`
    HomeArm,
    /// `home_pump`
    HomePump,
    /// `move_xy(target, speed)`
    MoveXy(Point2D, f64),
    /// `move_z(target, speed)`
    MoveZ(f64, f64),
    /// `aspirate(volume, rate)`
    Aspirate(f64, f64),
    /// `dispense(volume, rate)`
    Dispense(f64, f64),
    /// `aspirate_from_reservoir(volume, rate)`
    Reservoir(f64, f64),
}

impl BackendCall {
    /// Whether the call moves the syringe.
    pub fn is_pump(&self) -> bool {
        matches!(
            self,
            BackendCall::HomePump
                | BackendCall::Aspirate(..)
                | BackendCall::Dispense(..)
                | BackendCall::Reservoir(..)
        )
    }
}

impl fmt::Display for BackendCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendCall::HomeArm => write!(f, "home arm"),
            BackendCall::HomePump => write!(f, "home pump"),
            BackendCall::MoveXy(p, speed) => write!(f, "move xy {p} @ {speed} mm/s"),
            BackendCall::MoveZ(z, speed) => write!(f, "move z {z} @ {speed} mm/s"),
            BackendCall::Aspirate(v, rate) => write!(f, "aspirate {v} uL @ {rate} mL/min"),
            BackendCall::Dispense(v, rate) => write!(f, "dispense {v} uL @ {rate} mL/min"),
            BackendCall::Reservoir(v, rate) => {
                write!(f, "draw {v} uL from reservoir @ {rate} mL/min")
            }
        }
    }
}

/// Records every call and tracks the arm position it would have reached.
#[derive(Debug, Clone)]
pub struct RecordingBackend {
    settings: HandlerSettings,
    calls: Vec<BackendCall>,
    xy: Option<Point2D>,
    z: Option<f64>,
}

impl RecordingBackend {
    /// A recorder with an unknown arm position.
    pub fn new(settings: HandlerSettings) -> Self {
        Self {
            settings,
            calls: Vec::new(),
            xy: None,
            z: None,
        }
    }

    /// Calls so far.
    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    /// Take the calls so far, leaving the log empty.
    pub fn take_calls(&mut self) -> Vec<BackendCall> {
        std::mem::take(&mut self.calls)
    }

    /// Forget the arm position, as after power-up.
    pub fn forget_position(&mut self) {
        self.xy = None;
        self.z = None;
    }
}

#[async_trait]
impl PipettingBackend for RecordingBackend {
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
        self.calls.push(BackendCall::HomeArm);
        self.xy = Some(Point2D::new(0.0, 0.0));
        self.z = Some(0.0);
        Ok(())
    }

    async fn home_pump(&mut self) -> LhResult<()> {
        self.calls.push(BackendCall::HomePump);
        Ok(())
    }

    async fn move_xy(&mut self, target: Point2D, speed: f64) -> LhResult<()> {
        self.calls.push(BackendCall::MoveXy(target, speed));
        self.xy = Some(target);
        Ok(())
    }

    async fn move_z(&mut self, target: f64, speed: f64) -> LhResult<()> {
        self.calls.push(BackendCall::MoveZ(target, speed));
        self.z = Some(target);
        Ok(())
    }

    async fn aspirate(&mut self, volume_ul: f64, flow_rate: f64) -> LhResult<()> {
        self.calls.push(BackendCall::Aspirate(volume_ul, flow_rate));
        Ok(())
    }

    async fn dispense(&mut self, volume_ul: f64, flow_rate: f64) -> LhResult<()> {
        self.calls.push(BackendCall::Dispense(volume_ul, flow_rate));
        Ok(())
    }

    async fn aspirate_from_reservoir(&mut self, volume_ul: f64, flow_rate: f64) -> LhResult<()> {
        self.calls.push(BackendCall::Reservoir(volume_ul, flow_rate));
        Ok(())
    }
}
