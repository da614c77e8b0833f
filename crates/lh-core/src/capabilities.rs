//! Liquid-handler capability traits.
//!
//! The pipetting engine talks to hardware only through [`PipettingBackend`]. The
//! Gilson driver implements it over the GSIOC bus; tests implement it with a
//! recorder that never touches a port.
//!
//! # Design
//!
//! - Async (`#[async_trait]`)
//! - `&mut self`: a backend is owned by exactly one engine and commands run strictly
//!   in sequence
//! - Volumes in uL, flow rates in mL/min, positions in mm, speeds in mm/s
//!
//! # Example
//!
//! ```rust,ignore
//! async fn touch_down<B: PipettingBackend>(backend: &mut B, xy: Point2D) -> LhResult<()> {
//!     let motion = backend.settings().motion.clone();
//!     backend.move_z(motion.max_z, motion.z_speed).await?;
//!     backend.move_xy(xy, motion.xy_speed).await?;
//!     backend.move_z(motion.min_z, motion.z_speed).await
//! }
//! ```

use async_trait::async_trait;

use crate::deck::Point2D;
use crate::error::LhResult;
use crate::settings::HandlerSettings;

/// Arm and syringe-pump primitives needed to pipette.
#[async_trait]
pub trait PipettingBackend: Send {
    /// Settings the backend was built with.
    fn settings(&self) -> &HandlerSettings;

    /// Last commanded XY, `None` until the arm has been homed or moved.
    fn current_xy(&self) -> Option<Point2D>;

    /// Last commanded Z, `None` until the arm has been homed or moved.
    fn current_z(&self) -> Option<f64>;

    /// Home all arm axes.
    async fn home_arm(&mut self) -> LhResult<()>;

    /// Home the syringe pump, emptying the syringe.
    async fn home_pump(&mut self) -> LhResult<()>;

    /// Move in XY and wait for the motion to finish.
    async fn move_xy(&mut self, target: Point2D, speed: f64) -> LhResult<()>;

    /// Move in Z and wait for the motion to finish.
    async fn move_z(&mut self, target: f64, speed: f64) -> LhResult<()>;

    /// Draw `volume_ul` through the needle.
    async fn aspirate(&mut self, volume_ul: f64, flow_rate: f64) -> LhResult<()>;

    /// Expel `volume_ul` through the needle.
    async fn dispense(&mut self, volume_ul: f64, flow_rate: f64) -> LhResult<()>;

    /// Draw `volume_ul` of system fluid from the reservoir.
    async fn aspirate_from_reservoir(&mut self, volume_ul: f64, flow_rate: f64) -> LhResult<()>;
}
