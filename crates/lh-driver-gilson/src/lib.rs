//! Gilson GX-241 II liquid handler driver.
//!
//! [`Gx241Driver`] drives the arm, the GX syringe pump and the GX direct
//! injector over one GSIOC bus and implements
//! [`PipettingBackend`](lh_core::PipettingBackend) for the pipetting engine.

pub mod gx241;

pub use gx241::{DeviceErrorState, GilsonDevice, Gx241Driver};
