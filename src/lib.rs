//! Control stack for the Gilson GX-241 liquid handler.
//!
//! The workspace crates do the work; this crate wires them together for the
//! `gx241` binary:
//!
//! - [`lh_core`]: errors, settings, deck geometry, resource tracking
//! - [`lh_gsioc`]: GSIOC transport, command codex, simulated bus
//! - [`lh_driver_gilson`]: the GX-241 driver
//! - [`lh_pipetting`]: operations, engine, builders, maintenance
//! - [`lh_experiment`]: campaign scheduler
//!
//! Local modules:
//!
//! - [`config`]: figment-based application configuration
//! - [`logging`]: tracing-subscriber setup
//! - [`runner`]: study files and the campaign actions that run them

pub mod config;
pub mod logging;
pub mod runner;

pub use lh_core;
pub use lh_driver_gilson;
pub use lh_experiment;
pub use lh_gsioc;
pub use lh_pipetting;

pub use config::AppConfig;
pub use runner::{load_study, PipettingCampaign, StudyItem};
