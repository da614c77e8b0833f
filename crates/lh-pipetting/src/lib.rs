//! Pipetting for the Gilson liquid handler.
//!
//! - [`operations`]: the closed set of pipetting operations, serializable as JSON
//! - [`engine`]: executes operations against any [`PipettingBackend`](lh_core::PipettingBackend)
//! - [`builders`]: droplet, vial and dilution recipes
//! - [`maintenance`]: priming and cleaning sequences
//! - [`prompt`]: operator confirmation seam
//! - [`recording`]: a backend that records calls, for dry runs and tests

pub mod builders;
pub mod engine;
pub mod maintenance;
pub mod operations;
pub mod prompt;
pub mod recording;

pub use builders::{
    volume_to_center_droplet, Destination, DistributionSpec, DropletSpec, FlowPath,
    MixDisplacement, SystemDilutionSpec, VialSpec,
};
pub use engine::PipettingEngine;
pub use operations::{
    load_operations, AirGap, ArmSpec, AspirateSpec, ComponentSpec, DispenseSpec,
    PipettingOperation, TipExitMethod,
};
pub use prompt::{AutoConfirm, ConsolePrompt, OperatorPrompt};
pub use recording::{BackendCall, RecordingBackend};
