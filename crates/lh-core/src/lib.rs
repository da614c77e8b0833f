//! Core types and traits for the Gilson liquid-handler stack.
//!
//! - [`error`]: the shared error taxonomy
//! - [`serial`]: async serial port plumbing
//! - [`settings`]: immutable handler settings
//! - [`deck`]: deck geometry and placeables
//! - [`resources`]: persisted consumables tracking
//! - [`capabilities`]: the backend trait the pipetting engine drives

pub mod capabilities;
pub mod deck;
pub mod error;
pub mod resources;
pub mod serial;
pub mod settings;

pub use capabilities::PipettingBackend;
pub use deck::{
    Coordinate, DeckLayout, DeckSite, HandlerBed, Placeable, Point2D, ResolvedPosition,
    ShiftingPlaceable, TravelBounds,
};
pub use error::{LhResult, LiquidHandlerError};
pub use resources::{ResourceConfig, ResourceTracker, SYSTEM_FLUID_KEY};
pub use settings::HandlerSettings;
