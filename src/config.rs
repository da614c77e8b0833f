//! Application configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/gx241.toml` (or the file passed with `--config`)
//! 2. Environment variables prefixed with `GX241_`
//!
//! Nested keys are separated by `__` in environment variables, so
//! `GX241_APPLICATION__LOG_LEVEL=debug` overrides `application.log_level`.
//!
//! # Example
//! ```no_run
//! use gilson_handler::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Handler on {}", config.handler.serial.port);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use lh_core::deck::{HandlerBed, Placeable};
use lh_core::resources::ResourceConfig;
use lh_core::settings::HandlerSettings;
use lh_pipetting::maintenance::DEFAULT_CLEAN_VOLUME_UL;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/gx241.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "GX241_";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Liquid handler hardware settings
    pub handler: HandlerSettings,
    /// Deck layout and fixed positions
    pub deck: DeckConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "GX-241 Liquid Handler".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Deck configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeckConfig {
    /// Handler bed JSON file. Without one, only coordinate positions resolve.
    pub bed: Option<PathBuf>,
    /// Resource file used when no bed is loaded
    pub resources: Option<PathBuf>,
    /// Waste position for priming and cleaning
    pub waste: Placeable,
    /// Wash vial for external washes between campaign items
    pub wash: Option<Placeable>,
    /// Volume flushed per cleaning cycle (uL)
    pub clean_volume_ul: f64,
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            bed: None,
            resources: None,
            waste: Placeable::at(100.0, 100.0, 90.0),
            wash: None,
            clean_volume_ul: DEFAULT_CLEAN_VOLUME_UL,
        }
    }
}

impl DeckConfig {
    /// Load the handler bed, if one is configured.
    pub fn load_bed(&self) -> lh_core::LhResult<Option<HandlerBed>> {
        self.bed.as_ref().map(HandlerBed::load).transpose()
    }

    /// The resource file to track: the bed's, else the configured one.
    pub fn resource_config(&self, bed: Option<&HandlerBed>) -> Option<ResourceConfig> {
        bed.and_then(HandlerBed::resource_config)
            .or_else(|| self.resources.as_ref().map(ResourceConfig::new))
    }
}

impl AppConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Missing keys fall back to the defaults; a missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The layered provider stack, for callers that want to add their own layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        self.handler.validate().map_err(|e| e.to_string())?;

        if !(self.deck.clean_volume_ul.is_finite() && self.deck.clean_volume_ul > 0.0) {
            return Err(format!(
                "Invalid clean_volume_ul {}. Must be positive",
                self.deck.clean_volume_ul
            ));
        }
        if self.deck.clean_volume_ul > self.handler.pump.syringe_volume_ul {
            return Err(format!(
                "clean_volume_ul {} exceeds the {} uL syringe",
                self.deck.clean_volume_ul, self.handler.pump.syringe_volume_ul
            ));
        }

        Ok(())
    }
}
