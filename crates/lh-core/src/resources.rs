//! Persisted resource configuration.
//!
//! A small JSON object on disk tracking consumables, most importantly the
//! remaining system fluid. The driver decrements it as the reservoir is drawn
//! from, and the campaign scheduler reads it before every item.
//!
//! Reads treat a missing file as an empty object. Writes report success as a
//! `bool` and never fail the caller.

use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::LhResult;

/// Key holding the remaining system fluid (mL).
pub const SYSTEM_FLUID_KEY: &str = "system_fluid_volume_mL";

/// Something that can report how much system fluid is left.
pub trait ResourceTracker: Send + Sync {
    /// Remaining system fluid in mL, `None` when unknown.
    fn remaining_system_fluid_ml(&self) -> Option<f64>;
}

/// JSON key-value file for consumables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConfig {
    path: PathBuf,
}

impl ResourceConfig {
    /// Use the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolve a configured path. `~/` is relative to `base_dir` (the deck's load
    /// directory); without a base directory such a path cannot be resolved.
    pub fn resolve(raw: &str, base_dir: Option<&Path>) -> Option<Self> {
        match raw.strip_prefix("~/") {
            Some(rest) => base_dir.map(|dir| Self::new(dir.join(rest))),
            None => Some(Self::new(raw)),
        }
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole object. A missing file reads as empty.
    pub fn read(&self) -> LhResult<Map<String, Value>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => Ok(map),
                _ => Ok(Map::new()),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Resource file missing, using empty config");
                Ok(Map::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the file. Returns whether the write succeeded.
    pub fn write(&self, values: &Map<String, Value>) -> bool {
        let text = match serde_json::to_string_pretty(values) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to encode resource config");
                return false;
            }
        };
        match std::fs::write(&self.path, text) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to write resource config");
                false
            }
        }
    }

    /// Numeric value of `key`, if present and numeric.
    pub fn get_number(&self, key: &str) -> Option<f64> {
        match self.read() {
            Ok(map) => map.get(key).and_then(Value::as_f64),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read resource config");
                None
            }
        }
    }

    /// Set `key` to `value`, keeping other keys.
    pub fn set_value(&self, key: &str, value: Value) -> bool {
        let mut map = match self.read() {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read resource config");
                return false;
            }
        };
        map.insert(key.to_string(), value);
        self.write(&map)
    }

    /// Apply `update` to the numeric value of `key`.
    ///
    /// When the key is missing, `default` is used as the starting value; without a
    /// default nothing is written and `false` is returned.
    pub fn update_number(
        &self,
        key: &str,
        default: Option<f64>,
        update: impl FnOnce(f64) -> f64,
    ) -> bool {
        let mut map = match self.read() {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read resource config");
                return false;
            }
        };
        let Some(current) = map.get(key).and_then(Value::as_f64).or(default) else {
            return false;
        };
        let Some(next) = serde_json::Number::from_f64(update(current)) else {
            return false;
        };
        map.insert(key.to_string(), Value::Number(next));
        self.write(&map)
    }
}

impl ResourceTracker for ResourceConfig {
    fn remaining_system_fluid_ml(&self) -> Option<f64> {
        self.get_number(SYSTEM_FLUID_KEY)
    }
}
