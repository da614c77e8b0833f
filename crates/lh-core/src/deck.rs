//! Deck geometry: points, travel bounds, placeables and deck layouts.
//!
//! A [`Placeable`] is anything the arm can visit. Resolving one yields a
//! [`ResolvedPosition`]: the XY point, the Z height at which the needle enters the
//! vial (access), the Z height at which liquid is drawn or expelled (transfer), and
//! an XY point on the vial edge for tip touches.
//!
//! Named positions are resolved through a [`DeckLayout`]. [`HandlerBed`] is the
//! file-backed layout: travel bounds plus a flat table of rack/vial sites.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{LhResult, LiquidHandlerError};
use crate::resources::ResourceConfig;

// =============================================================================
// Geometry
// =============================================================================

/// A point on the deck plane (mm).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2D {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

impl Point2D {
    /// Create a point.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl std::ops::Add for Point2D {
    type Output = Point2D;

    fn add(self, rhs: Self) -> Self::Output {
        Point2D::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl fmt::Display for Point2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Reachable travel range of the arm, `[min, max]` per axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TravelBounds {
    /// X range.
    pub x_bounds: (f64, f64),
    /// Y range.
    pub y_bounds: (f64, f64),
    /// Z range.
    pub z_bounds: (f64, f64),
}

impl TravelBounds {
    /// Clamp a point into the XY range.
    pub fn clamp_xy(&self, point: Point2D) -> Point2D {
        Point2D::new(
            point.x.clamp(self.x_bounds.0, self.x_bounds.1),
            point.y.clamp(self.y_bounds.0, self.y_bounds.1),
        )
    }

    /// Clamp a height into the Z range.
    pub fn clamp_z(&self, z: f64) -> f64 {
        z.clamp(self.z_bounds.0, self.z_bounds.1)
    }

    /// Whether every axis range is non-empty.
    pub fn is_valid(&self) -> bool {
        self.x_bounds.0 <= self.x_bounds.1
            && self.y_bounds.0 <= self.y_bounds.1
            && self.z_bounds.0 <= self.z_bounds.1
    }
}

/// A placeable reduced to the numbers the arm needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPosition {
    /// Centre of the vial.
    pub xy: Point2D,
    /// Height at which the needle enters the vial.
    pub access_z: f64,
    /// Height at which liquid is drawn or expelled.
    pub transfer_z: f64,
    /// A point on the vial wall.
    pub edge: Point2D,
}

impl ResolvedPosition {
    /// XY to approach, either the centre or the edge.
    pub fn approach(&self, use_edge: bool) -> Point2D {
        if use_edge {
            self.edge
        } else {
            self.xy
        }
    }
}

/// Resolves named positions.
pub trait DeckLayout: Send + Sync + fmt::Debug {
    /// Resolve a rack/vial pair.
    fn locate(&self, rack: &str, vial: &str) -> LhResult<ResolvedPosition>;

    /// Arm travel range, if the layout defines one.
    fn bounds(&self) -> Option<TravelBounds>;

    /// Directory the layout was loaded from. Resource paths starting with `~/`
    /// resolve against it.
    fn directory(&self) -> Option<&Path> {
        None
    }
}

// =============================================================================
// Placeables
// =============================================================================

/// A position given by exact coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// X (mm).
    pub x: f64,
    /// Y (mm).
    pub y: f64,
    /// Both access and transfer height (mm).
    pub z: f64,
    /// X distance from the centre to the edge used for tip touches.
    #[serde(default)]
    pub edge_offset: f64,
}

impl Coordinate {
    /// Create a coordinate with no edge offset.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            edge_offset: 0.0,
        }
    }

    fn resolve(&self) -> ResolvedPosition {
        let xy = Point2D::new(self.x, self.y);
        ResolvedPosition {
            xy,
            access_z: self.z,
            transfer_z: self.z,
            edge: xy + Point2D::new(self.edge_offset, 0.0),
        }
    }
}

/// Shared handle to a [`ShiftingPlaceable`].
pub type SharedShifting = Arc<Mutex<ShiftingPlaceable>>;

/// Anything the arm can be sent to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placeable {
    /// Exact coordinates.
    Coordinate(Coordinate),
    /// A vial in a rack, resolved by the deck layout.
    Named {
        /// Rack identifier.
        rack: String,
        /// Vial identifier.
        vial: String,
    },
    /// A cursor over several placeables, shared by everything that refers to it.
    #[serde(skip)]
    Shifting(SharedShifting),
}

impl Placeable {
    /// A coordinate placeable.
    pub const fn at(x: f64, y: f64, z: f64) -> Self {
        Placeable::Coordinate(Coordinate::new(x, y, z))
    }

    /// A named placeable.
    pub fn named(rack: impl Into<String>, vial: impl Into<String>) -> Self {
        Placeable::Named {
            rack: rack.into(),
            vial: vial.into(),
        }
    }

    /// Wrap a shifting placeable in a shared handle.
    pub fn shifting(shifting: ShiftingPlaceable) -> Self {
        Placeable::Shifting(Arc::new(Mutex::new(shifting)))
    }

    /// Resolve to concrete coordinates.
    ///
    /// # Errors
    ///
    /// [`LiquidHandlerError::NoDeckLoaded`] for a named position without a deck,
    /// [`LiquidHandlerError::PlaceableExhausted`] for an exhausted shifting placeable.
    pub fn resolve(&self, deck: Option<&dyn DeckLayout>) -> LhResult<ResolvedPosition> {
        match self {
            Placeable::Coordinate(c) => Ok(c.resolve()),
            Placeable::Named { rack, vial } => deck
                .ok_or(LiquidHandlerError::NoDeckLoaded)?
                .locate(rack, vial),
            Placeable::Shifting(shared) => {
                let current = shared.lock().current()?.clone();
                current.resolve(deck)
            }
        }
    }

    /// Short human-readable name for logs.
    pub fn label(&self) -> String {
        match self {
            Placeable::Coordinate(c) => format!("({}, {}, {})", c.x, c.y, c.z),
            Placeable::Named { rack, vial } => format!("{rack}/{vial}"),
            Placeable::Shifting(shared) => {
                let guard = shared.lock();
                match guard.current() {
                    Ok(place) => place.label(),
                    Err(_) => "<exhausted>".to_string(),
                }
            }
        }
    }
}

impl From<Coordinate> for Placeable {
    fn from(c: Coordinate) -> Self {
        Placeable::Coordinate(c)
    }
}

/// An ordered list of placeables with a cursor.
///
/// Used for repeated reservoirs: when one vial runs dry the caller advances to the
/// next. The cursor is `None` once it has moved past either end; dereferencing it
/// then fails with [`LiquidHandlerError::PlaceableExhausted`] until
/// [`reset`](Self::reset) or [`last`](Self::last) is called.
#[derive(Debug, Clone, Default)]
pub struct ShiftingPlaceable {
    places: Vec<Placeable>,
    index: Option<usize>,
}

impl ShiftingPlaceable {
    /// Create a cursor positioned on the first entry.
    pub fn new(places: Vec<Placeable>) -> Self {
        let index = if places.is_empty() { None } else { Some(0) };
        Self { places, index }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.places.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.places.is_empty()
    }

    /// Cursor position, `None` when exhausted.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Whether the cursor points at an entry.
    pub fn index_is_valid(&self) -> bool {
        self.index.is_some_and(|i| i < self.places.len())
    }

    /// The entry under the cursor.
    pub fn current(&self) -> LhResult<&Placeable> {
        self.index
            .and_then(|i| self.places.get(i))
            .ok_or(LiquidHandlerError::PlaceableExhausted)
    }

    /// Move to the next entry. Returns whether the cursor is still valid.
    pub fn advance(&mut self) -> bool {
        self.index = self.index.map(|i| i + 1).filter(|&i| i < self.places.len());
        self.index_is_valid()
    }

    /// Move to the previous entry. Returns whether the cursor is still valid.
    pub fn retreat(&mut self) -> bool {
        self.index = self.index.and_then(|i| i.checked_sub(1));
        self.index_is_valid()
    }

    /// Move to the first entry.
    pub fn reset(&mut self) -> bool {
        self.index = if self.places.is_empty() { None } else { Some(0) };
        self.index_is_valid()
    }

    /// Move to the last entry.
    pub fn last(&mut self) -> bool {
        self.index = self.places.len().checked_sub(1);
        self.index_is_valid()
    }

    /// Remove the entry at `index`.
    ///
    /// The cursor keeps pointing at the same entry when an earlier one is removed.
    /// Removing the entry under the cursor moves it onto the following entry.
    pub fn remove(&mut self, index: usize) -> LhResult<Placeable> {
        if index >= self.places.len() {
            return Err(LiquidHandlerError::invalid(format!(
                "index {index} outside shifting placeable of length {}",
                self.places.len()
            )));
        }
        let removed = self.places.remove(index);
        match self.index {
            Some(current) if index < current => self.index = Some(current - 1),
            Some(current) if current >= self.places.len() => self.index = None,
            _ => {}
        }
        Ok(removed)
    }

    /// Insert an entry at `index`, or append when `None`.
    ///
    /// The cursor keeps pointing at the same entry.
    pub fn insert(&mut self, place: Placeable, index: Option<usize>) -> LhResult<()> {
        let at = index.unwrap_or(self.places.len());
        if at > self.places.len() {
            return Err(LiquidHandlerError::invalid(format!(
                "index {at} outside shifting placeable of length {}",
                self.places.len()
            )));
        }
        self.places.insert(at, place);
        if let Some(current) = self.index {
            if at <= current {
                self.index = Some(current + 1);
            }
        }
        Ok(())
    }

    /// Append entries. An exhausted cursor stays exhausted.
    pub fn extend(&mut self, places: impl IntoIterator<Item = Placeable>) {
        self.places.extend(places);
    }
}

// =============================================================================
// HandlerBed
// =============================================================================

/// Geometry of a single named site on the deck.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeckSite {
    /// Centre X.
    pub x: f64,
    /// Centre Y.
    pub y: f64,
    /// Access height.
    pub access_z: f64,
    /// Transfer height.
    pub transfer_z: f64,
    /// Edge point; defaults to the centre.
    #[serde(default)]
    pub edge: Option<Point2D>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BedFile {
    x_bounds: (f64, f64),
    y_bounds: (f64, f64),
    z_bounds: (f64, f64),
    #[serde(default)]
    sites: BTreeMap<String, BTreeMap<String, DeckSite>>,
    #[serde(default)]
    resource_cfg: Option<String>,
}

/// File-backed deck layout.
#[derive(Debug, Clone)]
pub struct HandlerBed {
    bounds: TravelBounds,
    sites: BTreeMap<String, BTreeMap<String, DeckSite>>,
    directory: Option<PathBuf>,
    resource_cfg_path: Option<String>,
}

/// Resource file used when the bed does not name one.
pub const DEFAULT_RESOURCE_CFG: &str = "~/resources_cfg.json";

impl HandlerBed {
    /// A bed with bounds and no named sites.
    pub fn new(bounds: TravelBounds) -> Self {
        Self {
            bounds,
            sites: BTreeMap::new(),
            directory: None,
            resource_cfg_path: Some(DEFAULT_RESOURCE_CFG.to_string()),
        }
    }

    /// Load a bed from a JSON file.
    ///
    /// The file holds `x_bounds`, `y_bounds`, `z_bounds`, an optional `sites`
    /// table (`rack -> vial -> site`) and an optional `resource_cfg` path.
    pub fn load(path: impl AsRef<Path>) -> LhResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let file: BedFile = serde_json::from_str(&text)?;
        let bounds = TravelBounds {
            x_bounds: file.x_bounds,
            y_bounds: file.y_bounds,
            z_bounds: file.z_bounds,
        };
        if !bounds.is_valid() {
            return Err(LiquidHandlerError::invalid(format!(
                "bed {} has an empty travel range",
                path.display()
            )));
        }
        tracing::info!(
            path = %path.display(),
            racks = file.sites.len(),
            "Loaded handler bed X:{:?}, Y:{:?}, Z:{:?}",
            bounds.x_bounds,
            bounds.y_bounds,
            bounds.z_bounds
        );
        Ok(Self {
            bounds,
            sites: file.sites,
            directory: path.parent().map(Path::to_path_buf),
            resource_cfg_path: Some(
                file.resource_cfg
                    .unwrap_or_else(|| DEFAULT_RESOURCE_CFG.to_string()),
            ),
        })
    }

    /// Register a named site.
    pub fn add_site(&mut self, rack: impl Into<String>, vial: impl Into<String>, site: DeckSite) {
        self.sites
            .entry(rack.into())
            .or_default()
            .insert(vial.into(), site);
    }

    /// The resource file tied to this bed, if its path can be resolved.
    pub fn resource_config(&self) -> Option<ResourceConfig> {
        let raw = self.resource_cfg_path.as_deref()?;
        ResourceConfig::resolve(raw, self.directory.as_deref())
    }
}

impl DeckLayout for HandlerBed {
    fn locate(&self, rack: &str, vial: &str) -> LhResult<ResolvedPosition> {
        let site = self
            .sites
            .get(rack)
            .and_then(|r| r.get(vial))
            .ok_or_else(|| LiquidHandlerError::UnknownLocation {
                rack: rack.to_string(),
                vial: vial.to_string(),
            })?;
        let xy = Point2D::new(site.x, site.y);
        Ok(ResolvedPosition {
            xy,
            access_z: site.access_z,
            transfer_z: site.transfer_z,
            edge: site.edge.unwrap_or(xy),
        })
    }

    fn bounds(&self) -> Option<TravelBounds> {
        Some(self.bounds)
    }

    fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> TravelBounds {
        TravelBounds {
            x_bounds: (0.0, 400.0),
            y_bounds: (0.0, 300.0),
            z_bounds: (10.0, 120.0),
        }
    }

    #[test]
    fn clamping() {
        let b = bounds();
        assert_eq!(b.clamp_xy(Point2D::new(-5.0, 350.0)), Point2D::new(0.0, 300.0));
        assert_eq!(b.clamp_z(125.0), 120.0);
        assert_eq!(b.clamp_z(2.0), 10.0);
    }

    #[test]
    fn coordinate_edge_uses_offset() {
        let place = Placeable::Coordinate(Coordinate {
            x: 10.0,
            y: 20.0,
            z: 50.0,
            edge_offset: 4.0,
        });
        let resolved = place.resolve(None).unwrap();
        assert_eq!(resolved.access_z, 50.0);
        assert_eq!(resolved.transfer_z, 50.0);
        assert_eq!(resolved.edge, Point2D::new(14.0, 20.0));
        assert_eq!(resolved.approach(true), Point2D::new(14.0, 20.0));
    }

    #[test]
    fn named_requires_deck() {
        let place = Placeable::named("Stock", "A1");
        assert!(matches!(
            place.resolve(None),
            Err(LiquidHandlerError::NoDeckLoaded)
        ));

        let mut bed = HandlerBed::new(bounds());
        bed.add_site(
            "Stock",
            "A1",
            DeckSite {
                x: 30.0,
                y: 40.0,
                access_z: 90.0,
                transfer_z: 60.0,
                edge: None,
            },
        );
        let resolved = place.resolve(Some(&bed)).unwrap();
        assert_eq!(resolved.xy, Point2D::new(30.0, 40.0));
        assert_eq!(resolved.transfer_z, 60.0);
        assert_eq!(resolved.edge, resolved.xy);

        let missing = Placeable::named("Stock", "B9");
        assert!(matches!(
            missing.resolve(Some(&bed)),
            Err(LiquidHandlerError::UnknownLocation { .. })
        ));
    }

    #[test]
    fn shifting_cursor_walks_and_exhausts() {
        let mut shifting = ShiftingPlaceable::new(vec![
            Placeable::at(1.0, 0.0, 0.0),
            Placeable::at(2.0, 0.0, 0.0),
        ]);
        assert_eq!(shifting.index(), Some(0));
        assert!(shifting.advance());
        assert!(!shifting.advance());
        assert!(matches!(
            shifting.current(),
            Err(LiquidHandlerError::PlaceableExhausted)
        ));
        // stays exhausted
        assert!(!shifting.advance());
        assert!(shifting.last());
        assert_eq!(shifting.index(), Some(1));
        assert!(shifting.retreat());
        assert!(!shifting.retreat());
        assert!(shifting.reset());
    }

    #[test]
    fn shifting_remove_and_insert_track_current_entry() {
        let mut shifting = ShiftingPlaceable::new(vec![
            Placeable::at(1.0, 0.0, 0.0),
            Placeable::at(2.0, 0.0, 0.0),
            Placeable::at(3.0, 0.0, 0.0),
        ]);
        shifting.advance();
        assert_eq!(shifting.current().unwrap().label(), "(2, 0, 0)");

        shifting.insert(Placeable::at(0.0, 0.0, 0.0), Some(0)).unwrap();
        assert_eq!(shifting.current().unwrap().label(), "(2, 0, 0)");

        shifting.insert(Placeable::at(9.0, 0.0, 0.0), None).unwrap();
        assert_eq!(shifting.current().unwrap().label(), "(2, 0, 0)");

        shifting.remove(0).unwrap();
        assert_eq!(shifting.current().unwrap().label(), "(2, 0, 0)");

        // removing the current entry moves onto the following one
        shifting.remove(1).unwrap();
        assert_eq!(shifting.current().unwrap().label(), "(3, 0, 0)");

        assert!(shifting.remove(10).is_err());
    }

    #[test]
    fn shared_shifting_is_seen_by_all_holders() {
        let place = Placeable::shifting(ShiftingPlaceable::new(vec![
            Placeable::at(1.0, 0.0, 50.0),
            Placeable::at(2.0, 0.0, 50.0),
        ]));
        let alias = place.clone();
        if let Placeable::Shifting(shared) = &place {
            shared.lock().advance();
        }
        assert_eq!(alias.resolve(None).unwrap().xy, Point2D::new(2.0, 0.0));
    }

    #[test]
    fn placeable_json_uses_kind_tag() {
        let place: Placeable =
            serde_json::from_str(r#"{"kind": "coordinate", "x": 1, "y": 2, "z": 3}"#).unwrap();
        assert_eq!(place.label(), "(1, 2, 3)");
        let named: Placeable =
            serde_json::from_str(r#"{"kind": "named", "rack": "R", "vial": "A1"}"#).unwrap();
        assert_eq!(named.label(), "R/A1");
    }

    #[test]
    fn bed_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bed.json");
        std::fs::write(
            &path,
            r#"{
                "x_bounds": [0, 400], "y_bounds": [0, 300], "z_bounds": [10, 120],
                "sites": {"Waste": {"1": {"x": 100, "y": 100, "access_z": 90, "transfer_z": 90}}}
            }"#,
        )
        .unwrap();
        let bed = HandlerBed::load(&path).unwrap();
        assert_eq!(bed.bounds(), Some(bounds()));
        assert_eq!(bed.directory(), Some(dir.path()));
        assert!(bed.locate("Waste", "1").is_ok());
        let cfg = bed.resource_config().unwrap();
        assert_eq!(cfg.path(), dir.path().join("resources_cfg.json"));
    }
}
