//! Pipetting operations.
//!
//! Every action the engine can perform is a variant of [`PipettingOperation`].
//! Operation lists serialize to JSON, internally tagged by `op`:
//!
//! ```json
//! [
//!   {"op": "aspirate", "source": {"kind": "air_gap", "volume": 20}},
//!   {"op": "aspirate", "source": {"kind": "component",
//!                                 "position": {"kind": "named", "rack": "stock", "vial": "A1"},
//!                                 "volume": 100},
//!    "tip_exit": "tip_touch"},
//!   null,
//!   {"op": "comment", "message": "droplet loaded"}
//! ]
//! ```
//!
//! `null` entries are skipped. A tag this build does not know deserializes to
//! [`PipettingOperation::Unrecognized`], which the engine logs and skips.
//!
//! Volumes are in uL, flow rates in mL/min and speeds in mm/s. A rate or speed of
//! `None` means the default from the handler settings.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lh_core::deck::Placeable;
use lh_core::error::LhResult;
use lh_core::settings::MotionSettings;

// =============================================================================
// Shared parameters
// =============================================================================

/// Arm speeds for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmSpec {
    /// XY speed, `None` for the default.
    pub xy_speed: Option<f64>,
    /// Z speed, `None` for the default.
    pub z_speed: Option<f64>,
}

impl ArmSpec {
    /// Explicit speeds.
    pub const fn new(xy_speed: f64, z_speed: f64) -> Self {
        Self {
            xy_speed: Some(xy_speed),
            z_speed: Some(z_speed),
        }
    }

    /// `(xy, z)` with defaults filled in.
    pub fn speeds(&self, motion: &MotionSettings) -> (f64, f64) {
        (
            self.xy_speed.unwrap_or(motion.xy_speed),
            self.z_speed.unwrap_or(motion.z_speed),
        )
    }
}

/// How the needle leaves a vial after touching liquid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipExitMethod {
    /// Straight up from the centre to the access height.
    #[default]
    Center,
    /// Up to just below the access height, touch the vial wall, back to the centre,
    /// then up.
    TipTouch,
    /// Slide to the wall, up to the access height, back to the centre.
    Drag,
    /// Leave the needle where it is.
    None,
}

/// A liquid to draw from, or deliver to, a vial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Where the liquid is.
    pub position: Placeable,
    /// Volume; zero moves the needle without pumping.
    pub volume: f64,
}

impl ComponentSpec {
    /// A component.
    pub fn new(position: Placeable, volume: f64) -> Self {
        Self { position, volume }
    }
}

/// A plug of air.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirGap {
    /// Volume of air.
    pub volume: f64,
    /// Where to take it; `None` for travel height at the current XY.
    #[serde(default)]
    pub position: Option<Placeable>,
}

impl AirGap {
    /// An air gap taken at travel height.
    pub fn new(volume: f64) -> Self {
        Self {
            volume,
            position: None,
        }
    }

    /// An air gap taken at the access height of `position`.
    pub fn at(volume: f64, position: Placeable) -> Self {
        Self {
            volume,
            position: Some(position),
        }
    }
}

/// What an aspirate or dispense moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// Liquid in a vial.
    Component(ComponentSpec),
    /// Air.
    AirGap(AirGap),
}

impl From<ComponentSpec> for Source {
    fn from(c: ComponentSpec) -> Self {
        Source::Component(c)
    }
}

impl From<AirGap> for Source {
    fn from(a: AirGap) -> Self {
        Source::AirGap(a)
    }
}

// =============================================================================
// Operation records
// =============================================================================

/// Draw liquid or air into the needle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AspirateSpec {
    /// What to draw.
    pub source: Source,
    /// Flow rate.
    #[serde(default)]
    pub rate: Option<f64>,
    /// Arm speeds.
    #[serde(default)]
    pub arm: ArmSpec,
    /// Tip exit after drawing liquid. Ignored for air gaps.
    #[serde(default)]
    pub tip_exit: TipExitMethod,
}

impl AspirateSpec {
    /// Aspirate `source` with default rate, speeds and tip exit.
    pub fn new(source: impl Into<Source>) -> Self {
        Self {
            source: source.into(),
            rate: None,
            arm: ArmSpec::default(),
            tip_exit: TipExitMethod::default(),
        }
    }

    /// Set the flow rate.
    pub fn with_rate(mut self, rate: Option<f64>) -> Self {
        self.rate = rate;
        self
    }

    /// Set the arm speeds.
    pub fn with_arm(mut self, arm: ArmSpec) -> Self {
        self.arm = arm;
        self
    }

    /// Set the tip exit method.
    pub fn with_tip_exit(mut self, tip_exit: TipExitMethod) -> Self {
        self.tip_exit = tip_exit;
        self
    }

    /// The dispense that returns what this aspirate drew.
    pub fn cast_to_dispense(&self, free_dispense: bool) -> DispenseSpec {
        DispenseSpec {
            source: self.source.clone(),
            rate: self.rate,
            arm: self.arm,
            tip_exit: self.tip_exit,
            free_dispense,
            dispense_on_edge: false,
        }
    }
}

/// Expel liquid or air from the needle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispenseSpec {
    /// What to expel. The sign of the volume is ignored.
    pub source: Source,
    /// Flow rate.
    #[serde(default)]
    pub rate: Option<f64>,
    /// Arm speeds.
    #[serde(default)]
    pub arm: ArmSpec,
    /// Tip exit after dispensing liquid. Ignored for air gaps.
    #[serde(default)]
    pub tip_exit: TipExitMethod,
    /// Dispense at the access height, clear of the liquid already in the vial.
    #[serde(default)]
    pub free_dispense: bool,
    /// Approach the vial wall instead of the centre.
    #[serde(default)]
    pub dispense_on_edge: bool,
}

impl DispenseSpec {
    /// Dispense `source` with default rate, speeds and tip exit.
    pub fn new(source: impl Into<Source>) -> Self {
        Self {
            source: source.into(),
            rate: None,
            arm: ArmSpec::default(),
            tip_exit: TipExitMethod::default(),
            free_dispense: false,
            dispense_on_edge: false,
        }
    }

    /// Set the flow rate.
    pub fn with_rate(mut self, rate: Option<f64>) -> Self {
        self.rate = rate;
        self
    }

    /// Set the arm speeds.
    pub fn with_arm(mut self, arm: ArmSpec) -> Self {
        self.arm = arm;
        self
    }

    /// Set the tip exit method.
    pub fn with_tip_exit(mut self, tip_exit: TipExitMethod) -> Self {
        self.tip_exit = tip_exit;
        self
    }

    /// Dispense at the access height.
    pub fn free(mut self, free_dispense: bool) -> Self {
        self.free_dispense = free_dispense;
        self
    }
}

/// Empty the whole syringe at a position by homing the pump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispenseAllSpec {
    /// Where to empty the syringe.
    pub position: Placeable,
    /// Arm speeds.
    #[serde(default)]
    pub arm: ArmSpec,
    /// Tip exit afterwards.
    #[serde(default)]
    pub tip_exit: TipExitMethod,
    /// Dispense at the access height.
    #[serde(default)]
    pub free_dispense: bool,
    /// Approach the vial wall instead of the centre.
    #[serde(default)]
    pub dispense_on_edge: bool,
}

impl DispenseAllSpec {
    /// Empty at `position` with defaults.
    pub fn new(position: Placeable) -> Self {
        Self {
            position,
            arm: ArmSpec::default(),
            tip_exit: TipExitMethod::default(),
            free_dispense: false,
            dispense_on_edge: false,
        }
    }
}

/// Draw system fluid from the reservoir.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AspirateSystemSpec {
    /// Volume of system fluid.
    pub volume: f64,
    /// Flow rate.
    #[serde(default)]
    pub rate: Option<f64>,
}

/// A vial to mix in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixLocation {
    /// The vial.
    pub position: Placeable,
    /// Arm speeds.
    #[serde(default)]
    pub arm: ArmSpec,
    /// Tip exit after mixing.
    #[serde(default)]
    pub tip_exit: TipExitMethod,
}

impl MixLocation {
    /// Mix in `position` with default speeds and tip exit.
    pub fn new(position: Placeable) -> Self {
        Self {
            position,
            arm: ArmSpec::default(),
            tip_exit: TipExitMethod::default(),
        }
    }
}

fn default_iterations() -> u32 {
    1
}

fn default_mix_blowout() -> Option<f64> {
    Some(10.0)
}

fn default_true() -> bool {
    true
}

fn default_intervention_title() -> String {
    "User action required".to_string()
}

/// Repeated aspirate/dispense cycles, in a vial or in the liquid line.
///
/// A zero displacement or zero iterations makes the whole operation a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixSpec {
    /// Volume moved each way per cycle.
    pub displacement: f64,
    /// Flow rate.
    #[serde(default)]
    pub rate: Option<f64>,
    /// Number of cycles.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Vial to mix in; `None` mixes in the liquid line at travel height.
    #[serde(default)]
    pub location: Option<MixLocation>,
    /// Air drawn before mixing and expelled afterwards.
    #[serde(default = "default_mix_blowout")]
    pub blowout: Option<f64>,
}

impl MixSpec {
    /// Mix in the liquid line with no blow-out.
    pub fn in_line(displacement: f64, rate: Option<f64>, iterations: u32) -> Self {
        Self {
            displacement,
            rate,
            iterations,
            location: None,
            blowout: None,
        }
    }
}

/// Dip the outside of the needle into one or more wash vials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalWashSpec {
    /// Wash vials, visited in order.
    pub positions: Vec<Placeable>,
    /// Arm speeds.
    #[serde(default)]
    pub arm: ArmSpec,
    /// Tip exit after each dip.
    #[serde(default)]
    pub tip_exit: TipExitMethod,
    /// Air gap protecting the needle contents, taken before and expelled after each
    /// vial.
    #[serde(default)]
    pub air_gap: Option<AspirateSpec>,
    /// Dips per vial.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

impl ExternalWashSpec {
    /// Wash once in each of `positions` with defaults.
    pub fn new(positions: Vec<Placeable>) -> Self {
        Self {
            positions,
            arm: ArmSpec::default(),
            tip_exit: TipExitMethod::default(),
            air_gap: None,
            iterations: 1,
        }
    }
}

/// Rinse the inside of the needle by mixing in a wash vial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalWashSpec {
    /// Volume moved each way per cycle.
    pub displacement: f64,
    /// The wash vial.
    pub location: Placeable,
    /// Number of cycles.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Flow rate.
    #[serde(default)]
    pub rate: Option<f64>,
    /// Air drawn before washing and expelled afterwards.
    #[serde(default)]
    pub blowout: Option<f64>,
    /// Arm speeds.
    #[serde(default)]
    pub arm: ArmSpec,
    /// Tip exit afterwards.
    #[serde(default)]
    pub tip_exit: TipExitMethod,
}

impl InternalWashSpec {
    /// The equivalent mix.
    pub fn cast_to_mix(&self) -> MixSpec {
        MixSpec {
            displacement: self.displacement,
            rate: self.rate,
            iterations: self.iterations,
            location: Some(MixLocation {
                position: self.location.clone(),
                arm: self.arm,
                tip_exit: self.tip_exit,
            }),
            blowout: self.blowout,
        }
    }
}

/// Flush system fluid through the needle into a waste position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalCleanSpec {
    /// Volume flushed per cycle.
    pub cleaning_volume: f64,
    /// Where to flush.
    pub location: Placeable,
    /// Number of cycles.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Flow rate.
    #[serde(default)]
    pub rate: Option<f64>,
    /// Dispense at the access height.
    #[serde(default)]
    pub free_dispense: bool,
    /// Approach the vial wall instead of the centre.
    #[serde(default)]
    pub dispense_on_edge: bool,
    /// Empty the syringe before the first cycle.
    #[serde(default = "default_true")]
    pub pre_flush: bool,
    /// Arm speeds.
    #[serde(default)]
    pub arm: ArmSpec,
    /// Tip exit afterwards.
    #[serde(default)]
    pub tip_exit: TipExitMethod,
}

impl InternalCleanSpec {
    /// One pre-flushed cycle of `cleaning_volume` at `location`.
    pub fn new(cleaning_volume: f64, location: Placeable) -> Self {
        Self {
            cleaning_volume,
            location,
            iterations: 1,
            rate: None,
            free_dispense: false,
            dispense_on_edge: false,
            pre_flush: true,
            arm: ArmSpec::default(),
            tip_exit: TipExitMethod::default(),
        }
    }
}

/// Stop until the operator acknowledges a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIntervention {
    /// Message shown to the operator.
    pub prompt: String,
    /// Dialog title.
    #[serde(default = "default_intervention_title")]
    pub title: String,
    /// Home the arm before prompting, out of the operator's way.
    #[serde(default = "default_true")]
    pub home_arm: bool,
}

/// Pause without touching the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wait {
    /// How long, e.g. `"90s"` or `"2m"`.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// A log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// The message.
    pub message: String,
}

// =============================================================================
// Operation
// =============================================================================

/// One step of a pipetting sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PipettingOperation {
    /// Draw liquid or air.
    Aspirate(AspirateSpec),
    /// Expel liquid or air.
    Dispense(DispenseSpec),
    /// Empty the syringe.
    DispenseAll(DispenseAllSpec),
    /// Draw from the reservoir.
    AspirateSystem(AspirateSystemSpec),
    /// Mix.
    Mix(MixSpec),
    /// Dip the needle in wash vials.
    ExternalWash(ExternalWashSpec),
    /// Poke the needle into a pad; executed like an external wash.
    PokeNeedle(ExternalWashSpec),
    /// Mix in a wash vial.
    InternalWash(InternalWashSpec),
    /// Flush system fluid to waste.
    InternalClean(InternalCleanSpec),
    /// Wait for the operator.
    UserIntervention(UserIntervention),
    /// Sleep.
    Wait(Wait),
    /// Log a message.
    Comment(Comment),
    /// A tag this build does not know.
    #[serde(other)]
    Unrecognized,
}

impl PipettingOperation {
    /// The `op` tag.
    pub fn name(&self) -> &'static str {
        match self {
            PipettingOperation::Aspirate(_) => "aspirate",
            PipettingOperation::Dispense(_) => "dispense",
            PipettingOperation::DispenseAll(_) => "dispense_all",
            PipettingOperation::AspirateSystem(_) => "aspirate_system",
            PipettingOperation::Mix(_) => "mix",
            PipettingOperation::ExternalWash(_) => "external_wash",
            PipettingOperation::PokeNeedle(_) => "poke_needle",
            PipettingOperation::InternalWash(_) => "internal_wash",
            PipettingOperation::InternalClean(_) => "internal_clean",
            PipettingOperation::UserIntervention(_) => "user_intervention",
            PipettingOperation::Wait(_) => "wait",
            PipettingOperation::Comment(_) => "comment",
            PipettingOperation::Unrecognized => "unrecognized",
        }
    }

    /// A comment operation.
    pub fn comment(message: impl Into<String>) -> Self {
        PipettingOperation::Comment(Comment {
            message: message.into(),
        })
    }
}

macro_rules! operation_from {
    ($($spec:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$spec> for PipettingOperation {
                fn from(spec: $spec) -> Self {
                    PipettingOperation::$variant(spec)
                }
            }
        )*
    };
}

operation_from!(
    AspirateSpec => Aspirate,
    DispenseSpec => Dispense,
    DispenseAllSpec => DispenseAll,
    AspirateSystemSpec => AspirateSystem,
    MixSpec => Mix,
    ExternalWashSpec => ExternalWash,
    InternalWashSpec => InternalWash,
    InternalCleanSpec => InternalClean,
    UserIntervention => UserIntervention,
    Wait => Wait,
    Comment => Comment,
);

/// Read an operation list from a JSON file. `null` entries are kept as `None`.
pub fn load_operations(path: impl AsRef<Path>) -> LhResult<Vec<Option<PipettingOperation>>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_list_from_json() {
        let ops: Vec<Option<PipettingOperation>> = serde_json::from_str(
            r#"[
                {"op": "aspirate", "source": {"kind": "air_gap", "volume": 20}},
                {"op": "dispense",
                 "source": {"kind": "component",
                            "position": {"kind": "coordinate", "x": 10, "y": 20, "z": 30},
                            "volume": -50},
                 "free_dispense": true},
                null,
                {"op": "wait", "duration": "90s"},
                {"op": "spectrometer_scan", "integration_ms": 100}
            ]"#,
        )
        .unwrap();

        assert_eq!(ops.len(), 5);
        assert!(matches!(
            ops[0],
            Some(PipettingOperation::Aspirate(AspirateSpec {
                source: Source::AirGap(_),
                tip_exit: TipExitMethod::Center,
                ..
            }))
        ));
        match &ops[1] {
            Some(PipettingOperation::Dispense(spec)) => {
                assert!(spec.free_dispense);
                assert!(!spec.dispense_on_edge);
                assert!(spec.rate.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ops[2].is_none());
        match &ops[3] {
            Some(PipettingOperation::Wait(w)) => assert_eq!(w.duration, Duration::from_secs(90)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(ops[4], Some(PipettingOperation::Unrecognized)));
    }

    #[test]
    fn record_defaults() {
        let mix: MixSpec = serde_json::from_str(r#"{"displacement": 50}"#).unwrap();
        assert_eq!(mix.iterations, 1);
        assert_eq!(mix.blowout, Some(10.0));
        assert!(mix.location.is_none());

        let clean: InternalCleanSpec = serde_json::from_str(
            r#"{"cleaning_volume": 200, "location": {"kind": "named", "rack": "waste", "vial": "1"}}"#,
        )
        .unwrap();
        assert!(clean.pre_flush);
        assert_eq!(clean.iterations, 1);

        let ui: UserIntervention = serde_json::from_str(r#"{"prompt": "Load rack"}"#).unwrap();
        assert_eq!(ui.title, "User action required");
        assert!(ui.home_arm);
    }

    #[test]
    fn internal_wash_is_a_located_mix() {
        let wash = InternalWashSpec {
            displacement: 100.0,
            location: Placeable::at(1.0, 2.0, 3.0),
            iterations: 3,
            rate: Some(2.0),
            blowout: None,
            arm: ArmSpec::new(40.0, 20.0),
            tip_exit: TipExitMethod::Drag,
        };
        let mix = wash.cast_to_mix();
        assert_eq!(mix.displacement, 100.0);
        assert_eq!(mix.iterations, 3);
        assert!(mix.blowout.is_none());
        let location = mix.location.unwrap();
        assert_eq!(location.tip_exit, TipExitMethod::Drag);
        assert_eq!(location.arm.speeds(&MotionSettings::default()), (40.0, 20.0));
    }

    #[test]
    fn arm_speeds_fall_back_to_settings() {
        let motion = MotionSettings::default();
        assert_eq!(ArmSpec::default().speeds(&motion), (50.0, 25.0));
        let half = ArmSpec {
            xy_speed: Some(10.0),
            z_speed: None,
        };
        assert_eq!(half.speeds(&motion), (10.0, 25.0));
    }
}
