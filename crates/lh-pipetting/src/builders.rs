//! Compound pipetting builders.
//!
//! Multi-step recipes built from the primitive operations: load a droplet into the
//! liquid line, deliver it to several vials, assemble a vial from components,
//! dilute a stock with system fluid.

use serde::{Deserialize, Serialize};
use tracing::info;

use lh_core::capabilities::PipettingBackend;
use lh_core::deck::Placeable;
use lh_core::error::{LhResult, LiquidHandlerError};

use crate::engine::PipettingEngine;
use crate::operations::{
    AirGap, ArmSpec, AspirateSpec, AspirateSystemSpec, ComponentSpec, DispenseAllSpec,
    DispenseSpec, ExternalWashSpec, MixLocation, MixSpec, PipettingOperation, TipExitMethod,
};

/// How far to move liquid while mixing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum MixDisplacement {
    /// Do not mix.
    #[default]
    Disabled,
    /// A fixed volume (uL).
    Absolute(f64),
    /// A multiple of the liquid volume being mixed.
    RelativeToDroplet(f64),
}

impl MixDisplacement {
    /// From the signed convention: negative is a fraction of the droplet, positive
    /// is a volume, zero disables mixing.
    pub fn from_signed(value: f64) -> Self {
        if value < 0.0 {
            MixDisplacement::RelativeToDroplet(value.abs())
        } else if value > 0.0 {
            MixDisplacement::Absolute(value)
        } else {
            MixDisplacement::Disabled
        }
    }

    /// The volume to move for a droplet of `droplet_volume`.
    pub fn resolve(&self, droplet_volume: f64) -> f64 {
        match *self {
            MixDisplacement::Disabled => 0.0,
            MixDisplacement::Absolute(volume) => volume.abs(),
            MixDisplacement::RelativeToDroplet(fraction) => fraction.abs() * droplet_volume,
        }
    }
}

/// A droplet assembled in the liquid line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DropletSpec {
    /// Vials and volumes, drawn in order. Zero and negative volumes are skipped.
    pub components: Vec<ComponentSpec>,
    /// Air gap on the tubing side of the droplet.
    pub back_air_gap: f64,
    /// Air gap on the needle-tip side of the droplet.
    pub front_air_gap: f64,
    /// Flow rate for air gaps.
    pub air_rate: Option<f64>,
    /// Flow rate for components.
    pub aspirate_rate: Option<f64>,
    /// Mixing in the line once all components are drawn.
    pub mix_displacement: MixDisplacement,
    /// Flow rate for mixing.
    pub mix_rate: Option<f64>,
    /// Mixing cycles.
    pub mix_iterations: u32,
    /// Wash between components.
    pub dip_tips: Option<ExternalWashSpec>,
    /// Poke between components.
    pub dab_tips: Option<ExternalWashSpec>,
    /// Arm speeds.
    pub arm: ArmSpec,
    /// Tip exit after each component.
    pub tip_exit: TipExitMethod,
    /// Volume dispensed into each vial before drawing from it.
    pub backlash: Option<f64>,
}

/// One destination of a droplet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    /// The vial.
    pub position: Placeable,
    /// Volume to deliver; zero and negative volumes are skipped.
    pub volume: f64,
    /// Dispense at the access height.
    #[serde(default)]
    pub free_dispense: bool,
}

/// Delivery of a loaded droplet to one or more vials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionSpec {
    /// Destinations, visited in order.
    pub destinations: Vec<Destination>,
    /// Front air gap, ejected at the first destination and restored at the end.
    pub front_air_gap: f64,
    /// Flow rate for air gaps.
    pub air_rate: Option<f64>,
    /// Flow rate for liquid.
    pub dispense_rate: Option<f64>,
    /// Wash between destinations.
    pub dip_tips: Option<ExternalWashSpec>,
    /// Poke between destinations.
    pub dab_tips: Option<ExternalWashSpec>,
    /// Arm speeds.
    pub arm: ArmSpec,
    /// Tip exit after each destination.
    pub tip_exit: TipExitMethod,
}

/// Components collected into a single vial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VialSpec {
    /// Vials and volumes. Zero and negative volumes are skipped.
    pub components: Vec<ComponentSpec>,
    /// The vial being prepared.
    pub destination: Placeable,
    /// Air gap protecting the system fluid.
    #[serde(default)]
    pub back_air_gap: f64,
    /// Air drawn before mixing and expelled afterwards.
    #[serde(default)]
    pub blowout: Option<f64>,
    /// Flow rate for air.
    #[serde(default)]
    pub air_rate: Option<f64>,
    /// Flow rate for liquid.
    #[serde(default)]
    pub aspirate_rate: Option<f64>,
    /// Mixing displacement, relative to the volume in the vial so far.
    #[serde(default)]
    pub mix_displacement: MixDisplacement,
    /// Flow rate for mixing.
    #[serde(default)]
    pub mix_rate: Option<f64>,
    /// Mixing cycles.
    #[serde(default)]
    pub mix_iterations: u32,
    /// Mix after every addition rather than only after the last one.
    #[serde(default)]
    pub mix_each: bool,
    /// Wash between components.
    #[serde(default)]
    pub dip_tips: Option<ExternalWashSpec>,
    /// Poke between components.
    #[serde(default)]
    pub dab_tips: Option<ExternalWashSpec>,
    /// Arm speeds.
    #[serde(default)]
    pub arm: ArmSpec,
    /// Tip exit for sources and destination.
    #[serde(default)]
    pub tip_exit: TipExitMethod,
    /// Dispense into the destination at the access height.
    #[serde(default)]
    pub free_dispense: bool,
}

/// A stock diluted with system fluid in a destination vial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemDilutionSpec {
    /// The stock vial.
    pub source: Placeable,
    /// The vial being prepared.
    pub destination: Placeable,
    /// Final volume in the destination.
    pub total_volume: f64,
    /// Stock volume over total volume, in `[0, 1]`.
    pub dilution_factor: f64,
    /// Where to empty the syringe before each transfer.
    pub waste: Placeable,
    /// Flow rate for liquid.
    #[serde(default)]
    pub aspirate_rate: Option<f64>,
    /// Mixing in the destination, relative to the total volume.
    #[serde(default)]
    pub mix_displacement: MixDisplacement,
    /// Flow rate for mixing.
    #[serde(default)]
    pub mix_rate: Option<f64>,
    /// Mixing cycles.
    #[serde(default)]
    pub mix_iterations: u32,
    /// Air gap on the tubing side.
    #[serde(default)]
    pub back_air_gap: f64,
    /// Air gap on the needle-tip side.
    #[serde(default)]
    pub front_air_gap: f64,
    /// Flow rate for air gaps.
    #[serde(default)]
    pub air_rate: Option<f64>,
    /// Arm speeds.
    #[serde(default)]
    pub arm: ArmSpec,
    /// Tip exit for the source and the final mix.
    #[serde(default)]
    pub tip_exit: TipExitMethod,
}

/// Volumes between the needle tip and a flow cell (uL).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowPath {
    /// Needle tip to the tubing connector.
    pub needle_ul: f64,
    /// Tubing from the needle to the flow-cell entrance.
    pub tube_ul: f64,
    /// Flow cell, entrance to exit.
    pub flow_cell_ul: f64,
    /// Empirical correction subtracted from the result.
    #[serde(default = "default_lag")]
    pub lag_ul: f64,
}

fn default_lag() -> f64 {
    2.0
}

/// Volume to aspirate so a droplet sitting at the needle tip ends up centred in the
/// flow cell. Never negative.
pub fn volume_to_center_droplet(path: &FlowPath, front_air_gap: f64, droplet_volume: f64) -> f64 {
    let to_centre = path.needle_ul + path.tube_ul + path.flow_cell_ul / 2.0;
    (to_centre - front_air_gap - droplet_volume / 2.0 - path.lag_ul).max(0.0)
}

fn check_capacity(required_ul: f64, capacity_ul: f64) -> LhResult<()> {
    if required_ul > capacity_ul {
        return Err(LiquidHandlerError::CapacityExceeded {
            required_ul,
            capacity_ul,
        });
    }
    Ok(())
}

impl<B: PipettingBackend> PipettingEngine<B> {
    fn syringe_capacity(&self) -> f64 {
        self.backend().settings().pump.syringe_volume_ul
    }

    async fn wash_between(
        &mut self,
        dip: Option<&ExternalWashSpec>,
        dab: Option<&ExternalWashSpec>,
    ) -> LhResult<()> {
        if let Some(dip) = dip {
            self.external_wash(dip).await?;
        }
        if let Some(dab) = dab {
            self.external_wash(dab).await?;
        }
        Ok(())
    }

    /// Draw a back air gap, each component, and a front air gap, then mix in the
    /// line if more than one component was drawn. Returns the droplet volume.
    ///
    /// # Errors
    ///
    /// [`LiquidHandlerError::CapacityExceeded`] before any hardware call when the
    /// air gaps, droplet and mixing displacement do not fit in the syringe.
    pub async fn prepare_droplet(&mut self, spec: &DropletSpec) -> LhResult<f64> {
        let components: Vec<&ComponentSpec> =
            spec.components.iter().filter(|c| c.volume > 0.0).collect();
        let droplet_volume: f64 = components.iter().map(|c| c.volume).sum();
        let mix_displacement = spec.mix_displacement.resolve(droplet_volume);
        check_capacity(
            spec.back_air_gap + spec.front_air_gap + mix_displacement + droplet_volume,
            self.syringe_capacity(),
        )?;
        info!(
            components = components.len(),
            droplet_volume, mix_displacement, "Preparing droplet"
        );

        let air_gap = |volume| {
            AspirateSpec::new(AirGap::new(volume))
                .with_rate(spec.air_rate)
                .with_arm(spec.arm)
        };

        self.aspirate(&air_gap(spec.back_air_gap)).await?;

        for (i, component) in components.iter().enumerate() {
            if i > 0 {
                self.wash_between(spec.dip_tips.as_ref(), spec.dab_tips.as_ref())
                    .await?;
            }
            if let Some(backlash) = spec.backlash.filter(|v| *v > 0.0) {
                let dispense = DispenseSpec::new(ComponentSpec::new(
                    component.position.clone(),
                    backlash,
                ))
                .with_rate(spec.aspirate_rate)
                .with_arm(spec.arm)
                .with_tip_exit(TipExitMethod::None);
                self.dispense(&dispense).await?;
            }
            let aspirate = AspirateSpec::new((*component).clone())
                .with_rate(spec.aspirate_rate)
                .with_arm(spec.arm)
                .with_tip_exit(spec.tip_exit);
            self.aspirate(&aspirate).await?;
        }

        self.aspirate(&air_gap(spec.front_air_gap)).await?;

        if components.len() > 1 {
            self.mix(&MixSpec::in_line(
                mix_displacement,
                spec.mix_rate,
                spec.mix_iterations,
            ))
            .await?;
        }
        Ok(droplet_volume)
    }

    /// Eject the front air gap at the first destination, dispense to each
    /// destination, then restore the front air gap. Returns the volume dispensed.
    pub async fn distribute_droplet(&mut self, spec: &DistributionSpec) -> LhResult<f64> {
        let destinations: Vec<&Destination> = spec
            .destinations
            .iter()
            .filter(|d| d.volume > 0.0)
            .collect();
        let dispensed: f64 = destinations.iter().map(|d| d.volume).sum();

        let mut ejected_air_gap = false;
        for (i, destination) in destinations.iter().enumerate() {
            if i > 0 {
                self.wash_between(spec.dip_tips.as_ref(), spec.dab_tips.as_ref())
                    .await?;
            } else {
                let eject = DispenseSpec::new(ComponentSpec::new(
                    destination.position.clone(),
                    spec.front_air_gap,
                ))
                .with_rate(spec.dispense_rate)
                .with_arm(spec.arm)
                .with_tip_exit(spec.tip_exit)
                .free(true);
                self.dispense(&eject).await?;
                ejected_air_gap = true;
            }

            let dispense = DispenseSpec::new(ComponentSpec::new(
                destination.position.clone(),
                destination.volume,
            ))
            .with_rate(spec.dispense_rate)
            .with_arm(spec.arm)
            .with_tip_exit(spec.tip_exit)
            .free(destination.free_dispense);
            self.dispense(&dispense).await?;
        }

        if ejected_air_gap {
            let restore = AspirateSpec::new(AirGap::new(spec.front_air_gap))
                .with_rate(spec.air_rate)
                .with_arm(spec.arm);
            self.aspirate(&restore).await?;
        }
        info!(
            destinations = destinations.len(),
            dispensed, "Droplet distributed"
        );
        Ok(dispensed)
    }

    /// Move each component into the destination vial, mixing there after each
    /// addition or after the last. Returns the volume added.
    pub async fn prepare_vial(&mut self, spec: &VialSpec) -> LhResult<f64> {
        let components: Vec<&ComponentSpec> =
            spec.components.iter().filter(|c| c.volume > 0.0).collect();
        let vial_volume: f64 = components.iter().map(|c| c.volume).sum();

        let back = AspirateSpec::new(AirGap::new(spec.back_air_gap))
            .with_rate(spec.air_rate)
            .with_arm(spec.arm);
        self.aspirate(&back).await?;

        let mut cumulative = 0.0;
        for (i, component) in components.iter().enumerate() {
            if i > 0 {
                self.wash_between(spec.dip_tips.as_ref(), spec.dab_tips.as_ref())
                    .await?;
            }
            let draw = AspirateSpec::new((*component).clone())
                .with_rate(spec.aspirate_rate)
                .with_arm(spec.arm)
                .with_tip_exit(spec.tip_exit);
            self.aspirate(&draw).await?;
            let deliver = DispenseSpec::new(ComponentSpec::new(
                spec.destination.clone(),
                component.volume,
            ))
            .with_rate(spec.aspirate_rate)
            .with_arm(spec.arm)
            .with_tip_exit(spec.tip_exit)
            .free(spec.free_dispense);
            self.dispense(&deliver).await?;

            cumulative += component.volume;
            if spec.mix_each || i + 1 == components.len() {
                let mix = MixSpec {
                    displacement: spec.mix_displacement.resolve(cumulative),
                    rate: spec.mix_rate,
                    iterations: spec.mix_iterations,
                    location: Some(MixLocation {
                        position: spec.destination.clone(),
                        arm: spec.arm,
                        tip_exit: spec.tip_exit,
                    }),
                    blowout: spec.blowout,
                };
                self.mix(&mix).await?;
            }
        }
        Ok(vial_volume)
    }

    /// Dilute a stock with system fluid in the destination vial, transferring the
    /// larger volume first, then mix there.
    ///
    /// # Errors
    ///
    /// [`LiquidHandlerError::InvalidParameter`] for a dilution factor outside
    /// `[0, 1]`, [`LiquidHandlerError::CapacityExceeded`] when the transfer does not
    /// fit in the syringe. Both before any hardware call.
    pub async fn prepare_system_diluted_stock(&mut self, spec: &SystemDilutionSpec) -> LhResult<()> {
        if !(0.0..=1.0).contains(&spec.dilution_factor) {
            return Err(LiquidHandlerError::invalid(format!(
                "dilution factor {} outside [0, 1]",
                spec.dilution_factor
            )));
        }
        let source_volume = spec.total_volume * spec.dilution_factor;
        let diluent_volume = spec.total_volume - source_volume;
        let mix_displacement = spec.mix_displacement.resolve(spec.total_volume);
        check_capacity(
            spec.back_air_gap + spec.front_air_gap + mix_displacement + spec.total_volume,
            self.syringe_capacity(),
        )?;
        let system_air_gap = self.backend().settings().pump.system_air_gap_ul;

        let empty_at_waste = || DispenseAllSpec {
            position: spec.waste.clone(),
            arm: spec.arm,
            tip_exit: TipExitMethod::TipTouch,
            free_dispense: true,
            dispense_on_edge: true,
        };
        let air_gap = |volume| {
            AspirateSpec::new(AirGap::new(volume))
                .with_rate(spec.air_rate)
                .with_arm(spec.arm)
        };

        let source_sequence: Vec<PipettingOperation> = vec![
            empty_at_waste().into(),
            air_gap(spec.back_air_gap).into(),
            AspirateSpec::new(ComponentSpec::new(spec.source.clone(), source_volume))
                .with_rate(spec.aspirate_rate)
                .with_arm(spec.arm)
                .with_tip_exit(spec.tip_exit)
                .into(),
            air_gap(spec.front_air_gap).into(),
            DispenseSpec::new(ComponentSpec::new(
                spec.destination.clone(),
                source_volume + spec.front_air_gap,
            ))
            .with_arm(spec.arm)
            .into(),
        ];
        let diluent_sequence: Vec<PipettingOperation> = vec![
            empty_at_waste().into(),
            AspirateSystemSpec {
                volume: diluent_volume,
                rate: spec.aspirate_rate,
            }
            .into(),
            DispenseSpec::new(ComponentSpec::new(spec.destination.clone(), diluent_volume))
                .with_arm(spec.arm)
                .into(),
            AspirateSpec::new(AirGap::at(system_air_gap, spec.waste.clone()))
                .with_rate(spec.air_rate)
                .with_arm(spec.arm)
                .into(),
        ];
        let closing = MixSpec {
            displacement: mix_displacement,
            rate: spec.mix_rate,
            iterations: spec.mix_iterations,
            location: Some(MixLocation {
                position: spec.destination.clone(),
                arm: spec.arm,
                tip_exit: spec.tip_exit,
            }),
            blowout: Some(spec.front_air_gap + mix_displacement),
        };

        let (first, second) = if spec.dilution_factor >= 0.5 {
            (source_sequence, diluent_sequence)
        } else {
            (diluent_sequence, source_sequence)
        };
        info!(
            source_volume,
            diluent_volume, "Preparing system-diluted stock"
        );
        self.chain(
            first
                .into_iter()
                .chain(second)
                .chain([PipettingOperation::from(closing)]),
        )
        .await
    }
}
