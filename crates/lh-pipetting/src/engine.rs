//! Pipetting execution engine.
//!
//! Turns [`PipettingOperation`]s into arm and pump calls on a [`PipettingBackend`].
//! Operations run strictly in the order given; each one is awaited to completion
//! before the next starts.
//!
//! # Heights
//!
//! - travel height: `motion.max_z`, used for every lateral move
//! - access height: where the needle enters a vial
//! - transfer height: where the needle touches the liquid
//!
//! # Example
//!
//! ```rust,ignore
//! let mut engine = PipettingEngine::new(driver).with_deck(deck);
//! engine
//!     .chain([
//!         AspirateSpec::new(AirGap::new(20.0)).into(),
//!         AspirateSpec::new(ComponentSpec::new(Placeable::named("stock", "A1"), 100.0)).into(),
//!         PipettingOperation::comment("loaded"),
//!     ])
//!     .await?;
//! ```

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use lh_core::capabilities::PipettingBackend;
use lh_core::deck::{DeckLayout, Placeable, ResolvedPosition};
use lh_core::error::LhResult;

use crate::operations::{
    ArmSpec, AspirateSpec, AspirateSystemSpec, DispenseAllSpec, DispenseSpec, ExternalWashSpec,
    InternalCleanSpec, MixSpec, PipettingOperation, Source, TipExitMethod, UserIntervention, Wait,
};
use crate::prompt::{ConsolePrompt, OperatorPrompt};

/// Executes pipetting operations against a backend.
pub struct PipettingEngine<B: PipettingBackend> {
    backend: B,
    deck: Option<Arc<dyn DeckLayout>>,
    prompt: Box<dyn OperatorPrompt>,
}

impl<B: PipettingBackend> std::fmt::Debug for PipettingEngine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipettingEngine")
            .field("deck", &self.deck)
            .field("xy", &self.backend.current_xy())
            .field("z", &self.backend.current_z())
            .finish_non_exhaustive()
    }
}

impl<B: PipettingBackend> PipettingEngine<B> {
    /// An engine with no deck that prompts on the console.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            deck: None,
            prompt: Box::new(ConsolePrompt),
        }
    }

    /// Resolve named positions through `deck`.
    pub fn with_deck(mut self, deck: Arc<dyn DeckLayout>) -> Self {
        self.deck = Some(deck);
        self
    }

    /// Ask the operator through `prompt`.
    pub fn with_prompt(mut self, prompt: impl OperatorPrompt + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Give the backend back.
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// The deck layout, if any.
    pub fn deck(&self) -> Option<&dyn DeckLayout> {
        self.deck.as_deref()
    }

    pub(crate) fn prompt(&self) -> &dyn OperatorPrompt {
        self.prompt.as_ref()
    }

    /// Resolve a placeable against the loaded deck.
    pub fn resolve(&self, position: &Placeable) -> LhResult<ResolvedPosition> {
        position.resolve(self.deck.as_deref())
    }

    pub(crate) fn flow_rate(&self, rate: Option<f64>) -> f64 {
        rate.unwrap_or(self.backend.settings().pump.flow_rate)
    }

    fn speeds(&self, arm: &ArmSpec) -> (f64, f64) {
        arm.speeds(&self.backend.settings().motion)
    }

    fn travel_height(&self) -> f64 {
        self.backend.settings().motion.max_z
    }

    // =========================================================================
    // Motion
    // =========================================================================

    /// Rise to travel height, move over the vial (or its edge), descend to the
    /// access height. Returns the resolved position.
    pub async fn move_arm_to(
        &mut self,
        position: &Placeable,
        arm: &ArmSpec,
        use_edge: bool,
    ) -> LhResult<ResolvedPosition> {
        let resolved = self.resolve(position)?;
        let (xy_speed, z_speed) = self.speeds(arm);
        debug!(position = %position.label(), use_edge, "Moving arm");
        let travel = self.travel_height();
        self.backend.move_z(travel, z_speed).await?;
        self.backend
            .move_xy(resolved.approach(use_edge), xy_speed)
            .await?;
        self.backend.move_z(resolved.access_z, z_speed).await?;
        Ok(resolved)
    }

    /// Withdraw the needle from a vial.
    ///
    /// Touch and drag need a known arm position; when it is unknown they fall back
    /// to rising straight up.
    pub async fn tip_exit(
        &mut self,
        method: TipExitMethod,
        position: &ResolvedPosition,
        arm: &ArmSpec,
    ) -> LhResult<()> {
        let (xy_speed, z_speed) = self.speeds(arm);
        match method {
            TipExitMethod::Center => self.backend.move_z(position.access_z, z_speed).await,
            TipExitMethod::TipTouch => {
                self.backend
                    .move_z(position.access_z - 1.0, z_speed)
                    .await?;
                if self.backend.current_z().is_none() {
                    return Ok(());
                }
                self.backend.move_xy(position.edge, xy_speed).await?;
                self.backend.move_xy(position.xy, xy_speed).await?;
                self.backend.move_z(position.access_z, z_speed).await
            }
            TipExitMethod::Drag => {
                if self.backend.current_z().is_none() {
                    return self.backend.move_z(position.access_z, z_speed).await;
                }
                self.backend.move_xy(position.edge, xy_speed).await?;
                self.backend.move_z(position.access_z, z_speed).await?;
                self.backend.move_xy(position.xy, xy_speed).await
            }
            TipExitMethod::None => Ok(()),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Draw an air gap, or liquid from a vial.
    #[instrument(skip(self, spec), err)]
    pub async fn aspirate(&mut self, spec: &AspirateSpec) -> LhResult<()> {
        let rate = self.flow_rate(spec.rate);
        match &spec.source {
            Source::AirGap(air) => {
                match &air.position {
                    Some(position) => {
                        self.move_arm_to(position, &spec.arm, false).await?;
                    }
                    None => {
                        let (_, z_speed) = self.speeds(&spec.arm);
                        let travel = self.travel_height();
                        self.backend.move_z(travel, z_speed).await?;
                    }
                }
                if air.volume != 0.0 {
                    self.backend.aspirate(air.volume.abs(), rate).await?;
                }
                Ok(())
            }
            Source::Component(component) => {
                let resolved = self
                    .move_arm_to(&component.position, &spec.arm, false)
                    .await?;
                if component.volume != 0.0 {
                    let (_, z_speed) = self.speeds(&spec.arm);
                    self.backend.move_z(resolved.transfer_z, z_speed).await?;
                    self.backend.aspirate(component.volume.abs(), rate).await?;
                }
                self.tip_exit(spec.tip_exit, &resolved, &spec.arm).await
            }
        }
    }

    /// Expel an air gap, or liquid into a vial. The magnitude of the volume is
    /// dispensed whatever its sign.
    #[instrument(skip(self, spec), err)]
    pub async fn dispense(&mut self, spec: &DispenseSpec) -> LhResult<()> {
        let rate = self.flow_rate(spec.rate);
        match &spec.source {
            Source::AirGap(air) => {
                match &air.position {
                    Some(position) => {
                        self.move_arm_to(position, &spec.arm, spec.dispense_on_edge)
                            .await?;
                    }
                    None => {
                        let (_, z_speed) = self.speeds(&spec.arm);
                        let travel = self.travel_height();
                        self.backend.move_z(travel, z_speed).await?;
                    }
                }
                if air.volume != 0.0 {
                    self.backend.dispense(air.volume.abs(), rate).await?;
                }
                Ok(())
            }
            Source::Component(component) => {
                let resolved = self
                    .move_arm_to(&component.position, &spec.arm, spec.dispense_on_edge)
                    .await?;
                let (_, z_speed) = self.speeds(&spec.arm);
                let dispense_z = if spec.free_dispense {
                    resolved.access_z
                } else {
                    resolved.transfer_z
                };
                self.backend.move_z(dispense_z, z_speed).await?;
                if component.volume != 0.0 {
                    self.backend.dispense(component.volume.abs(), rate).await?;
                }
                self.tip_exit(spec.tip_exit, &resolved, &spec.arm).await
            }
        }
    }

    /// Empty the syringe at a position by homing the pump.
    #[instrument(skip(self, spec), err)]
    pub async fn dispense_all(&mut self, spec: &DispenseAllSpec) -> LhResult<()> {
        let resolved = self
            .move_arm_to(&spec.position, &spec.arm, spec.dispense_on_edge)
            .await?;
        let (_, z_speed) = self.speeds(&spec.arm);
        let dispense_z = if spec.free_dispense {
            resolved.access_z
        } else {
            resolved.transfer_z
        };
        self.backend.move_z(dispense_z, z_speed).await?;
        self.backend.home_pump().await?;
        self.tip_exit(spec.tip_exit, &resolved, &spec.arm).await
    }

    /// Draw system fluid from the reservoir.
    pub async fn aspirate_system(&mut self, spec: &AspirateSystemSpec) -> LhResult<()> {
        let rate = self.flow_rate(spec.rate);
        self.backend.aspirate_from_reservoir(spec.volume, rate).await
    }

    /// Mix in a vial or in the liquid line. A zero displacement or zero iterations
    /// issues no calls at all.
    #[instrument(skip(self, spec), fields(displacement = spec.displacement, iterations = spec.iterations), err)]
    pub async fn mix(&mut self, spec: &MixSpec) -> LhResult<()> {
        if spec.displacement == 0.0 || spec.iterations == 0 {
            return Ok(());
        }
        let displacement = spec.displacement.abs();
        let rate = self.flow_rate(spec.rate);
        let air_rate = self.flow_rate(None);
        let blowout = spec.blowout.filter(|v| *v > 0.0);

        let located = match &spec.location {
            Some(location) => {
                let resolved = self
                    .move_arm_to(&location.position, &location.arm, false)
                    .await?;
                let (_, z_speed) = self.speeds(&location.arm);
                self.backend.move_z(resolved.access_z, z_speed).await?;
                Some((resolved, location))
            }
            None => {
                let z_speed = self.backend.settings().motion.z_speed;
                let travel = self.travel_height();
                self.backend.move_z(travel, z_speed).await?;
                None
            }
        };

        if let Some(air) = blowout {
            self.backend.aspirate(air, air_rate).await?;
        }

        if let Some((resolved, location)) = &located {
            let (_, z_speed) = self.speeds(&location.arm);
            self.backend.move_z(resolved.transfer_z, z_speed).await?;
        }

        for _ in 0..spec.iterations {
            self.backend.aspirate(displacement, rate).await?;
            self.backend.dispense(displacement, rate).await?;
        }

        if let Some((resolved, location)) = &located {
            self.tip_exit(location.tip_exit, resolved, &location.arm)
                .await?;
        }

        if let Some(air) = blowout {
            self.backend.dispense(air, air_rate).await?;
        }
        Ok(())
    }

    /// Dip the needle into each wash position.
    #[instrument(skip(self, spec), fields(positions = spec.positions.len()), err)]
    pub async fn external_wash(&mut self, spec: &ExternalWashSpec) -> LhResult<()> {
        let (_, z_speed) = self.speeds(&spec.arm);
        for position in &spec.positions {
            if let Some(air_gap) = &spec.air_gap {
                self.aspirate(air_gap).await?;
            }
            let resolved = self.move_arm_to(position, &spec.arm, false).await?;
            for _ in 0..spec.iterations {
                self.backend.move_z(resolved.transfer_z, z_speed).await?;
                self.tip_exit(spec.tip_exit, &resolved, &spec.arm).await?;
            }
            if let Some(air_gap) = &spec.air_gap {
                let eject = air_gap
                    .cast_to_dispense(true)
                    .with_tip_exit(TipExitMethod::TipTouch);
                self.dispense(&eject).await?;
            }
        }
        Ok(())
    }

    /// Flush system fluid through the needle, then restore the system air gap.
    #[instrument(skip(self, spec), fields(volume = spec.cleaning_volume, iterations = spec.iterations), err)]
    pub async fn internal_clean(&mut self, spec: &InternalCleanSpec) -> LhResult<()> {
        let rate = self.flow_rate(spec.rate);
        let resolved = self
            .move_arm_to(&spec.location, &spec.arm, spec.dispense_on_edge)
            .await?;
        let (_, z_speed) = self.speeds(&spec.arm);
        let dispense_z = if spec.free_dispense {
            resolved.access_z
        } else {
            resolved.transfer_z
        };
        self.backend.move_z(dispense_z, z_speed).await?;

        if spec.pre_flush {
            self.backend.home_pump().await?;
        }
        for _ in 0..spec.iterations {
            self.backend
                .aspirate_from_reservoir(spec.cleaning_volume, rate)
                .await?;
            self.backend.dispense(spec.cleaning_volume, rate).await?;
        }

        self.tip_exit(spec.tip_exit, &resolved, &spec.arm).await?;
        self.restore_system_air_gap().await
    }

    /// Draw the configured system air gap at the default flow rate.
    pub async fn restore_system_air_gap(&mut self) -> LhResult<()> {
        let pump = self.backend.settings().pump.clone();
        self.backend
            .aspirate(pump.system_air_gap_ul, pump.flow_rate)
            .await
    }

    /// Optionally home the arm, then wait for the operator.
    pub async fn user_intervention(&mut self, spec: &UserIntervention) -> LhResult<()> {
        if spec.home_arm {
            self.backend.home_arm().await?;
        }
        info!(title = %spec.title, "Waiting for operator");
        self.prompt.acknowledge(&spec.title, &spec.prompt).await
    }

    /// Sleep.
    pub async fn wait(&mut self, spec: &Wait) -> LhResult<()> {
        info!(duration = ?spec.duration, "Waiting");
        tokio::time::sleep(spec.duration).await;
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Execute one operation.
    pub async fn execute(&mut self, operation: &PipettingOperation) -> LhResult<()> {
        debug!(op = operation.name(), "Executing pipetting operation");
        match operation {
            PipettingOperation::Aspirate(spec) => self.aspirate(spec).await,
            PipettingOperation::Dispense(spec) => self.dispense(spec).await,
            PipettingOperation::DispenseAll(spec) => self.dispense_all(spec).await,
            PipettingOperation::AspirateSystem(spec) => self.aspirate_system(spec).await,
            PipettingOperation::Mix(spec) => self.mix(spec).await,
            PipettingOperation::ExternalWash(spec) | PipettingOperation::PokeNeedle(spec) => {
                self.external_wash(spec).await
            }
            PipettingOperation::InternalWash(spec) => self.mix(&spec.cast_to_mix()).await,
            PipettingOperation::InternalClean(spec) => self.internal_clean(spec).await,
            PipettingOperation::UserIntervention(spec) => self.user_intervention(spec).await,
            PipettingOperation::Wait(spec) => self.wait(spec).await,
            PipettingOperation::Comment(comment) => {
                info!(message = %comment.message, "Comment");
                Ok(())
            }
            PipettingOperation::Unrecognized => {
                warn!("Skipping unrecognized pipetting operation");
                Ok(())
            }
        }
    }

    /// Execute operations in order, skipping `None` entries. Stops at the first
    /// error.
    pub async fn chain<I>(&mut self, operations: I) -> LhResult<()>
    where
        I: IntoIterator,
        I::Item: Into<Option<PipettingOperation>>,
    {
        for operation in operations {
            match operation.into() {
                Some(operation) => self.execute(&operation).await?,
                None => continue,
            }
        }
        Ok(())
    }
}
