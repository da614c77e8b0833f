//! Routine maintenance sequences: priming, cleaning between samples, parking.

use tracing::info;

use lh_core::capabilities::PipettingBackend;
use lh_core::deck::Placeable;
use lh_core::error::{LhResult, LiquidHandlerError};

use crate::engine::PipettingEngine;
use crate::operations::{
    AirGap, ArmSpec, AspirateSpec, ExternalWashSpec, InternalCleanSpec, PipettingOperation,
    TipExitMethod,
};

/// Reservoir draws between operator checks while priming the needle.
pub const PRIME_CYCLES_PER_CHECK: u32 = 5;

/// Volume flushed by [`PipettingEngine::clean_up`] and
/// [`PipettingEngine::inter_clean`] per cycle unless told otherwise (uL).
pub const DEFAULT_CLEAN_VOLUME_UL: f64 = 200.0;

/// Chunk size for [`PipettingEngine::prime_system`] (uL).
pub const DEFAULT_PRIME_CHUNK_UL: f64 = 400.0;

impl<B: PipettingBackend> PipettingEngine<B> {
    fn flush_rate(&self) -> f64 {
        2.0 * self.backend().settings().pump.flow_rate
    }

    fn waste_clean(&self, waste: &Placeable, volume: f64, iterations: u32) -> InternalCleanSpec {
        InternalCleanSpec {
            cleaning_volume: volume,
            location: waste.clone(),
            iterations,
            rate: Some(self.flush_rate()),
            free_dispense: true,
            dispense_on_edge: true,
            pre_flush: true,
            arm: ArmSpec::default(),
            tip_exit: TipExitMethod::TipTouch,
        }
    }

    /// Move to `position` and home the pump, emptying the syringe there.
    pub async fn empty_syringe(&mut self, position: &Placeable) -> LhResult<()> {
        self.move_arm_to(position, &ArmSpec::default(), false)
            .await?;
        self.backend_mut().home_pump().await
    }

    /// Empty the syringe at waste, flush `volume` of system fluid through it in
    /// chunks of `chunk`, then restore the system air gap.
    pub async fn prime_system(&mut self, waste: &Placeable, volume: f64, chunk: f64) -> LhResult<()> {
        if !chunk.is_finite() || chunk <= 0.0 || !volume.is_finite() || volume < 0.0 {
            return Err(LiquidHandlerError::invalid(format!(
                "cannot prime {volume} uL in chunks of {chunk} uL"
            )));
        }
        let rate = self.flush_rate();
        info!(volume, chunk, "Priming system");
        self.empty_syringe(waste).await?;

        let chunks = (volume / chunk).floor() as u32;
        for _ in 0..chunks {
            self.backend_mut()
                .aspirate_from_reservoir(chunk, rate)
                .await?;
            self.empty_syringe(waste).await?;
        }
        let remaining = volume - chunk * f64::from(chunks);
        if remaining > 1.0 {
            self.backend_mut()
                .aspirate_from_reservoir(remaining, rate)
                .await?;
            self.backend_mut().dispense(remaining, rate).await?;
        }
        self.restore_system_air_gap().await
    }

    /// Cycle system fluid from the reservoir out of the needle at waste until the
    /// operator confirms liquid is leaving the needle. The operator is asked every
    /// [`PRIME_CYCLES_PER_CHECK`] cycles. Returns the number of cycles run.
    ///
    /// `volume` defaults to the syringe volume, `rate` to the priming flow rate.
    pub async fn prime_needle(
        &mut self,
        waste: &Placeable,
        volume: Option<f64>,
        rate: Option<f64>,
    ) -> LhResult<u32> {
        let pump = self.backend().settings().pump.clone();
        let volume = volume.unwrap_or(pump.syringe_volume_ul);
        let rate = rate.unwrap_or(pump.priming_flow_rate);
        if !volume.is_finite() || volume <= 0.0 {
            return Err(LiquidHandlerError::invalid(format!(
                "prime volume must be positive, got {volume}"
            )));
        }

        self.move_arm_to(waste, &ArmSpec::default(), false).await?;
        self.backend_mut().home_pump().await?;

        let mut cycles = 0;
        loop {
            for _ in 0..PRIME_CYCLES_PER_CHECK {
                self.backend_mut()
                    .aspirate_from_reservoir(volume, rate)
                    .await?;
                self.backend_mut().dispense(volume, rate).await?;
                cycles += 1;
            }
            if self
                .prompt()
                .confirm("Priming needle...", "Is liquid coming out of the needle?")
                .await?
            {
                info!(cycles, "Needle primed");
                return Ok(cycles);
            }
        }
    }

    /// Flush `volume` to waste three times, then home the arm. Used to park the
    /// needle at the end of a run, including after a failure.
    pub async fn clean_up(&mut self, waste: &Placeable, volume: f64) -> LhResult<()> {
        let clean = self.waste_clean(waste, volume, 3);
        self.internal_clean(&clean).await?;
        self.backend_mut().home_arm().await
    }

    /// Internal clean at waste, external wash in `wash`, internal clean again. The
    /// system air gap is restored at the end.
    pub async fn inter_clean(
        &mut self,
        waste: &Placeable,
        wash: &Placeable,
        volume: f64,
    ) -> LhResult<()> {
        let first = self.waste_clean(waste, volume, 1);
        let external = ExternalWashSpec {
            positions: vec![wash.clone()],
            arm: ArmSpec::default(),
            tip_exit: TipExitMethod::Drag,
            air_gap: Some(AspirateSpec::new(AirGap::at(10.0, waste.clone()))),
            iterations: 2,
        };
        let second = self.waste_clean(waste, volume, 2);
        self.chain([
            PipettingOperation::from(first),
            PipettingOperation::from(external),
            PipettingOperation::from(second),
        ])
        .await
    }
}
