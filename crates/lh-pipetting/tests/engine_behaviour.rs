//! Engine behaviour against the recording backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use lh_core::deck::{Coordinate, Placeable, Point2D};
use lh_core::error::{LhResult, LiquidHandlerError};
use lh_core::settings::HandlerSettings;
use lh_pipetting::builders::{
    Destination, DistributionSpec, DropletSpec, MixDisplacement, SystemDilutionSpec,
};
use lh_pipetting::maintenance::DEFAULT_PRIME_CHUNK_UL;
use lh_pipetting::operations::{
    AirGap, ArmSpec, AspirateSpec, AspirateSystemSpec, ComponentSpec, DispenseSpec,
    ExternalWashSpec, MixSpec, PipettingOperation, TipExitMethod, UserIntervention, Wait,
};
use lh_pipetting::{AutoConfirm, BackendCall, OperatorPrompt, PipettingEngine, RecordingBackend};

fn engine() -> PipettingEngine<RecordingBackend> {
    PipettingEngine::new(RecordingBackend::new(HandlerSettings::default()))
        .with_prompt(AutoConfirm::yes())
}

fn vial(x: f64) -> Placeable {
    Placeable::Coordinate(Coordinate {
        x,
        y: 10.0,
        z: 30.0,
        edge_offset: 2.0,
    })
}

fn droplet(back_air_gap: f64) -> DropletSpec {
    DropletSpec {
        components: vec![
            ComponentSpec::new(vial(10.0), 100.0),
            ComponentSpec::new(vial(20.0), 200.0),
        ],
        back_air_gap,
        front_air_gap: 10.0,
        mix_displacement: MixDisplacement::from_signed(-1.5),
        mix_iterations: 2,
        ..DropletSpec::default()
    }
}

fn pump_calls(calls: &[BackendCall]) -> Vec<BackendCall> {
    calls.iter().copied().filter(BackendCall::is_pump).collect()
}

#[tokio::test]
async fn droplet_within_capacity_returns_its_volume() {
    let mut engine = engine();
    let volume = engine.prepare_droplet(&droplet(20.0)).await.unwrap();
    assert_eq!(volume, 300.0);

    let pumps = pump_calls(engine.backend().calls());
    assert_eq!(
        pumps,
        vec![
            BackendCall::Aspirate(20.0, 1.0),
            BackendCall::Aspirate(100.0, 1.0),
            BackendCall::Aspirate(200.0, 1.0),
            BackendCall::Aspirate(10.0, 1.0),
            BackendCall::Aspirate(450.0, 1.0),
            BackendCall::Dispense(450.0, 1.0),
            BackendCall::Aspirate(450.0, 1.0),
            BackendCall::Dispense(450.0, 1.0),
        ]
    );
}

#[tokio::test]
async fn droplet_over_capacity_touches_nothing() {
    let mut engine = engine();
    let err = engine.prepare_droplet(&droplet(500.0)).await.unwrap_err();
    match err {
        LiquidHandlerError::CapacityExceeded {
            required_ul,
            capacity_ul,
        } => {
            assert_eq!(required_ul, 1260.0);
            assert_eq!(capacity_ul, 1000.0);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(engine.backend().calls().is_empty());
}

#[tokio::test]
async fn single_component_droplet_is_not_mixed() {
    let mut engine = engine();
    let spec = DropletSpec {
        components: vec![
            ComponentSpec::new(vial(10.0), 50.0),
            ComponentSpec::new(vial(20.0), 0.0),
            ComponentSpec::new(vial(30.0), -5.0),
        ],
        back_air_gap: 20.0,
        front_air_gap: 10.0,
        mix_displacement: MixDisplacement::Absolute(40.0),
        mix_iterations: 3,
        ..DropletSpec::default()
    };
    assert_eq!(engine.prepare_droplet(&spec).await.unwrap(), 50.0);
    assert_eq!(
        pump_calls(engine.backend().calls()),
        vec![
            BackendCall::Aspirate(20.0, 1.0),
            BackendCall::Aspirate(50.0, 1.0),
            BackendCall::Aspirate(10.0, 1.0),
        ]
    );
}

#[tokio::test]
async fn mix_with_nothing_to_do_is_silent() {
    let mut engine = engine();
    engine.mix(&MixSpec::in_line(50.0, None, 0)).await.unwrap();
    engine.mix(&MixSpec::in_line(0.0, None, 4)).await.unwrap();
    assert!(engine.backend().calls().is_empty());
}

#[tokio::test]
async fn dispense_sends_the_magnitude() {
    let mut engine = engine();
    engine
        .dispense(&DispenseSpec::new(ComponentSpec::new(vial(10.0), -75.0)).with_rate(Some(0.5)))
        .await
        .unwrap();
    engine
        .dispense(&DispenseSpec::new(AirGap::new(-5.0)))
        .await
        .unwrap();
    assert_eq!(
        pump_calls(engine.backend().calls()),
        vec![BackendCall::Dispense(75.0, 0.5), BackendCall::Dispense(5.0, 1.0)]
    );
}

#[tokio::test]
async fn chain_skips_nulls_and_unknown_operations() {
    let mut engine = engine();
    let ops: Vec<Option<PipettingOperation>> = vec![
        Some(AspirateSystemSpec { volume: 100.0, rate: Some(2.0) }.into()),
        None,
        Some(PipettingOperation::Unrecognized),
        Some(PipettingOperation::comment("between")),
        Some(AspirateSpec::new(AirGap::new(15.0)).into()),
    ];
    engine.chain(ops).await.unwrap();
    assert_eq!(
        engine.backend().calls(),
        &[
            BackendCall::Reservoir(100.0, 2.0),
            BackendCall::MoveZ(125.0, 25.0),
            BackendCall::Aspirate(15.0, 1.0),
        ]
    );
}

#[tokio::test]
async fn distribution_ejects_and_restores_the_front_air_gap() {
    let mut engine = engine();
    let spec = DistributionSpec {
        destinations: vec![
            Destination { position: vial(10.0), volume: 100.0, free_dispense: false },
            Destination { position: vial(20.0), volume: 0.0, free_dispense: false },
            Destination { position: vial(30.0), volume: 50.0, free_dispense: true },
        ],
        front_air_gap: 10.0,
        ..DistributionSpec::default()
    };
    assert_eq!(engine.distribute_droplet(&spec).await.unwrap(), 150.0);
    assert_eq!(
        pump_calls(engine.backend().calls()),
        vec![
            BackendCall::Dispense(10.0, 1.0),
            BackendCall::Dispense(100.0, 1.0),
            BackendCall::Dispense(50.0, 1.0),
            BackendCall::Aspirate(10.0, 1.0),
        ]
    );
}

#[tokio::test]
async fn distribution_to_nowhere_keeps_the_air_gap() {
    let mut engine = engine();
    let spec = DistributionSpec {
        destinations: vec![Destination { position: vial(10.0), volume: 0.0, free_dispense: false }],
        front_air_gap: 10.0,
        ..DistributionSpec::default()
    };
    assert_eq!(engine.distribute_droplet(&spec).await.unwrap(), 0.0);
    assert!(engine.backend().calls().is_empty());
}

#[tokio::test]
async fn system_dilution_moves_the_larger_volume_first() {
    let mut engine = engine();
    let spec = SystemDilutionSpec {
        source: vial(10.0),
        destination: vial(20.0),
        total_volume: 500.0,
        dilution_factor: 0.2,
        waste: vial(90.0),
        aspirate_rate: None,
        mix_displacement: MixDisplacement::Disabled,
        mix_rate: None,
        mix_iterations: 0,
        back_air_gap: 10.0,
        front_air_gap: 10.0,
        air_rate: None,
        arm: Default::default(),
        tip_exit: Default::default(),
    };
    engine.prepare_system_diluted_stock(&spec).await.unwrap();
    let pumps = pump_calls(engine.backend().calls());
    assert_eq!(pumps[0], BackendCall::HomePump);
    assert_eq!(pumps[1], BackendCall::Reservoir(400.0, 1.0));

    let bad = SystemDilutionSpec { dilution_factor: 1.5, ..spec };
    let mut fresh = self::engine();
    assert!(fresh.prepare_system_diluted_stock(&bad).await.unwrap_err().is_validation());
    assert!(fresh.backend().calls().is_empty());
}

#[tokio::test]
async fn prime_system_flushes_in_chunks() {
    let mut engine = engine();
    let waste = vial(90.0);
    engine
        .prime_system(&waste, 900.0, DEFAULT_PRIME_CHUNK_UL)
        .await
        .unwrap();
    assert_eq!(
        pump_calls(engine.backend().calls()),
        vec![
            BackendCall::HomePump,
            BackendCall::Reservoir(400.0, 2.0),
            BackendCall::HomePump,
            BackendCall::Reservoir(400.0, 2.0),
            BackendCall::HomePump,
            BackendCall::Reservoir(100.0, 2.0),
            BackendCall::Dispense(100.0, 2.0),
            BackendCall::Aspirate(20.0, 1.0),
        ]
    );
}

/// Says "no" a fixed number of times, then "yes".
struct Reluctant {
    refusals: usize,
    asked: Arc<AtomicUsize>,
}

#[async_trait]
impl OperatorPrompt for Reluctant {
    async fn acknowledge(&self, _title: &str, _message: &str) -> LhResult<()> {
        Ok(())
    }

    async fn confirm(&self, _title: &str, _question: &str) -> LhResult<bool> {
        let n = self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(n >= self.refusals)
    }
}

#[tokio::test]
async fn prime_needle_asks_every_five_cycles() {
    let asked = Arc::new(AtomicUsize::new(0));
    let mut engine = PipettingEngine::new(RecordingBackend::new(HandlerSettings::default()))
        .with_prompt(Reluctant {
            refusals: 1,
            asked: asked.clone(),
        });
    let cycles = engine
        .prime_needle(&vial(90.0), Some(250.0), None)
        .await
        .unwrap();
    assert_eq!(cycles, 10);
    assert_eq!(asked.load(Ordering::SeqCst), 2);
    let reservoir_draws = engine
        .backend()
        .calls()
        .iter()
        .filter(|c| matches!(c, BackendCall::Reservoir(v, r) if *v == 250.0 && *r == 5.0))
        .count();
    assert_eq!(reservoir_draws, 10);
}

#[tokio::test]
async fn clean_up_flushes_three_times_then_parks() {
    let mut engine = engine();
    engine.clean_up(&vial(90.0), 200.0).await.unwrap();
    let calls = engine.backend().calls();
    assert_eq!(calls.last(), Some(&BackendCall::HomeArm));
    let flushes = calls
        .iter()
        .filter(|c| matches!(c, BackendCall::Reservoir(v, _) if *v == 200.0))
        .count();
    assert_eq!(flushes, 3);
}

#[tokio::test]
async fn user_intervention_homes_then_asks() {
    let mut engine = engine();
    engine
        .execute(&PipettingOperation::UserIntervention(UserIntervention {
            prompt: "Replace the wash vial".into(),
            title: "Maintenance".into(),
            home_arm: true,
        }))
        .await
        .unwrap();
    assert_eq!(engine.backend().calls(), &[BackendCall::HomeArm]);
}

#[tokio::test]
async fn operations_load_from_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ops.json");
    std::fs::write(
        &path,
        r#"[{"op": "comment", "message": "hi"}, null, {"op": "teleport"}]"#,
    )
    .unwrap();
    let ops = lh_pipetting::load_operations(&path).unwrap();
    assert_eq!(ops.len(), 3);

    let mut engine = engine();
    engine.chain(ops).await.unwrap();
    assert!(engine.backend().calls().is_empty());
}

fn at(x: f64) -> Point2D {
    Point2D::new(x, 10.0)
}

/// Travel height, over `x`, down to the access height.
fn approach(x: f64) -> Vec<BackendCall> {
    vec![
        BackendCall::MoveZ(125.0, 25.0),
        BackendCall::MoveXy(at(x), 50.0),
        BackendCall::MoveZ(30.0, 25.0),
    ]
}

fn wash_spec(positions: Vec<Placeable>) -> ExternalWashSpec {
    ExternalWashSpec {
        positions,
        arm: ArmSpec::default(),
        tip_exit: TipExitMethod::Drag,
        air_gap: Some(AspirateSpec::new(AirGap::at(10.0, vial(90.0)))),
        iterations: 2,
    }
}

#[tokio::test]
async fn external_wash_guards_each_vial_with_an_air_gap() {
    let mut engine = engine();
    engine
        .external_wash(&wash_spec(vec![vial(40.0), vial(50.0)]))
        .await
        .unwrap();

    let mut expected = Vec::new();
    for x in [40.0, 50.0] {
        expected.extend(approach(90.0));
        expected.push(BackendCall::Aspirate(10.0, 1.0));
        expected.extend(approach(x));
        for _ in 0..2 {
            expected.push(BackendCall::MoveZ(30.0, 25.0));
            expected.push(BackendCall::MoveXy(at(x + 2.0), 50.0));
            expected.push(BackendCall::MoveZ(30.0, 25.0));
            expected.push(BackendCall::MoveXy(at(x), 50.0));
        }
        expected.extend(approach(90.0));
        expected.push(BackendCall::Dispense(10.0, 1.0));
    }
    assert_eq!(engine.backend().calls(), expected.as_slice());
}

#[tokio::test]
async fn poke_needle_runs_as_an_external_wash() {
    let mut washed = engine();
    washed
        .external_wash(&wash_spec(vec![vial(40.0)]))
        .await
        .unwrap();

    let mut poked = engine();
    poked
        .execute(&PipettingOperation::PokeNeedle(wash_spec(vec![vial(40.0)])))
        .await
        .unwrap();
    assert_eq!(poked.backend().calls(), washed.backend().calls());
}

#[tokio::test]
async fn external_wash_without_air_gap_only_dips() {
    let mut engine = engine();
    let spec = ExternalWashSpec::new(vec![vial(40.0)]);
    engine
        .execute(&PipettingOperation::ExternalWash(spec))
        .await
        .unwrap();
    let mut expected = approach(40.0);
    expected.push(BackendCall::MoveZ(30.0, 25.0));
    expected.push(BackendCall::MoveZ(30.0, 25.0));
    assert_eq!(engine.backend().calls(), expected.as_slice());
}

#[tokio::test]
async fn inter_clean_flushes_washes_and_flushes_again() {
    let mut engine = engine();
    engine
        .inter_clean(&vial(90.0), &vial(60.0), 200.0)
        .await
        .unwrap();
    let calls = engine.backend().calls();

    assert_eq!(
        pump_calls(calls),
        vec![
            BackendCall::HomePump,
            BackendCall::Reservoir(200.0, 2.0),
            BackendCall::Dispense(200.0, 2.0),
            BackendCall::Aspirate(20.0, 1.0),
            BackendCall::Aspirate(10.0, 1.0),
            BackendCall::Dispense(10.0, 1.0),
            BackendCall::HomePump,
            BackendCall::Reservoir(200.0, 2.0),
            BackendCall::Dispense(200.0, 2.0),
            BackendCall::Reservoir(200.0, 2.0),
            BackendCall::Dispense(200.0, 2.0),
            BackendCall::Aspirate(20.0, 1.0),
        ]
    );

    let over_wash = calls
        .iter()
        .filter(|c| matches!(c, BackendCall::MoveXy(p, _) if *p == at(60.0)))
        .count();
    let wash_wall = calls
        .iter()
        .filter(|c| matches!(c, BackendCall::MoveXy(p, _) if *p == at(62.0)))
        .count();
    assert_eq!(over_wash, 3);
    assert_eq!(wash_wall, 2);
}

#[tokio::test(start_paused = true)]
async fn wait_sleeps_without_touching_hardware() {
    let mut engine = engine();
    let started = tokio::time::Instant::now();
    engine
        .execute(&PipettingOperation::Wait(Wait {
            duration: Duration::from_secs(90),
        }))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(90));
    assert!(engine.backend().calls().is_empty());
}
