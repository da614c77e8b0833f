//! Driver behaviour against the simulated GSIOC bus.

use std::time::Duration;

use lh_core::capabilities::PipettingBackend;
use lh_core::error::LiquidHandlerError;
use lh_core::resources::{ResourceConfig, SYSTEM_FLUID_KEY};
use lh_core::settings::{GsiocTiming, HandlerSettings, MotorWaitTimeoutPolicy};
use lh_driver_gilson::{GilsonDevice, Gx241Driver};
use lh_gsioc::codex::injector::InjectorState;
use lh_gsioc::{GsiocChannel, SimulatedBus};

fn fast_settings() -> HandlerSettings {
    let mut settings = HandlerSettings::default();
    settings.serial.timing = GsiocTiming::fast();
    settings
}

fn attach(settings: HandlerSettings) -> (SimulatedBus, Gx241Driver) {
    let bus = SimulatedBus::gilson(settings.devices);
    let channel = GsiocChannel::new(bus.attach(), settings.serial.timing.clone());
    (bus, Gx241Driver::new(channel, settings))
}

#[tokio::test]
async fn initialize_homes_arm_and_draws_air_gap() {
    let (bus, mut driver) = attach(fast_settings());
    driver.initialize().await.unwrap();

    assert_eq!(bus.commands(30), vec!["H"]);
    assert_eq!(bus.commands(2), vec!["PN:20:1"]);
}

#[tokio::test]
async fn initialize_can_home_pump_too() {
    let mut settings = fast_settings();
    settings.startup.home_arm = false;
    settings.startup.home_pump = true;
    let (bus, mut driver) = attach(settings);
    driver.initialize().await.unwrap();

    assert!(bus.commands(30).is_empty());
    assert_eq!(bus.commands(2), vec!["p", "PN:20:1"]);
}

#[tokio::test]
async fn reservoir_draw_debits_system_fluid() {
    let dir = tempfile::tempdir().unwrap();
    let resources = ResourceConfig::new(dir.path().join("resources_cfg.json"));
    assert!(resources.set_value(SYSTEM_FLUID_KEY, serde_json::json!(2.0)));

    let (bus, driver) = attach(fast_settings());
    let mut driver = driver.with_resources(Some(resources.clone()));
    driver.aspirate_from_reservoir(500.0, 5.0).await.unwrap();

    assert_eq!(bus.commands(2), vec!["PR:500:5"]);
    let remaining = resources.get_number(SYSTEM_FLUID_KEY).unwrap();
    assert!((remaining - 1.5).abs() < 1e-9);
}

#[tokio::test]
async fn motor_wait_polls_until_idle() {
    let (bus, mut driver) = attach(fast_settings());
    bus.set_busy_polls(30, 3);
    driver.move_z(100.0, 25.0).await.unwrap();
    assert_eq!(bus.commands(30), vec!["Z100:25"]);
}

#[tokio::test]
async fn motor_wait_timeout_follows_policy() {
    let mut settings = fast_settings();
    settings.motion.motor_wait_timeout = Duration::from_millis(50);
    settings.motion.motor_wait_policy = MotorWaitTimeoutPolicy::Fail;
    let (bus, mut driver) = attach(settings);
    bus.set_busy_polls(30, u32::MAX);

    let err = driver.move_z(100.0, 25.0).await.unwrap_err();
    assert!(matches!(
        err,
        LiquidHandlerError::MotorWaitTimeout { device: 30, .. }
    ));
}

#[tokio::test]
async fn motor_wait_timeout_warns_by_default() {
    let mut settings = fast_settings();
    settings.motion.motor_wait_timeout = Duration::from_millis(50);
    let (bus, mut driver) = attach(settings);
    bus.set_busy_polls(30, u32::MAX);

    driver.move_z(100.0, 25.0).await.unwrap();
    assert_eq!(driver.current_z(), Some(100.0));
}

#[tokio::test]
async fn injector_switches_valve() {
    let (bus, mut driver) = attach(fast_settings());
    assert_eq!(driver.injector_state().await.unwrap(), InjectorState::Load);

    driver.injector_inject().await.unwrap();
    assert_eq!(driver.injector_state().await.unwrap(), InjectorState::Inject);
    driver.injector_load().await.unwrap();
    assert_eq!(bus.commands(6), vec!["VI", "VL"]);
}

#[tokio::test]
async fn diagnostics_read_every_device() {
    let (bus, mut driver) = attach(fast_settings());

    let arm = driver.query_arm().await.unwrap();
    assert_eq!(arm[0], ("module", "GX-241 II v2.0.2.5".to_string()));
    let pump = driver.query_pump().await.unwrap();
    assert_eq!(pump[0].1, "GX Syringe Pump v1.0.6.9");
    let injector = driver.query_injector().await.unwrap();
    assert_eq!(injector[1], ("valve", "L".to_string()));

    bus.set_response(30, b'e', "30");
    let state = driver.read_error(GilsonDevice::Arm).await.unwrap();
    assert_eq!(state.code, Some(30));
    assert_eq!(state.description, Some("Z Axis stall"));
}

#[tokio::test]
async fn coordinates_read_back_after_moves() {
    let (_bus, mut driver) = attach(fast_settings());
    driver
        .move_xy(lh_core::Point2D::new(42.0, 17.5), 50.0)
        .await
        .unwrap();
    driver.move_z(80.0, 25.0).await.unwrap();

    let (xy, z) = driver.current_coordinates().await.unwrap();
    assert_eq!(xy, lh_core::Point2D::new(42.0, 17.5));
    assert_eq!(z, 80.0);
}
