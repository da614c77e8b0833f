//! `gx241`: command-line control of a Gilson GX-241 liquid handler.
//!
//! # Usage
//!
//! ```bash
//! gx241 home
//! gx241 prime --volume 2000
//! gx241 query pump
//! gx241 run operations.json --dry-run
//! gx241 campaign study.json --start-at 12
//! gx241 fluid set 500
//! gx241 --simulate run operations.json
//! ```
//!
//! Ctrl-C during `run` or `campaign` abandons the current operation and parks the
//! needle at waste.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use gilson_handler::config::{AppConfig, DEFAULT_CONFIG_PATH};
use gilson_handler::{load_study, logging, PipettingCampaign};
use lh_core::deck::{DeckLayout, HandlerBed};
use lh_core::resources::{ResourceConfig, ResourceTracker, SYSTEM_FLUID_KEY};
use lh_core::settings::GsiocTiming;
use lh_driver_gilson::Gx241Driver;
use lh_experiment::{CampaignOutcome, CampaignSession};
use lh_gsioc::{GsiocChannel, SimulatedBus};
use lh_pipetting::maintenance::DEFAULT_PRIME_CHUNK_UL;
use lh_pipetting::{load_operations, PipettingEngine, RecordingBackend};

#[derive(Parser)]
#[command(name = "gx241")]
#[command(about = "Control a Gilson GX-241 liquid handler", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Drive a simulated GSIOC bus instead of the serial port
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Home the arm and the syringe pump
    Home,

    /// Flush system fluid through the syringe to waste
    Prime {
        /// Volume to flush (uL)
        #[arg(long, default_value_t = 2000.0)]
        volume: f64,

        /// Prime the needle instead, until the operator sees liquid
        #[arg(long)]
        needle: bool,
    },

    /// Print a device's status
    Query {
        /// Device to query
        device: QueryTarget,
    },

    /// Execute a JSON list of pipetting operations
    Run {
        /// Operations file
        operations: PathBuf,

        /// Print the backend calls instead of moving hardware
        #[arg(long)]
        dry_run: bool,
    },

    /// Run every item of a study file, cleaning between items
    Campaign {
        /// Study file (JSON array of items with `name_tag` and `operations`)
        study: PathBuf,

        /// Sequence number of the first item
        #[arg(long, default_value_t = 0)]
        start_at: u64,
    },

    /// Show or set the tracked system fluid
    #[command(subcommand)]
    Fluid(FluidCommands),

    /// List serial ports
    Ports,
}

#[derive(Subcommand)]
enum FluidCommands {
    /// Print the remaining system fluid
    Show,
    /// Record a refilled reservoir
    Set {
        /// Remaining system fluid (mL)
        ml: f64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum QueryTarget {
    Pump,
    Arm,
    Injector,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = AppConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(config = %config_path.display(), name = %config.application.name, "Starting");

    match cli.command {
        Commands::Home => home(&config, cli.simulate).await,
        Commands::Prime { volume, needle } => prime(&config, cli.simulate, volume, needle).await,
        Commands::Query { device } => query(&config, cli.simulate, device).await,
        Commands::Run {
            operations,
            dry_run,
        } => run_operations(&config, cli.simulate, &operations, dry_run).await,
        Commands::Campaign { study, start_at } => {
            run_study(&config, cli.simulate, &study, start_at).await
        }
        Commands::Fluid(cmd) => fluid(&config, cmd),
        Commands::Ports => list_ports(),
    }
}

/// `config/gx241.toml` if present, else the user's config directory.
fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_PATH);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("gx241").join("gx241.toml"))
        .unwrap_or(local)
}

// =============================================================================
// Hardware setup
// =============================================================================

async fn open_driver(
    config: &AppConfig,
    simulate: bool,
    bed: Option<&HandlerBed>,
) -> Result<Gx241Driver> {
    let driver = if simulate {
        let mut settings = config.handler.clone();
        settings.serial.timing = GsiocTiming::fast();
        let bus = SimulatedBus::gilson(settings.devices);
        let channel = GsiocChannel::new(bus.attach(), settings.serial.timing.clone());
        info!("Using simulated GSIOC bus");
        Gx241Driver::new(channel, settings)
    } else {
        Gx241Driver::open(config.handler.clone())
            .await
            .with_context(|| format!("opening {}", config.handler.serial.port))?
    };
    Ok(driver
        .with_bounds(bed.and_then(|b| b.bounds()))
        .with_resources(config.deck.resource_config(bed)))
}

async fn open_engine(config: &AppConfig, simulate: bool) -> Result<PipettingEngine<Gx241Driver>> {
    let bed = config.deck.load_bed().context("loading handler bed")?;
    let mut driver = open_driver(config, simulate, bed.as_ref()).await?;
    driver.initialize().await.context("initializing handler")?;
    let engine = PipettingEngine::new(driver);
    Ok(match bed {
        Some(bed) => engine.with_deck(Arc::new(bed)),
        None => engine,
    })
}

// =============================================================================
// Commands
// =============================================================================

async fn home(config: &AppConfig, simulate: bool) -> Result<()> {
    let mut driver = open_driver(config, simulate, None).await?;
    driver.home_arm().await?;
    driver.home_pump().await?;
    println!("Arm and pump homed");
    Ok(())
}

async fn prime(config: &AppConfig, simulate: bool, volume: f64, needle: bool) -> Result<()> {
    let mut engine = open_engine(config, simulate).await?;
    let waste = &config.deck.waste;
    if needle {
        let cycles = engine.prime_needle(waste, None, None).await?;
        println!("Needle primed after {cycles} cycles");
    } else {
        engine
            .prime_system(waste, volume, DEFAULT_PRIME_CHUNK_UL)
            .await?;
        println!("Flushed {volume} uL through the system");
    }
    Ok(())
}

async fn query(config: &AppConfig, simulate: bool, target: QueryTarget) -> Result<()> {
    let mut driver = open_driver(config, simulate, None).await?;
    let fields = match target {
        QueryTarget::Pump => driver.query_pump().await?,
        QueryTarget::Arm => driver.query_arm().await?,
        QueryTarget::Injector => driver.query_injector().await?,
    };
    for (name, value) in fields {
        println!("{name:>20}: {value}");
    }
    Ok(())
}

async fn run_operations(
    config: &AppConfig,
    simulate: bool,
    path: &Path,
    dry_run: bool,
) -> Result<()> {
    let operations = load_operations(path)
        .with_context(|| format!("loading operations from {}", path.display()))?;
    info!(count = operations.len(), "Loaded operations");

    if dry_run {
        let bed = config.deck.load_bed().context("loading handler bed")?;
        let mut engine = PipettingEngine::new(RecordingBackend::new(config.handler.clone()));
        if let Some(bed) = bed {
            engine = engine.with_deck(Arc::new(bed));
        }
        engine.chain(operations).await?;
        for call in engine.backend().calls() {
            println!("{call}");
        }
        return Ok(());
    }

    let mut engine = open_engine(config, simulate).await?;
    let result = tokio::select! {
        result = engine.chain(operations) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    match result {
        Some(Ok(())) => {
            println!("Operations complete");
            Ok(())
        }
        Some(Err(e)) => {
            park(&mut engine, config).await;
            Err(e.into())
        }
        None => {
            warn!("Interrupted");
            park(&mut engine, config).await;
            bail!("interrupted")
        }
    }
}

async fn run_study(config: &AppConfig, simulate: bool, path: &Path, start_at: u64) -> Result<()> {
    let study = load_study(path)?;
    info!(items = study.len(), start_at, "Loaded study");

    let engine = open_engine(config, simulate).await?;
    let tracker = engine
        .backend()
        .resources()
        .cloned()
        .map(|r| Arc::new(r) as Arc<dyn ResourceTracker>);
    let mut campaign = PipettingCampaign::new(
        engine,
        config.deck.waste.clone(),
        config.deck.clean_volume_ul,
    )
    .with_wash(config.deck.wash.clone());
    let mut session = CampaignSession::new(start_at);
    if let Some(tracker) = tracker {
        session = session.with_tracker(tracker);
    }

    let result = tokio::select! {
        result = session.run_phase("study", study, &mut campaign) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    match result {
        Some(Ok(CampaignOutcome::Completed { next_index })) => {
            println!("Study complete, next experiment number: {next_index}");
            Ok(())
        }
        Some(Ok(CampaignOutcome::ResourceExhausted {
            next_index,
            remaining_ml,
        })) => {
            println!(
                "System fluid exhausted ({remaining_ml} mL), refill and resume with --start-at {next_index}"
            );
            park(campaign.engine_mut(), config).await;
            Ok(())
        }
        Some(Err(e)) => {
            park(campaign.engine_mut(), config).await;
            Err(e.into())
        }
        None => {
            warn!(next_index = session.next_index(), "Interrupted");
            park(campaign.engine_mut(), config).await;
            bail!("interrupted, resume with --start-at {}", session.next_index())
        }
    }
}

/// Flush and home after a failed or interrupted run. Errors are logged only.
async fn park(engine: &mut PipettingEngine<Gx241Driver>, config: &AppConfig) {
    if let Err(e) = engine
        .clean_up(&config.deck.waste, config.deck.clean_volume_ul)
        .await
    {
        warn!(error = %e, "Clean-up failed, needle may not be parked");
    }
}

fn resource_config(config: &AppConfig) -> Result<ResourceConfig> {
    let bed = config.deck.load_bed().context("loading handler bed")?;
    config
        .deck
        .resource_config(bed.as_ref())
        .context("no resource file configured (set deck.bed or deck.resources)")
}

fn fluid(config: &AppConfig, cmd: FluidCommands) -> Result<()> {
    let resources = resource_config(config)?;
    match cmd {
        FluidCommands::Show => match resources.remaining_system_fluid_ml() {
            Some(ml) => println!("{ml} mL system fluid ({})", resources.path().display()),
            None => println!("System fluid not tracked in {}", resources.path().display()),
        },
        FluidCommands::Set { ml } => {
            if !ml.is_finite() || ml < 0.0 {
                bail!("fluid volume must be a non-negative number, got {ml}");
            }
            if !resources.set_value(SYSTEM_FLUID_KEY, serde_json::json!(ml)) {
                bail!("could not write {}", resources.path().display());
            }
            println!("System fluid set to {ml} mL");
        }
    }
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let detail = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => format!(
                "USB {:04x}:{:04x} {}",
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            serialport::SerialPortType::PciPort => "PCI".to_string(),
            serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            serialport::SerialPortType::Unknown => String::new(),
        };
        println!("{}  {detail}", port.port_name);
    }
    Ok(())
}
