//! Command-line controller for Octo smart beds.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use octo_bed_controller::domain::settings::SettingsService;
use octo_bed_controller::infrastructure::bluetooth::btleplug::{discover_beds, BtleplugTransport};
use octo_bed_controller::infrastructure::logging::init_logger;
use octo_bed_controller::{Axis, BedEvent, DeviceIdentity, MovementState, OctoBed};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[derive(Parser)]
#[command(name = "octo-bed")]
#[command(about = "Control an Octo smart bed over Bluetooth LE")]
struct Cli {
    /// Bed address; defaults to the one saved in settings
    #[arg(short, long, global = true)]
    address: Option<String>,
    /// 4-digit PIN; defaults to the one saved in settings
    #[arg(short, long, global = true)]
    pin: Option<String>,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Section {
    Head,
    Feet,
}

impl From<Section> for Axis {
    fn from(section: Section) -> Self {
        match section {
            Section::Head => Axis::Head,
            Section::Feet => Axis::Feet,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby beds
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Move the head section to a position (0-100)
    Head { percent: f64 },
    /// Move the feet section to a position (0-100)
    Feet { percent: f64 },
    /// Move both sections to a position (0-100)
    Both { percent: f64 },
    /// Stop all motion
    Stop,
    /// Switch the under-bed light
    Light {
        #[arg(value_enum)]
        state: Switch,
    },
    /// Measure the full-travel time of a section (Ctrl-C when fully raised)
    Calibrate {
        #[arg(value_enum)]
        section: Section,
    },
    /// Set the full-travel time in seconds
    Travel { seconds: u32 },
    /// Connect and check that the bed accepts the PIN
    VerifyPin,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = SettingsService::new()?;

    let level = match cli.verbose {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    };
    let _guard = init_logger(&settings.get().log_settings, level)?;

    match cli.command {
        Commands::Scan { duration } => {
            println!("Scanning for beds ({} seconds)...", duration);
            let beds = discover_beds(Duration::from_secs(duration)).await?;
            println!("Found {} bed(s):", beds.len());
            for bed in beds {
                let rssi = bed
                    .rssi
                    .map(|r| format!("{} dBm", r))
                    .unwrap_or_else(|| "N/A".to_string());
                println!("  {} ({}) RSSI: {}", bed.name, bed.address, rssi);
            }
            return Ok(());
        }
        Commands::Travel { seconds } => {
            let applied = settings.update_full_travel(seconds)?;
            println!("Full travel set to {}s", applied);
            return Ok(());
        }
        _ => {}
    }

    let address = cli
        .address
        .clone()
        .or_else(|| settings.get().device_address.clone())
        .ok_or_else(|| anyhow!("No bed address given and none saved in settings"))?;
    let pin = cli
        .pin
        .clone()
        .or_else(|| settings.get().pin.clone())
        .ok_or_else(|| anyhow!("No PIN given and none saved in settings"))?;
    let identity = DeviceIdentity::new(address.clone(), &pin)?;
    let config = settings.get().bed_config();

    if let Commands::VerifyPin = cli.command {
        let bed = OctoBed::new(BtleplugTransport::new(), identity, config)?;
        let result = async {
            bed.open_link().await?;
            bed.verify_pin().await
        }
        .await;
        bed.close().await;
        result.context("PIN verification failed")?;
        settings.remember_device(&address, &pin)?;
        println!("PIN accepted by {}", address);
        return Ok(());
    }

    let bed = OctoBed::connect(BtleplugTransport::new(), identity, config)
        .await
        .with_context(|| format!("Could not connect to {}", address))?;
    if cli.address.is_some() || cli.pin.is_some() {
        settings.remember_device(&address, &pin)?;
    }

    let result = run(&bed, &mut settings, cli.command).await;
    bed.close().await;
    result
}

async fn run(
    bed: &OctoBed<BtleplugTransport>,
    settings: &mut SettingsService,
    command: Commands,
) -> anyhow::Result<()> {
    match command {
        Commands::Head { percent } => move_to(bed, Axis::Head, percent).await,
        Commands::Feet { percent } => move_to(bed, Axis::Feet, percent).await,
        Commands::Both { percent } => move_to(bed, Axis::Both, percent).await,
        Commands::Stop => {
            bed.motion().stop().await?;
            println!("Stopped");
            Ok(())
        }
        Commands::Light { state } => {
            match state {
                Switch::On => bed.light_on().await?,
                Switch::Off => bed.light_off().await?,
            }
            println!("Light {}", if matches!(state, Switch::On) { "on" } else { "off" });
            Ok(())
        }
        Commands::Calibrate { section } => {
            let axis = Axis::from(section);
            bed.start_calibration(axis).await?;
            println!("Raising {}; press Ctrl-C when it is fully up", axis);
            tokio::signal::ctrl_c().await?;

            println!("Lowering {}...", axis);
            let measured = bed.complete_calibration().await?;
            let applied = settings.update_full_travel(measured)?;
            println!("Full travel measured {}s, saved {}s", measured, applied);
            Ok(())
        }
        Commands::Scan { .. } | Commands::Travel { .. } | Commands::VerifyPin => Ok(()),
    }
}

/// Start a move and wait until the estimator reports the axis idle.
async fn move_to(bed: &OctoBed<BtleplugTransport>, axis: Axis, percent: f64) -> anyhow::Result<()> {
    let mut events = bed.subscribe();
    bed.set_target_position(axis, percent).await?;

    while bed.snapshot(axis).movement != MovementState::Idle {
        match events.recv().await {
            Ok(BedEvent::Axis(snapshot)) if snapshot.axis == axis => {
                info!("{} at {:.1}%", axis, snapshot.position);
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }

    println!("{} at {:.0}%", axis, bed.snapshot(axis).position);
    Ok(())
}
