//! CLI Entry Point for the DSLM acquisition core
//!
//! Runs the complete scan/acquire/save pipeline against simulated hardware:
//! - `dslm run` scans in the chosen mode for a fixed time, optionally saving a dataset
//! - `dslm config` prints the effective configuration
//!
//! # Usage
//!
//! Preview a volumetric scan for ten seconds:
//! ```bash
//! dslm run --mode volumetric --seconds 10
//! ```
//!
//! Save five seconds of volumes:
//! ```bash
//! dslm run --mode volumetric --seconds 5 --save /tmp/dslm_run
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dslm_daq::config::{DslmConfig, DEFAULT_CONFIG_PATH};
use dslm_daq::hardware::mock::{MockBoardOpener, MockCamera};
use dslm_daq::pipeline::Microscope;
use dslm_daq::scanning::{
    PlanarScanning, ScanParameters, ScanningMode, SyncCoefficients, TriggeringParameters,
    ZManual, ZParameters, ZScanning,
};
use dslm_daq::tracing_setup;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "dslm")]
#[command(about = "Light-sheet scanning and acquisition core with simulated hardware", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for a fixed time
    Run {
        /// Scan mode
        #[arg(long, value_enum, default_value_t = Mode::Volumetric)]
        mode: Mode,

        /// Run time in seconds
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// Planes per volume (volumetric mode)
        #[arg(long, default_value = "20")]
        planes: usize,

        /// Volume rate or planar trigger rate, Hz
        #[arg(long, default_value = "2.0")]
        rate: f64,

        /// Save the run below this directory
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Planar,
    Volumetric,
    TriggeredPlanar,
}

fn scan_parameters(mode: Mode, planes: usize, rate: f64) -> ScanParameters {
    let xy = PlanarScanning::default();
    let manual = ZParameters::Manual(ZManual {
        piezo: 100.0,
        lateral: 0.0,
        frontal: 0.0,
    });
    match mode {
        Mode::Planar => ScanParameters {
            mode: ScanningMode::Planar,
            z: manual,
            xy,
            triggering: TriggeringParameters::default(),
        },
        Mode::TriggeredPlanar => ScanParameters {
            mode: ScanningMode::TriggeredPlanar,
            z: manual,
            xy,
            triggering: TriggeringParameters {
                n_planes: 1,
                frequency: Some(rate),
                ..Default::default()
            },
        },
        Mode::Volumetric => ScanParameters {
            mode: ScanningMode::Volumetric,
            z: ZParameters::Scanning(ZScanning {
                piezo_min: 0.0,
                piezo_max: 200.0,
                frequency: rate,
                lateral_sync: SyncCoefficients::new(0.0, 0.001),
                frontal_sync: SyncCoefficients::new(0.0, 0.001),
            }),
            xy,
            triggering: TriggeringParameters {
                n_planes: planes,
                n_skip_start: 1,
                n_skip_end: 1,
                frequency: None,
            },
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DslmConfig::load_from(&cli.config)?;
    config.validate()?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Run {
            mode,
            seconds,
            planes,
            rate,
            save,
        } => {
            tracing_setup::init_from_config(&config)?;
            run(config, scan_parameters(mode, planes, rate), seconds, save).await
        }
    }
}

async fn run(
    config: DslmConfig,
    parameters: ScanParameters,
    seconds: u64,
    save: Option<PathBuf>,
) -> Result<()> {
    if config.scanning.backend != "mock" || config.camera.backend != "mock" {
        bail!(
            "unsupported hardware backend (scanning '{}', camera '{}'); only 'mock' is built in",
            config.scanning.backend,
            config.camera.backend
        );
    }

    let opener = MockBoardOpener::from_config(&config.scanning).realtime();
    let [height, width] = config.camera.sensor_resolution;
    let camera = MockCamera::new((height, width)).with_trigger_line(opener.trigger_line());

    let mut microscope = Microscope::start(&config, Box::new(opener), Box::new(camera))?;
    microscope.set_scan_parameters(parameters)?;

    let duration = Duration::from_secs(seconds);
    if let Some(dir) = &save {
        microscope.set_output_dir(dir.clone())?;
        microscope.set_experiment_duration(duration)?;
        microscope.start_experiment()?;
    }

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("interrupted");
                break;
            }
            _ = report.tick() => {
                let mut volumes = 0usize;
                while microscope.next_volume().is_some() {
                    volumes += 1;
                }
                let fps = microscope.latest_frame_rate();
                match microscope.latest_saving_status() {
                    Some(status) => tracing::info!(
                        ?fps,
                        volumes,
                        saved = status.i_volume,
                        target = status.n_volumes,
                        "status"
                    ),
                    None => tracing::info!(?fps, volumes, "status"),
                }
                for error in microscope.storage_errors() {
                    tracing::error!(%error, "saving failed");
                }
            }
        }
    }

    if save.is_some() && microscope.is_saving() {
        microscope.end_experiment()?;
    }
    let stats = tokio::task::spawn_blocking(move || {
        if save.is_some() {
            microscope.wait_for_saving_stopped(Duration::from_secs(5));
        }
        microscope.shutdown()
    })
    .await??;

    tracing::info!(
        scanner = ?stats.scanner,
        camera = ?stats.camera,
        dispatcher = ?stats.dispatcher,
        sessions = stats.sessions.len(),
        "finished"
    );
    Ok(())
}
