// src/main.rs
//! Headless force-platform recorder.
//!
//! ```bash
//! forceplate status --config ./settings
//! forceplate record --config ./settings --duration 10 --tare-after 1 --out ./results
//! ```
mod autostop;
mod barrier;
mod config;
mod drivers;
mod engine;
mod error;
mod recorder;
mod sensors;
mod session;
mod signal;
mod tare;
mod types;

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use crate::config::ConfigStore;
use crate::drivers::{DeviceFactory, HardwareFactory, SimulatedFactory};
use crate::session::Session;
use crate::signal::pipeline::COP_SUFFIX;

#[derive(Parser)]
#[command(name = "forceplate")]
#[command(about = "Synchronized force-platform and body-sensor acquisition", long_about = None)]
struct Cli {
    /// Directory holding config.yaml / custom.yaml
    #[arg(long, global = true, default_value = ".")]
    config: PathBuf,

    /// Use synthetic devices instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open every configured channel and print its state
    Status,

    /// Record a test, filter it and export the tables
    Record {
        /// Stop automatically after this many seconds
        #[arg(long, default_value_t = 10.0)]
        duration: f64,

        /// Tare calibrated sensors this many seconds into the test
        #[arg(long)]
        tare_after: Option<f64>,

        /// Cutoff frequency in Hz (defaults to the configured one, else just below Nyquist)
        #[arg(long)]
        fc: Option<f64>,

        /// Butterworth order
        #[arg(long)]
        order: Option<usize>,

        /// First exported row
        #[arg(long, default_value_t = 0)]
        from: usize,

        /// Row after the last exported one; 0 exports to the end
        #[arg(long, default_value_t = 0)]
        to: usize,

        /// Output directory for the CSV files
        #[arg(long, default_value = "results")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = ConfigStore::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let factory: Box<dyn DeviceFactory> = if cli.simulate {
        Box::new(SimulatedFactory)
    } else {
        Box::new(HardwareFactory)
    };
    let mut session = Session::new(config, factory.as_ref());
    let any = session.check_connections()?;
    print_status(&session);

    match cli.command {
        Commands::Status => Ok(()),
        Commands::Record {
            duration,
            tare_after,
            fc,
            order,
            from,
            to,
            out,
        } => {
            if !any {
                anyhow::bail!("no sensor is available, check the connections");
            }
            record(&mut session, duration, tare_after, fc, order)?;
            export(&session, &out, from, to)
        }
    }
}

fn print_status(session: &Session) {
    let registry = session.registry();
    for group in registry.groups(false) {
        println!(
            "{:<20} read={:<5} status={:?}",
            group.name(),
            group.read(),
            group.status()
        );
        for sensor in registry.sensors_of(group.id(), false) {
            println!(
                "    {:<16} {:<10} read={:<5} {}",
                sensor.name(),
                sensor.kind(),
                sensor.read(),
                sensor.state()
            );
        }
    }
}

fn record(
    session: &mut Session,
    duration: f64,
    tare_after: Option<f64>,
    fc: Option<f64>,
    order: Option<usize>,
) -> Result<()> {
    let length = Duration::try_from_secs_f64(duration).context("invalid --duration")?;
    let run_id = session.test_start(Some(length))?;
    info!("Test {run_id} started for {duration:.1} s");

    if let Some(after) = tare_after {
        thread::sleep(Duration::try_from_secs_f64(after).context("invalid --tare-after")?);
        match session.tare() {
            Ok(results) => {
                for r in results {
                    info!(
                        "Tared sensor {:?}: intercept {:.4} -> {:.4}",
                        r.sensor, r.old_intercept, r.new_intercept
                    );
                }
            }
            Err(e) => warn!("Tare skipped: {e}"),
        }
    }

    let mut last_second = u64::MAX;
    loop {
        let status = session.status();
        if !status.recording {
            break;
        }
        for id in session.sync_faults() {
            if let Some(sensor) = session.registry().sensor(id) {
                warn!("{} stopped responding, padding its column", sensor.name());
            }
        }
        if status.elapsed.as_secs() != last_second {
            last_second = status.elapsed.as_secs();
            info!("{} - {} samples", status.elapsed_label(), status.samples);
        }
        thread::sleep(Duration::from_millis(50));
    }

    let summary = session.test_stop()?;
    info!(
        "Test {} stopped: {} ticks from {} sensors",
        summary.run_id, summary.ticks, summary.sensors
    );
    for id in summary.faulted.iter().chain(&summary.lost) {
        if let Some(sensor) = session.registry().sensor(*id) {
            warn!("{} failed during the test", sensor.name());
        }
    }
    if fc.is_some() || order.is_some() {
        session.apply_filter(fc, order)?;
    }
    report_platforms(session);
    Ok(())
}

fn report_platforms(session: &Session) {
    let pipeline = session.pipeline();
    for key in pipeline.platform_figure_options() {
        if key.ends_with(COP_SUFFIX) {
            match pipeline.platform_cop(key) {
                Ok(cop) => match cop.ellipse {
                    Some(e) => info!(
                        "{key}: COP ellipse area {:.3} cm2, axes {:.2}/{:.2} mm",
                        e.area_cm2, e.a, e.b
                    ),
                    None => info!("{key}: not enough samples for an ellipse"),
                },
                Err(e) => warn!("{key}: {e}"),
            }
        } else {
            match pipeline.platform_forces(key) {
                Ok(forces) => {
                    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len().max(1) as f64;
                    info!(
                        "{key}: mean Fx {:.2} N, Fy {:.2} N, Fz {:.2} N",
                        mean(&forces.x.total),
                        mean(&forces.y.total),
                        mean(&forces.z.total)
                    );
                }
                Err(e) => warn!("{key}: {e}"),
            }
        }
    }
}

fn export(session: &Session, out: &Path, from: usize, to: usize) -> Result<()> {
    let files = session
        .export(out, from, to)
        .with_context(|| format!("exporting to {}", out.display()))?;
    for file in files {
        println!("{}", file.display());
    }
    Ok(())
}
