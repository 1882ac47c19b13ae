//! Forceps Trainer - Main entry point
//!
//! Replays recorded forceps delivery sessions through the step sequencer
//! and evaluation engine, and inspects the effective step table.

mod config;
mod replay;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forceps_core::sequencer::StepSequencer;
use forceps_core::tool::ToolId;
use forceps_scene::AssetManifest;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::replay::{ReplayReport, ReplaySession};

#[derive(Parser, Debug)]
#[command(name = "forceps-trainer")]
#[command(about = "Forceps delivery training: session replay and step inspection")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "forceps-trainer.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a JSON-lines recording of a training session
    Replay {
        /// Recording file
        recording: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the step table with tolerances applied
    Steps,
    /// Write a default configuration file
    InitConfig {
        /// Destination (defaults to --config)
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Forceps Trainer v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::InitConfig { path } => {
            let path = path.unwrap_or(args.config);
            config::save_default_config(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
        }
        Command::Steps => {
            let config = config::load_config(&args.config)?;
            let table = config.step_table()?;
            print!("{}", toml::to_string_pretty(&table)?);
        }
        Command::Replay { recording, json } => {
            let config = config::load_config(&args.config)?;
            let report = run_replay(&config, &recording)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
    }

    Ok(())
}

fn run_replay(config: &Config, recording: &Path) -> Result<ReplayReport> {
    let assets_path = Path::new(&config.session.assets);
    let manifest = AssetManifest::from_file(assets_path)
        .with_context(|| format!("Failed to load assets {}", assets_path.display()))?;
    let base_dir = assets_path.parent().unwrap_or_else(|| Path::new("."));
    let scene = manifest.load_scene(base_dir)?;
    let tools = manifest.tool_set()?;
    let tool_models: Vec<_> = manifest
        .tool
        .iter()
        .filter_map(|t| t.model.clone().map(|m| (ToolId::new(&t.name), m)))
        .collect();

    let table = config.step_table()?;
    info!(
        steps = table.len(),
        tools = tools.len(),
        extra_distance_mm = config.tolerance.extra_distance_mm,
        extra_angle_deg = config.tolerance.extra_angle_deg,
        "Session ready"
    );
    let sequencer = StepSequencer::new(table, config.sequencer_options())?;

    let events = replay::read_events(recording)?;
    let mut session = ReplaySession::new(
        scene,
        tools,
        &tool_models,
        sequencer,
        config.max_sample_age(),
        config.tracking.surface_search_radius_mm,
    )?;
    for event in events {
        session.apply(event)?;
    }

    let report = session.finish();
    info!(
        session = %report.session_id,
        events = report.events,
        state = %report.final_state,
        "Replay finished"
    );
    Ok(report)
}

fn print_report(report: &ReplayReport) {
    println!(
        "Session {} ({} events, {} rejected)",
        report.session_id, report.events, report.rejected_events
    );
    println!("Final state: {}", report.final_state);
    for step in &report.steps {
        let verdict = step
            .last_verdict
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  - {} ({}): {} evaluations, {} pass, {} fail, {} inconclusive, {} errors, last {}{}",
            step.title,
            step.step,
            step.evaluations,
            step.passes,
            step.failures,
            step.inconclusive,
            step.errors,
            verdict,
            if step.advance_ready { ", ready" } else { "" }
        );
        for message in &step.last_violations {
            println!("      {}", message);
        }
    }
}
