// ABOUTME: CLI entry point - loads the configuration, drives the run, handles restart modes
// ABOUTME: A fatal simulation error writes the error file and exits nonzero

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use log::{error, info};

use trex::engine::config::SimulationConfig;
use trex::engine::output::restart::{read_restart, write_restart, RestartMode};
use trex::engine::output::{write_error_file, OutputWriter};
use trex::engine::sim::{NullSink, TimestepController};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RestartArg {
    /// Read no restart state; write restart files at the end.
    Restart0,
    /// Read soil/sediment initial conditions (no surface water).
    Restart1,
    /// Read the full state including surface water.
    Restart2,
}

#[derive(Parser, Debug)]
#[command(name = "trex", about = "Watershed hydrology, sediment, and chemical transport simulator")]
struct Cli {
    /// Simulation configuration file (YAML).
    input: PathBuf,
    /// Optional restart behavior.
    #[arg(value_enum)]
    restart: Option<RestartArg>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            eprintln!("trex: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> trex::Result<()> {
    let config = SimulationConfig::load_from_file(&cli.input)?;
    let base = cli
        .input
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    // an automatic controller with the relaunch flag first records a
    // hydraulics-only trace, then the full run replays it
    let mut replay_trace: Option<Vec<f64>> = None;
    if config.general.timestep.wants_relaunch()
        && (config.solids.is_some() || config.chemicals.is_some())
    {
        info!("relaunch: recording hydraulics-only step-length trace");
        let (mut hydro_sim, _) = config.hydrology_only().build(&base)?;
        hydro_sim.initialize();
        hydro_sim.run(&mut NullSink)?;
        replay_trace = Some(hydro_sim.controller.trace().to_vec());
    }

    let (mut sim, mut output_config) = config.build(&base)?;
    if let Some(trace) = replay_trace {
        sim.controller = TimestepController::replay(trace);
    }

    // all outputs resolve relative to the input file's directory
    output_config.directory = base.join(&output_config.directory);
    let restart_prefix = output_config.directory.join("restart");
    let restart_mode = match cli.restart {
        Some(RestartArg::Restart0) => {
            output_config.restart_prefix = Some(restart_prefix.clone());
            RestartMode::WriteOnly
        }
        Some(RestartArg::Restart1) => RestartMode::BedOnly,
        Some(RestartArg::Restart2) => RestartMode::Full,
        None => RestartMode::WriteOnly,
    };
    if matches!(restart_mode, RestartMode::BedOnly | RestartMode::Full) {
        read_restart(&restart_prefix, &mut sim, restart_mode)?;
    }

    sim.initialize();
    let mut writer = OutputWriter::new(output_config)?;
    let error_file = base.join("simulation_error.txt");

    match sim.run(&mut writer) {
        Ok(summary) => {
            info!(
                "finished: {} steps to {:.4} h, water residual {:.3e} m3",
                summary.steps, summary.end_time_hours, summary.water_residual_m3
            );
            // restart1/restart2 reruns leave a fresh restart set behind
            if matches!(
                cli.restart,
                Some(RestartArg::Restart1) | Some(RestartArg::Restart2)
            ) {
                write_restart(&restart_prefix, &sim)?;
            }
            Ok(())
        }
        Err(err) => {
            // fatal integration errors suppress final output but always
            // leave the diagnostic behind
            write_error_file(&error_file, &err, sim.time_hours, sim.dt);
            Err(err)
        }
    }
}
