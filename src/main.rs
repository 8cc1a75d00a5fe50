//! TaskRun - Main Entry Point
//!
//! Command line front end for running behavioural tasks. Without a board
//! attached, tasks run against the simulated device.

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskrun_rs::{
    config::{AppConfig, ExperimentConfig},
    device::{MockDeviceBackend, MockFramePattern},
    handler::{HandlerFactory, HandlerPlugin, ScriptHandler, ScriptHandlerFactory},
    session::SessionMessage,
    sink::TracingSink,
    DeviceIdentity, ExperimentRunner, Fingerprint, SessionController, SessionState,
    SessionWorker, TaskDefinition, VariableValue,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Built-in demo task used when no task file is given
const DEMO_TASK: &str = include_str!("../demos/blinker.py");

#[derive(Debug, Parser)]
#[command(name = "taskrun", version, about = "Run behavioural state-machine tasks")]
struct Cli {
    /// Config file (defaults to the app data directory)
    #[arg(long, global = true, env = "TASKRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Also write logs to daily files in this directory
    #[arg(long, global = true, env = "TASKRUN_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the fingerprint of a task file
    Fingerprint {
        /// Task definition file
        task: PathBuf,
    },
    /// Run a task on the simulated device
    Simulate(SimulateArgs),
    /// Run an experiment file with one simulated device per subject
    Experiment {
        /// Experiment file
        file: PathBuf,
        #[command(flatten)]
        sim: SimulationOptions,
    },
    /// Validate the config and, optionally, an experiment file
    CheckConfig {
        /// Experiment file to validate
        #[arg(long)]
        experiment: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Task definition file (defaults to the built-in blinker)
    #[arg(long)]
    task: Option<PathBuf>,

    /// Port to connect to (defaults to the configured port)
    #[arg(long)]
    port: Option<String>,

    /// Set a task variable once the run starts, as NAME=VALUE
    #[arg(long = "set", value_parser = parse_assignment)]
    assignments: Vec<(String, VariableValue)>,

    #[command(flatten)]
    sim: SimulationOptions,
}

#[derive(Debug, Args)]
struct SimulationOptions {
    /// Handler script (defaults to `<handlers_dir>/<task>.rhai`)
    #[arg(long)]
    handler: Option<PathBuf>,

    /// JSON device identity the simulated board reports for the task
    #[arg(long)]
    identity: Option<PathBuf>,

    /// Number of ticks to run for
    #[arg(long, default_value_t = 500)]
    ticks: u32,
}

fn parse_assignment(input: &str) -> Result<(String, VariableValue), String> {
    let (name, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", input))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("variable name is empty".to_string());
    }
    Ok((name.to_string(), VariableValue::parse_literal(value)))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Keep the guard alive so buffered file logs are flushed on exit
    let _guard = init_logging(cli.log_dir.as_deref())?;

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_or_default(),
    };

    match cli.command {
        Command::Fingerprint { task } => {
            let fingerprint = Fingerprint::of_file(&task)
                .with_context(|| format!("Failed to hash {}", task.display()))?;
            println!("{}  {}", fingerprint, task.display());
            Ok(())
        }
        Command::Simulate(args) => simulate(&config, args),
        Command::Experiment { file, sim } => experiment(&config, &file, &sim),
        Command::CheckConfig { experiment } => check_config(&config, experiment.as_deref()),
    }
}

fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "taskrun.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,taskrun_rs=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Simulated board for a task, optionally reporting a custom identity
fn simulated_device(identity: Option<&Path>) -> anyhow::Result<MockDeviceBackend> {
    let device = MockDeviceBackend::blinker();
    if let Some(path) = identity {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read identity {}", path.display()))?;
        let identity: DeviceIdentity = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse identity {}", path.display()))?;

        let mut ids: Vec<u32> = identity.id_to_name.keys().copied().collect();
        ids.sort_unstable();
        let device = device.with_task(identity);
        if !ids.is_empty() {
            return Ok(device.with_pattern(MockFramePattern::Cycle { ids, period: 250 }));
        }
        return Ok(device);
    }
    Ok(device)
}

fn handler_factory(
    config: &AppConfig,
    handler: Option<&Path>,
) -> Arc<dyn HandlerFactory> {
    match handler {
        Some(path) => {
            let path = path.to_path_buf();
            Arc::new(
                move |_task: &TaskDefinition| -> taskrun_rs::Result<Box<dyn HandlerPlugin>> {
                    Ok(Box::new(ScriptHandler::load(&path)?))
                },
            )
        }
        None => Arc::new(ScriptHandlerFactory::new(&config.handlers_dir)),
    }
}

fn load_task(path: Option<&Path>) -> anyhow::Result<TaskDefinition> {
    match path {
        Some(path) => Ok(TaskDefinition::load(path)?),
        None => Ok(TaskDefinition::new("blinker", DEMO_TASK)),
    }
}

fn simulate(config: &AppConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let task = load_task(args.task.as_deref())?;
    let device = simulated_device(args.sim.identity.as_deref())?;
    let controller = SessionController::new(
        Box::new(device),
        handler_factory(config, args.sim.handler.as_deref()),
        Arc::new(TracingSink),
        config.session.clone(),
    );

    let (worker, handle) = SessionWorker::new(controller);
    let worker_thread = worker.spawn().context("Failed to spawn session worker")?;

    let port = args
        .port
        .or_else(|| config.default_port.clone())
        .unwrap_or_else(|| "sim0".to_string());
    handle.connect(port);
    handle.upload(task);
    handle.start_run(None);
    for (name, value) in args.assignments {
        handle.set_variable(name, value);
    }

    let started = handle.wait_for_state(Duration::from_secs(5), SessionState::is_running);
    if started {
        let run_for = config.session.tick_interval() * args.sim.ticks;
        let deadline = Instant::now() + run_for;
        let mut records = 0usize;
        while Instant::now() < deadline && handle.state().is_running() {
            match handle.recv_timeout(Duration::from_millis(50)) {
                Some(SessionMessage::Batch(batch)) => records += batch.len(),
                Some(SessionMessage::Error(e)) => tracing::warn!("{}", e),
                Some(SessionMessage::Stats(stats)) => {
                    tracing::debug!("{} ticks, {} records", stats.ticks, stats.total_records())
                }
                _ => {}
            }
        }
        tracing::info!("Received {} records", records);
        handle.stop_run();
    } else {
        for message in handle.drain() {
            if let SessionMessage::Error(e) = message {
                tracing::error!("{}", e);
            }
        }
    }

    handle.shutdown();
    let controller = worker_thread
        .join()
        .map_err(|_| anyhow!("Session worker panicked"))?;

    let stats = controller.stats();
    println!(
        "ticks={} states={} events={} prints={} analog={} faults={} variables_set={}",
        stats.ticks,
        stats.states,
        stats.events,
        stats.prints,
        stats.analog_samples,
        stats.handler_faults,
        stats.variables_set
    );

    if started {
        Ok(())
    } else {
        Err(anyhow!("Run did not start"))
    }
}

fn experiment(config: &AppConfig, file: &Path, sim: &SimulationOptions) -> anyhow::Result<()> {
    let setup = ExperimentConfig::load(file)?;
    let task = match setup.load_task(config) {
        Ok(task) => task,
        Err(e) if setup.task == "blinker" => {
            tracing::warn!("{}, using the built-in blinker task", e);
            TaskDefinition::new("blinker", DEMO_TASK)
        }
        Err(e) => return Err(e.into()),
    };

    let factory = handler_factory(config, sim.handler.as_deref());
    let mut sessions = Vec::with_capacity(setup.subjects.len());
    for subject in &setup.subjects {
        let device = simulated_device(sim.identity.as_deref())?.with_ports([subject.port.clone()]);
        sessions.push(SessionController::new(
            Box::new(device),
            factory.clone(),
            Arc::new(TracingSink),
            config.session.clone(),
        ));
    }

    let mut runner = ExperimentRunner::new(setup.info(), sessions)?;
    runner.connect_all(&setup.ports())?;
    runner.upload_all(&task)?;
    runner.start_all()?;

    let interval = config.session.tick_interval();
    for _ in 0..sim.ticks {
        let tick_started = Instant::now();
        for (subject, result) in runner.tick_all() {
            if let Err(e) = result {
                tracing::warn!("Subject {} left the run: {}", subject, e);
            }
        }
        if !runner.any_running() {
            break;
        }
        let elapsed = tick_started.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }

    let stopped = runner.stop_all();
    for (subject, session) in setup.subjects.iter().zip(runner.sessions()) {
        let stats = session.stats();
        println!(
            "{}: ticks={} records={} faults={}",
            subject.subject,
            stats.ticks,
            stats.total_records(),
            stats.handler_faults
        );
    }
    runner.disconnect_all();
    Ok(stopped?)
}

fn check_config(config: &AppConfig, experiment: Option<&Path>) -> anyhow::Result<()> {
    config.session.validate()?;
    println!("config ok: tasks in {}", config.tasks_dir.display());

    if let Some(path) = experiment {
        let setup = ExperimentConfig::load(path)?;
        let task = setup.load_task(config)?;
        println!(
            "experiment {} ok: {} subjects, task {} ({})",
            setup.name,
            setup.subjects.len(),
            task.name,
            task.fingerprint()
        );
    }
    Ok(())
}
