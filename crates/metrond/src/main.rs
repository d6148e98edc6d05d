//! metrond - Host telemetry agent daemon.
//!
//! Samples OS metrics on per-metric schedules and ships them to a central
//! collector over TCP with failover. A master process supervises three
//! child roles (agent, update, worker), respawns crashes, and supports
//! graceful quit, escalating termination and on-disk binary hot-swap.

use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;

use clap::Parser;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{error, info};

use metron_core::config::Config;
use metron_core::daemon::daemonize;
use metron_core::logging::{LogWriter, init_logging};
use metron_core::pidfile::{PidFile, read_running};
use metron_core::pipeline::run_agent;
use metron_core::supervisor::{
    MasterSignals, Role, ShutdownFlags, SpawnPolicy, Supervisor, SystemControl,
    install_child_signals,
};
use metron_core::update::run_update;
use metron_core::worker::{resolve_module, run_worker};

/// Host telemetry agent daemon.
#[derive(Parser)]
#[command(name = "metrond", about = "Host telemetry agent daemon", version)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/usr/local/metron/conf/metrond.conf")]
    config: PathBuf,

    /// Start the daemon, or stop a running one.
    #[arg(value_enum, default_value = "start")]
    action: Action,

    /// Internal: run as a child of the given role.
    #[arg(long, hide = true)]
    role: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Action {
    Start,
    Stop,
}

fn main() {
    let args = Args::parse();

    // The log sink is part of the config, so config errors can only go to
    // stderr.
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("metrond: {}", err);
            process::exit(1);
        }
    };

    if let Some(role) = args.role.as_deref() {
        run_child(role, &config);
    }

    match args.action {
        Action::Stop => stop(&config),
        Action::Start => start(&args.config, &config),
    }
}

/// Opens the configured log sink and initializes tracing on it.
fn open_logging(config: &Config) -> LogWriter {
    let writer = match &config.log.path {
        Some(path) => match LogWriter::file(path) {
            Ok(writer) => writer,
            Err(err) => {
                eprintln!("metrond: open log {}: {}", path.display(), err);
                process::exit(1);
            }
        },
        None => LogWriter::stderr(),
    };
    init_logging(&config.log.level, writer.clone());
    writer
}

/// Entry of the spawned child roles. Never daemonizes and never touches
/// the pid file; the master owns both.
fn run_child(role: &str, config: &Config) -> ! {
    let role = match Role::from_str(role) {
        Ok(role) => role,
        Err(err) => {
            eprintln!("metrond: {}", err);
            process::exit(1);
        }
    };

    let writer = open_logging(config);
    let flags = ShutdownFlags::new();
    if let Err(err) = install_child_signals(flags.clone(), writer) {
        error!("install signal handlers failed: {}", err);
        process::exit(1);
    }

    info!("{} started", role.process_name());
    match role {
        Role::Agent => {
            if let Err(err) = run_agent(config, flags) {
                error!("agent process failed: {}", err);
                process::exit(1);
            }
        }
        Role::Update => {
            if let Err(err) = run_update(config, &flags) {
                error!("update process failed: {}", err);
                process::exit(1);
            }
        }
        Role::Worker => {
            if let Err(err) = run_worker(config, &flags) {
                error!("worker process failed: {}", err);
                process::exit(255);
            }
        }
    }
    info!("{} exit", role.process_name());
    process::exit(0);
}

fn stop(config: &Config) -> ! {
    match read_running(&config.pid_path) {
        Ok(Some(pid)) => {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                eprintln!("metrond: stop pid {}: {}", pid, err);
                process::exit(1);
            }
            process::exit(0);
        }
        Ok(None) => {
            eprintln!("metrond: no daemon running");
            process::exit(1);
        }
        Err(err) => {
            eprintln!("metrond: {}", err);
            process::exit(1);
        }
    }
}

fn start(config_path: &Path, config: &Config) -> ! {
    match read_running(&config.pid_path) {
        Ok(Some(pid)) => {
            eprintln!("metrond: already running as pid {}", pid);
            process::exit(1);
        }
        Ok(None) => {}
        Err(err) => {
            eprintln!("metrond: {}", err);
            process::exit(1);
        }
    }

    // A bad module name must not surface only after we forked a worker.
    if let Some(name) = config.worker_module.as_deref() {
        if resolve_module(name).is_none() {
            eprintln!("metrond: unknown worker module '{}'", name);
            process::exit(1);
        }
    }

    let writer = open_logging(config);

    if config.daemon {
        if let Err(err) = daemonize() {
            error!("daemonize failed: {}", err);
            eprintln!("metrond: daemonize failed: {}", err);
            process::exit(1);
        }
    }

    let mut signals = match MasterSignals::install() {
        Ok(signals) => signals,
        Err(err) => {
            error!("install signal handlers failed: {}", err);
            process::exit(1);
        }
    };

    let pidfile = match PidFile::create(&config.pid_path) {
        Ok(pidfile) => pidfile,
        Err(err) => {
            error!("create pid file {} failed: {}", config.pid_path.display(), err);
            process::exit(1);
        }
    };

    info!("metrond {} started", env!("CARGO_PKG_VERSION"));

    let control = SystemControl::new(config_path.to_path_buf());
    let mut supervisor = Supervisor::new(control, Some(pidfile), writer);
    if let Err(err) = supervisor.add_child(Role::Agent, SpawnPolicy::Respawn) {
        error!("start agent process failed: {}", err);
        process::exit(1);
    }
    if config.update.url.is_some() {
        if let Err(err) = supervisor.add_child(Role::Update, SpawnPolicy::Respawn) {
            error!("start update process failed: {}", err);
            process::exit(1);
        }
    }
    if config.worker_module.is_some() {
        if let Err(err) = supervisor.add_child(Role::Worker, SpawnPolicy::Respawn) {
            error!("start worker process failed: {}", err);
            process::exit(1);
        }
    }

    supervisor.run(signals.events());
    process::exit(0);
}
