//! SITH Daemon - Shadow/MarcDuino command server
//!
//! Hosts the SITH protocol engine behind a serial device (the way a MarcDuino
//! board listens to its Shadow controller) or a Unix socket for local tools.
//!
//! # Usage
//!
//! ```bash
//! # Socket transport with defaults
//! sith-daemon
//!
//! # Listen on a serial port
//! sith-daemon --device /dev/ttyUSB0 --baud 9600
//!
//! # Simulated hardware, call log written on exit
//! sith-daemon --hal sim
//! sith-daemon --hal logger --call-log /tmp/sith-calls.json
//!
//! # Verbose logging
//! RUST_LOG=debug sith-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGUSR1`: Log a JSON status dump

mod serial;
mod server;
mod session;
mod status;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use sith_core::{
    default_runtime_dir, load_config_from_path, ConfigOverrides, Hal, HalBackendKind,
    LoggerBackend, SithConfig, SithCore, TransportKind,
};

use server::{ServerConfig, SocketServer};
use session::Session;
use status::StatusReport;

/// SITH Daemon - Shadow/MarcDuino command server
#[derive(Parser, Debug)]
#[command(name = "sith-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SITH_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serial device to read commands from (disables the socket)
    #[arg(short = 'D', long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Serial baud rate
    #[arg(short = 'b', long)]
    baud: Option<u32>,

    /// Unix socket path for local clients
    #[arg(short = 's', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Echo each frame back before its reply
    #[arg(short = 'e', long)]
    echo: bool,

    /// HAL backend (logger, sim)
    #[arg(long = "hal", value_name = "BACKEND")]
    hal_backend: Option<HalBackendKind>,

    /// Sequence tick interval in milliseconds
    #[arg(long, value_name = "MS")]
    tick_ms: Option<u64>,

    /// Settings record path
    #[arg(long, value_name = "PATH")]
    store: Option<PathBuf>,

    /// Directory of sequence definition files
    #[arg(long, value_name = "DIR")]
    sequences: Option<PathBuf>,

    /// Write the logger backend's call log here on exit
    #[arg(long, value_name = "PATH")]
    call_log: Option<PathBuf>,

    /// PID file path
    #[arg(long, env = "SITH_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SITH_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            device: self.device.clone(),
            socket_path: self.socket_path.clone(),
            baud: self.baud,
            echo: self.echo.then_some(true),
            hal_backend: self.hal_backend,
            tick_interval_ms: self.tick_ms,
            store_path: self.store.clone(),
            sequences_dir: self.sequences.clone(),
        }
    }
}

/// Get the default PID file path
fn default_pid_path() -> PathBuf {
    default_runtime_dir().join("sith.pid")
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Check if another daemon is running by checking PID file
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str.trim().parse().context("Invalid PID in file")?;

    // Signal 0 only checks existence
    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok() {
        anyhow::bail!(
            "Another sith-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("sith_daemon={level},sith_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Resolve file, environment and CLI configuration
fn resolve_config(args: &Args) -> Result<SithConfig> {
    let mut config = load_config_from_path(args.config.clone()).context("Failed to load config")?;
    args.overrides()
        .apply(&mut config)
        .context("Invalid command-line override")?;
    info!(
        source = %config.source(),
        hal = %config.hal_backend,
        tick_ms = config.tick_interval.as_millis(),
        store = ?config.store_path,
        "Configuration resolved"
    );
    Ok(config)
}

/// Build the core, keeping a handle on the logger backend when a call log was asked for
fn build_core(
    config: &SithConfig,
    call_log: Option<&Path>,
) -> Result<(Arc<SithCore>, Option<Arc<LoggerBackend>>)> {
    let logger = match (config.hal_backend, call_log) {
        (HalBackendKind::Logger, Some(_)) => Some(Arc::new(LoggerBackend::new())),
        (HalBackendKind::Sim, Some(path)) => {
            warn!(path = ?path, "Call log needs the logger backend, ignoring");
            None
        }
        _ => None,
    };

    let core = match &logger {
        Some(logger) => {
            let hal: Arc<dyn Hal> = logger.clone();
            SithCore::from_config_with_hal(config, hal)
        }
        None => SithCore::from_config(config),
    }
    .context("Failed to build SITH core")?;

    Ok((Arc::new(core), logger))
}

/// Serve one serial device until shutdown or EOF
async fn run_serial(
    core: Arc<SithCore>,
    device: &Path,
    baud: u32,
    echo: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let port = serial::open_serial(device, baud)?;
    let session = Session::new(core, port, echo);

    tokio::select! {
        result = session.run() => {
            let stats = result.with_context(|| format!("Serial I/O failed on {device:?}"))?;
            info!(frames = stats.frames, errors = stats.errors, "Serial device closed");
        }
        _ = shutdown.wait_for(|stop| *stop) => {
            info!("Shutdown requested, closing serial device");
        }
    }
    Ok(())
}

/// Log completion notices until the engine goes away
fn spawn_notice_logger(core: &SithCore) {
    let mut notices = core.subscribe();
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match notices.recv().await {
                Ok(notice) => info!(
                    run_id = notice.run_id,
                    sequence = %notice.sequence_name,
                    reason = ?notice.reason,
                    elapsed_ms = notice.elapsed_ms,
                    steps = notice.steps_fired,
                    "Run finished"
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Completion notices dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("SITH daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = resolve_config(&args)?;
    let pid_path = args.pid_file.clone().unwrap_or_else(default_pid_path);
    info!(pid_path = ?pid_path, "PID file path");

    check_existing_daemon(&pid_path)?;
    write_pid_file(&pid_path)?;

    let (core, logger) = build_core(&config, args.call_log.as_deref())?;
    match core.startup() {
        Some(Err(e)) => warn!(error = %e, "Startup sound failed"),
        Some(Ok(())) | None => {}
    }
    spawn_notice_logger(&core);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ticker = tokio::spawn(
        Arc::clone(&core).run_ticker(config.tick_interval, shutdown_rx.clone()),
    );

    let transport = config.transport();
    let socket_server = match &transport {
        TransportKind::Socket { path } => Some(Arc::new(SocketServer::new(
            path.clone(),
            Arc::clone(&core),
            ServerConfig {
                echo: config.echo,
                ..ServerConfig::default()
            },
        ))),
        TransportKind::Serial { .. } => None,
    };

    // Signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
    {
        let core = Arc::clone(&core);
        let socket_server = socket_server.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating shutdown");
                        break;
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT, initiating shutdown");
                        break;
                    }
                    _ = sigusr1.recv() => {
                        let connections = socket_server.as_ref().map(|s| {
                            for (conn_id, stats) in s.connection_stats() {
                                info!(conn_id = %conn_id, peer_uid = ?stats.peer_uid, uptime_secs = stats.uptime_secs, "Connection");
                            }
                            s.connection_count()
                        });
                        match StatusReport::collect(&core, connections).to_json() {
                            Ok(json) => info!(status = %json, "Status dump"),
                            Err(e) => warn!(error = %e, "Failed to render status"),
                        }
                    }
                }
            }
            let _ = shutdown_tx.send(true);
        });
    }

    let result = match (&transport, socket_server) {
        (TransportKind::Serial { device, baud }, _) => {
            info!(device = ?device, baud, "Serial transport");
            run_serial(Arc::clone(&core), device, *baud, config.echo, shutdown_rx.clone()).await
        }
        (TransportKind::Socket { .. }, Some(server)) => server.run(shutdown_rx.clone()).await,
        (TransportKind::Socket { path }, None) => {
            Err(anyhow::anyhow!("No socket server for {path:?}"))
        }
    };

    // Cleanup
    info!("Shutting down...");
    for e in core.emergency_stop() {
        warn!(error = %e, "Emergency stop step failed");
    }
    ticker.abort();

    if let (Some(logger), Some(path)) = (logger, args.call_log.as_deref()) {
        match logger.save_log(path) {
            Ok(()) => info!(path = ?path, calls = logger.calls().len(), "Call log written"),
            Err(e) => warn!(error = %e, path = ?path, "Failed to write call log"),
        }
    }
    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("SITH daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_flags_become_overrides() {
        let args = Args::parse_from([
            "sith-daemon",
            "--device",
            "/dev/ttyUSB0",
            "--baud",
            "19200",
            "--hal",
            "sim",
            "--echo",
        ]);
        let overrides = args.overrides();
        assert_eq!(overrides.device, Some(PathBuf::from("/dev/ttyUSB0")));
        assert_eq!(overrides.baud, Some(19_200));
        assert_eq!(overrides.hal_backend, Some(HalBackendKind::Sim));
        assert_eq!(overrides.echo, Some(true));
        assert_eq!(overrides.tick_interval_ms, None);

        let mut config = SithConfig::default();
        overrides.apply(&mut config).unwrap();
        assert_eq!(
            config.transport(),
            TransportKind::Serial {
                device: PathBuf::from("/dev/ttyUSB0"),
                baud: 19_200
            }
        );
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Args::try_parse_from(["sith-daemon", "--hal", "gpio"]).is_err());
    }

    #[test]
    fn test_pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("sith.pid");
        write_pid_file(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );

        // Our own PID is alive, so a second daemon must refuse to start
        assert!(check_existing_daemon(&path).is_err());
        remove_pid_file(&path);
        assert!(!path.exists());
        assert!(check_existing_daemon(&path).is_ok());
    }

    #[test]
    fn test_call_log_requires_logger_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SithConfig::default();
        config.store_path = dir.path().join("settings.bin");

        let log = dir.path().join("calls.json");
        let (_core, logger) = build_core(&config, Some(&log)).unwrap();
        assert!(logger.is_some());

        config.hal_backend = HalBackendKind::Sim;
        let (core, logger) = build_core(&config, Some(&log)).unwrap();
        assert!(logger.is_none());
        assert_eq!(core.hal().name(), "sim");
    }

    #[test]
    fn test_idle_serial_line_does_not_hold_runtime_open() {
        use nix::fcntl::OFlag;
        use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
        use std::time::Duration;

        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).unwrap();
        grantpt(&master).unwrap();
        unlockpt(&master).unwrap();
        let device = PathBuf::from(ptsname_r(&master).unwrap());

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap();
            let result = runtime.block_on(async move {
                let core = Arc::new(SithCore::with_hal(Arc::new(LoggerBackend::new())));
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let serial = tokio::spawn(async move {
                    run_serial(core, &device, 9600, false, shutdown_rx).await
                });

                // Let the session park on a read with nothing to read
                tokio::time::sleep(Duration::from_millis(50)).await;
                shutdown_tx.send(true).unwrap();
                serial.await.unwrap()
            });
            drop(runtime);
            done_tx.send(result.is_ok()).unwrap();
        });

        let clean = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("runtime did not shut down");
        assert!(clean);
        drop(master);
    }
}
