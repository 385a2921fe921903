use prefork::admin::{AdminServer, PKG_NAME, VERSION};
use prefork::config::{Config, WORKER_SUBCOMMAND};
use prefork::control::ShutdownMode;
use prefork::error::SupervisorError;
use prefork::supervisor::{ExitReason, ReloadOutcome, Supervisor, SupervisorHandle};
use prefork::worker;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Config file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "prefork.toml";

/// Exit code for startup failures to bind the listening socket
const EXIT_BIND_ERROR: i32 = 2;

fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let code = if args.get(1).map(String::as_str) == Some(WORKER_SUBCOMMAND) {
        match worker::run_process() {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "Worker failed");
                1
            }
        }
    } else {
        match run_supervisor(args.get(1).map(PathBuf::from)) {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "Fatal error");
                1
            }
        }
    };

    std::process::exit(code);
}

/// Logs go to stderr: in worker processes stdout carries the control pipe
fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "prefork=debug".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn run_supervisor(config_path: Option<PathBuf>) -> anyhow::Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(supervise(config_path))
}

fn load_config(config_path: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => PathBuf::from(DEFAULT_CONFIG_PATH),
        None => {
            info!("No configuration file, using defaults");
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }
    };

    let config = Config::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

async fn supervise(config_path: Option<PathBuf>) -> anyhow::Result<i32> {
    let config = load_config(config_path)?;
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let supervisor_config = config.supervisor_config()?;
    let (supervisor, pool_task) = match Supervisor::start(supervisor_config).await {
        Ok(started) => started,
        Err(SupervisorError::Bind(e)) => {
            error!(error = %e, "Failed to bind listening socket");
            return Ok(EXIT_BIND_ERROR);
        }
        Err(SupervisorError::RestartBudgetExhausted) => {
            error!("Workers failed to start within the restart budget");
            return Ok(ExitReason::RestartBudgetExhausted.exit_code());
        }
        Err(e) => return Err(e.into()),
    };

    info!(addr = %supervisor.local_addr(), "Serving");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid admin bind address: {}", e))?;

        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(admin_addr, supervisor.clone(), shutdown_rx, admin_token);
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    let reason = wait_for_exit(&supervisor, pool_task).await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = admin_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!(?reason, "Shutdown complete");
    Ok(reason.exit_code())
}

/// Relay operator signals to the supervisor until its control loop ends
#[cfg(unix)]
async fn wait_for_exit(
    supervisor: &SupervisorHandle,
    mut pool_task: JoinHandle<ExitReason>,
) -> anyhow::Result<ExitReason> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            result = &mut pool_task => {
                return result.map_err(|e| anyhow::anyhow!("Supervisor task failed: {}", e));
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                request_shutdown(supervisor, ShutdownMode::Graceful).await;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                request_shutdown(supervisor, ShutdownMode::Graceful).await;
            }
            _ = sigquit.recv() => {
                info!("Received SIGQUIT, shutting down immediately...");
                request_shutdown(supervisor, ShutdownMode::Immediate).await;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading workers...");
                match supervisor.reload().await {
                    Ok(ReloadOutcome::Started { generation }) => info!(generation, "Reload started"),
                    Ok(ReloadOutcome::AlreadyInProgress) => info!("Reload already in progress"),
                    Err(e) => warn!(error = %e, "Reload rejected"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_exit(
    supervisor: &SupervisorHandle,
    mut pool_task: JoinHandle<ExitReason>,
) -> anyhow::Result<ExitReason> {
    loop {
        tokio::select! {
            result = &mut pool_task => {
                return result.map_err(|e| anyhow::anyhow!("Supervisor task failed: {}", e));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                request_shutdown(supervisor, ShutdownMode::Graceful).await;
            }
        }
    }
}

async fn request_shutdown(supervisor: &SupervisorHandle, mode: ShutdownMode) {
    if let Err(e) = supervisor.shutdown(mode).await {
        warn!(error = %e, "Shutdown request failed");
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another supervisor is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Only truncate once the lock is ours
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting supervisor");
    info!(
        bind = %config.server.bind,
        backlog = config.server.backlog,
        admin_port = config.server.admin_port,
        "Server configuration"
    );
    info!(
        workers = config.supervisor.worker_count(),
        graceful_timeout_secs = config.supervisor.graceful_timeout_secs,
        max_restarts = config.supervisor.max_restarts,
        restart_window_secs = config.supervisor.restart_window_secs,
        heartbeat_timeout_ms = config.supervisor.heartbeat_timeout_ms,
        "Supervisor settings"
    );
    info!(
        max_connections = config.worker.max_connections,
        max_request_body_bytes = config.worker.max_request_body_bytes,
        handler_timeout_secs = ?config.worker.handler_timeout_secs,
        keep_alive = config.worker.keep_alive,
        "Worker settings"
    );
    info!(app = ?config.app.kind, upstream = ?config.app.upstream, "Application handler");
}
