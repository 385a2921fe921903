use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::{BackoffPolicy, RestartPolicy};

/// Subcommand the supervisor passes to its own binary to start a worker
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listening socket, admin API and PID file
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker pool lifecycle settings
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Per-worker runtime settings
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Application handler the workers run
    #[serde(default)]
    pub app: AppConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the shared listener binds (default: 0.0.0.0:8000)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Listen backlog; connections beyond worker capacity queue here
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Port for the operator admin API on 127.0.0.1 (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            backlog: default_backlog(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorSettings {
    /// Number of worker processes (default: number of CPUs)
    pub workers: Option<usize>,

    /// Grace period for in-flight requests on graceful stop
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout_secs: u64,

    /// Crashes tolerated within `restart_window_secs` before restarts stop
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Length of the sliding window the restart budget is counted over
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,

    /// Delay before the first restart inside a window
    #[serde(default = "default_backoff_initial")]
    pub restart_backoff_initial_ms: u64,

    /// Upper bound for the restart delay
    #[serde(default = "default_backoff_max")]
    pub restart_backoff_max_ms: u64,

    /// Growth factor between consecutive restart delays
    #[serde(default = "default_backoff_factor")]
    pub restart_backoff_factor: f64,

    /// How often workers report a heartbeat
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a worker is considered hung and killed
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Time a new worker has to report ready
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Worker executable (default: this binary, run with the `worker` subcommand)
    pub worker_program: Option<String>,

    /// Arguments for `worker_program`
    #[serde(default)]
    pub worker_args: Vec<String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            workers: None,
            graceful_timeout_secs: default_graceful_timeout(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
            restart_backoff_initial_ms: default_backoff_initial(),
            restart_backoff_max_ms: default_backoff_max(),
            restart_backoff_factor: default_backoff_factor(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            worker_program: None,
            worker_args: Vec::new(),
        }
    }
}

impl SupervisorSettings {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count)
    }
}

/// Settings shipped to every worker process (serialized as JSON)
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Maximum concurrently open connections per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum buffered request body size in bytes
    #[serde(default = "default_max_request_body")]
    pub max_request_body_bytes: usize,

    /// Per-request handler timeout in seconds (unset: no limit)
    pub handler_timeout_secs: Option<u64>,

    /// Keep HTTP/1.1 connections alive between requests
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,

    /// Grace period for in-flight connections on graceful stop, in milliseconds.
    /// Filled in from the supervisor section.
    #[serde(default = "default_graceful_timeout_ms")]
    pub graceful_timeout_ms: u64,

    /// Heartbeat cadence. Filled in from the supervisor section.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_request_body_bytes: default_max_request_body(),
            handler_timeout_secs: None,
            keep_alive: default_keep_alive(),
            graceful_timeout_ms: default_graceful_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

impl WorkerSettings {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_secs.map(Duration::from_secs)
    }
}

/// Built-in application handler kinds
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// Reply with the request line and body
    #[default]
    Echo,
    /// Forward requests to an external application over HTTP
    Upstream,
}

/// Application handler configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Handler kind: "echo" (default) or "upstream"
    #[serde(default)]
    pub kind: AppKind,

    /// host:port of the external application (upstream only)
    pub upstream: Option<String>,

    /// Maximum idle pooled connections to the upstream
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,

    /// Idle pooled connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            kind: AppKind::default(),
            upstream: None,
            pool_max_idle: default_pool_max_idle(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl AppConfig {
    pub fn upstream(addr: &str) -> Self {
        Self {
            kind: AppKind::Upstream,
            upstream: Some(addr.to_string()),
            ..Self::default()
        }
    }
}

/// Everything a worker process needs, passed in `PREFORK_WORKER_CONFIG`
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WorkerBootConfig {
    pub worker: WorkerSettings,
    pub app: AppConfig,
}

/// Program and arguments used to launch a worker process
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Re-run the current executable with the worker subcommand
    pub fn current_exe() -> anyhow::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec![WORKER_SUBCOMMAND.to_string()],
        })
    }
}

/// Immutable runtime configuration of a supervisor instance
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub worker_count: usize,
    pub bind: SocketAddr,
    pub backlog: u32,
    pub graceful_timeout: Duration,
    pub restart: RestartPolicy,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub startup_timeout: Duration,
    pub worker_command: WorkerCommand,
    pub worker: WorkerSettings,
    pub app: AppConfig,
}

impl SupervisorConfig {
    /// Create a config with default timings
    pub fn new(worker_count: usize, bind: SocketAddr, worker_command: WorkerCommand) -> Self {
        let settings = SupervisorSettings::default();
        Self {
            worker_count,
            bind,
            backlog: default_backlog(),
            graceful_timeout: Duration::from_secs(settings.graceful_timeout_secs),
            restart: settings.restart_policy(),
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(settings.heartbeat_timeout_ms),
            startup_timeout: Duration::from_secs(settings.startup_timeout_secs),
            worker_command,
            worker: WorkerSettings::default(),
            app: AppConfig::default(),
        }
    }

    /// Set the startup timeout (builder pattern)
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the grace period (builder pattern). Kept in sync with the workers.
    pub fn with_graceful_timeout(mut self, grace: Duration) -> Self {
        self.graceful_timeout = grace;
        self.worker.graceful_timeout_ms = grace.as_millis() as u64;
        self
    }

    /// Set heartbeat cadence and timeout (builder pattern)
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self.worker.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the restart policy (builder pattern)
    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Set the application handler (builder pattern)
    pub fn with_app(mut self, app: AppConfig) -> Self {
        self.app = app;
        self
    }

    pub fn boot_config(&self) -> WorkerBootConfig {
        WorkerBootConfig {
            worker: self.worker.clone(),
            app: self.app.clone(),
        }
    }
}

impl SupervisorSettings {
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            window: Duration::from_secs(self.restart_window_secs),
            backoff: BackoffPolicy {
                first: Duration::from_millis(self.restart_backoff_initial_ms),
                max: Duration::from_millis(self.restart_backoff_max_ms),
                factor: self.restart_backoff_factor,
                jitter: true,
            },
        }
    }
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_backlog() -> u32 {
    2048
}

fn default_admin_port() -> u16 {
    9999
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_graceful_timeout() -> u64 {
    30 // 30 seconds for in-flight requests to finish
}

fn default_graceful_timeout_ms() -> u64 {
    default_graceful_timeout() * 1000
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_window() -> u64 {
    60
}

fn default_backoff_initial() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    5000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_heartbeat_timeout() -> u64 {
    10_000
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_request_body() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_keep_alive() -> bool {
    true
}

fn default_pool_max_idle() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.bind.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "server.bind '{}' is not a valid ip:port address",
                self.server.bind
            ));
        }

        if self.server.backlog == 0 {
            errors.push("server.backlog must be greater than 0".to_string());
        }

        if self.supervisor.workers == Some(0) {
            errors.push("supervisor.workers must be at least 1".to_string());
        }

        if self.supervisor.heartbeat_interval_ms == 0 {
            errors.push("supervisor.heartbeat_interval_ms must be greater than 0".to_string());
        }

        if self.supervisor.heartbeat_timeout_ms <= self.supervisor.heartbeat_interval_ms {
            errors.push(
                "supervisor.heartbeat_timeout_ms must be greater than heartbeat_interval_ms"
                    .to_string(),
            );
        }

        if self.supervisor.restart_backoff_factor < 1.0 {
            errors.push("supervisor.restart_backoff_factor must be at least 1.0".to_string());
        }

        if self.worker.max_connections == 0 {
            errors.push("worker.max_connections must be at least 1".to_string());
        }

        if self.app.kind == AppKind::Upstream && self.app.upstream.is_none() {
            errors.push("app: upstream handler requires 'upstream' field".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Build the immutable supervisor configuration
    pub fn supervisor_config(&self) -> anyhow::Result<SupervisorConfig> {
        let bind: SocketAddr = self.server.bind.parse().map_err(|e| {
            anyhow::anyhow!("Invalid bind address '{}': {}", self.server.bind, e)
        })?;

        let worker_command = match self.supervisor.worker_program {
            Some(ref program) => WorkerCommand {
                program: PathBuf::from(program),
                args: self.supervisor.worker_args.clone(),
            },
            None => WorkerCommand::current_exe()?,
        };

        let settings = &self.supervisor;
        let mut worker = self.worker.clone();
        worker.graceful_timeout_ms = settings.graceful_timeout_secs * 1000;
        worker.heartbeat_interval_ms = settings.heartbeat_interval_ms;

        Ok(SupervisorConfig {
            worker_count: settings.worker_count(),
            bind,
            backlog: self.server.backlog,
            graceful_timeout: Duration::from_secs(settings.graceful_timeout_secs),
            restart: settings.restart_policy(),
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(settings.heartbeat_timeout_ms),
            startup_timeout: Duration::from_secs(settings.startup_timeout_secs),
            worker_command,
            worker,
            app: self.app.clone(),
        })
    }
}
