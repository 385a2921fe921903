//! preforkctl - operator CLI for a running prefork supervisor
//!
//! Usage:
//!   preforkctl status                 Show the worker pool
//!   preforkctl reload                 Rolling reload of every worker
//!   preforkctl restart <id>           Replace one worker
//!   preforkctl shutdown [--immediate] Stop the supervisor
//!
//! Talks to the admin API at `PREFORK_ADMIN_URL` using `PREFORK_ADMIN_TOKEN`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Default admin API URL
const DEFAULT_ADMIN_URL: &str = "http://127.0.0.1:9999";

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Version,
    Status,
    Reload,
    Restart(u64),
    Shutdown { immediate: bool },
}

#[derive(Debug, Deserialize)]
struct WorkerStats {
    active_connections: usize,
    requests_served: u64,
    handler_errors: u64,
}

#[derive(Debug, Deserialize)]
struct WorkerInfo {
    id: u64,
    generation: u64,
    pid: u32,
    state: String,
    uptime_secs: u64,
    restart_count: u32,
    stats: WorkerStats,
}

#[derive(Debug, Deserialize)]
struct PoolStatus {
    bind: String,
    target_workers: usize,
    generation: u64,
    ready: usize,
    starting: usize,
    draining: usize,
    total_restarts: u64,
    restart_budget_exhausted: bool,
    reload_in_progress: bool,
    shutting_down: bool,
    workers: Vec<WorkerInfo>,
}

struct ApiClient {
    base_url: String,
    token: String,
}

impl ApiClient {
    fn new() -> Self {
        let base_url = env::var("PREFORK_ADMIN_URL").unwrap_or_else(|_| DEFAULT_ADMIN_URL.to_string());
        let token = env::var("PREFORK_ADMIN_TOKEN").unwrap_or_default();
        Self { base_url, token }
    }

    /// Send one request and return (status code, body)
    fn request(&self, method: &str, path: &str) -> Result<(u16, String)> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let url = url.strip_prefix("http://").unwrap_or(&url);
        let (host_port, path) = match url.find('/') {
            Some(idx) => (&url[..idx], &url[idx..]),
            None => (url, "/"),
        };

        let mut stream = TcpStream::connect(host_port)
            .with_context(|| format!("Failed to connect to admin API at {}", self.base_url))?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(Duration::from_secs(30)))?;

        let request = format!(
            "{} {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Authorization: Bearer {}\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\
             \r\n",
            method, path, host_port, self.token
        );
        stream.write_all(request.as_bytes())?;
        stream.flush()?;

        let mut response = String::new();
        stream.read_to_string(&mut response)?;
        parse_response(&response)
    }
}

fn parse_response(response: &str) -> Result<(u16, String)> {
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .context("Malformed response from admin API")?;
    let body = match response.find("\r\n\r\n") {
        Some(idx) => response[idx + 4..].to_string(),
        None => String::new(),
    };
    Ok((status, body))
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| body.trim().to_string())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let client = ApiClient::new();

    match parse_command(&args)? {
        Command::Help => print_help(),
        Command::Version => println!("preforkctl {}", env!("CARGO_PKG_VERSION")),
        Command::Status => handle_status(&client)?,
        Command::Reload => handle_reload(&client, "/reload")?,
        Command::Restart(id) => handle_reload(&client, &format!("/workers/{}/reload", id))?,
        Command::Shutdown { immediate } => handle_shutdown(&client, immediate)?,
    }

    Ok(())
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };

    match first.as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "version" | "--version" | "-V" => Ok(Command::Version),
        "status" => Ok(Command::Status),
        "reload" => Ok(Command::Reload),
        "restart" => {
            let id = args
                .get(1)
                .context("Usage: preforkctl restart <worker-id>")?
                .parse::<u64>()
                .context("Worker id must be a number")?;
            Ok(Command::Restart(id))
        }
        "shutdown" => Ok(Command::Shutdown {
            immediate: args.iter().skip(1).any(|a| a == "--immediate"),
        }),
        other => anyhow::bail!("Unknown command '{}'. Run 'preforkctl help' for usage.", other),
    }
}

fn handle_status(client: &ApiClient) -> Result<()> {
    let (status, body) = client.request("GET", "/status")?;
    if status != 200 {
        anyhow::bail!("Status request failed ({}): {}", status, error_message(&body));
    }
    let pool: PoolStatus = serde_json::from_str(&body).context("Failed to parse status response")?;

    println!("Listening on {} (generation {})", pool.bind, pool.generation);
    println!(
        "Workers: {}/{} ready, {} starting, {} draining",
        pool.ready, pool.target_workers, pool.starting, pool.draining
    );
    println!(
        "Restarts: {}{}",
        pool.total_restarts,
        if pool.restart_budget_exhausted { " (budget exhausted)" } else { "" }
    );
    if pool.reload_in_progress {
        println!("Reload in progress");
    }
    if pool.shutting_down {
        println!("Shutting down");
    }
    println!();

    println!("  ID     GEN  PID      STATE     UPTIME  RESTARTS  ACTIVE  REQUESTS  ERRORS");
    println!("  ─────────────────────────────────────────────────────────────────────────");
    for w in &pool.workers {
        println!(
            "  {:<6} {:<4} {:<8} {:<9} {:>5}s  {:>8}  {:>6}  {:>8}  {:>6}",
            w.id,
            w.generation,
            w.pid,
            w.state,
            w.uptime_secs,
            w.restart_count,
            w.stats.active_connections,
            w.stats.requests_served,
            w.stats.handler_errors
        );
    }

    Ok(())
}

fn handle_reload(client: &ApiClient, path: &str) -> Result<()> {
    let (status, body) = client.request("POST", path)?;
    match status {
        202 => {
            let generation = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("generation").and_then(|g| g.as_u64()));
            match generation {
                Some(g) => println!("Reload started (generation {})", g),
                None => println!("Reload started"),
            }
            Ok(())
        }
        409 => {
            println!("A reload is already in progress");
            Ok(())
        }
        _ => anyhow::bail!("Reload failed ({}): {}", status, error_message(&body)),
    }
}

fn handle_shutdown(client: &ApiClient, immediate: bool) -> Result<()> {
    let mode = if immediate { "immediate" } else { "graceful" };
    let (status, body) = client.request("POST", &format!("/shutdown?mode={}", mode))?;
    if status != 202 {
        anyhow::bail!("Shutdown failed ({}): {}", status, error_message(&body));
    }
    println!("Shutdown ({}) requested", mode);
    Ok(())
}

fn print_help() {
    println!(
        r#"
preforkctl - control a running prefork supervisor

USAGE:
    preforkctl <command> [options]

COMMANDS:
    status                   Show workers and pool counters
    reload                   Replace every worker, one at a time
    restart <id>             Replace a single worker
    shutdown [--immediate]   Stop the supervisor (graceful by default)
    version                  Show version
    help                     Show this help

ENVIRONMENT:
    PREFORK_ADMIN_URL        Admin API URL (default: {})
    PREFORK_ADMIN_TOKEN      Admin API bearer token
"#,
        DEFAULT_ADMIN_URL
    );
}
