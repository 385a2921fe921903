//! Worker process plumbing on the supervisor side.
//!
//! [`spawn_worker`] launches one worker process with the shared listener at a
//! fixed descriptor and wires up three tasks around it:
//!
//! - a writer draining queued [`ControlCommand`]s into the child's stdin, in order
//! - a reader forwarding [`WorkerEvent`]s from the child's stdout
//! - a reaper owning the [`Child`], reporting its exit exactly once
//!
//! Everything the tasks learn is sent to the supervisor as a [`WorkerNotice`].

use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{WorkerBootConfig, WorkerCommand};
use crate::control::{ControlCommand, LineReader, LineWriter, WorkerEvent};
use crate::error::{ControlError, SpawnError};
use crate::listener::ListenerHandle;
use crate::supervisor::WorkerId;
use crate::worker::{WORKER_CONFIG_ENV, WORKER_ID_ENV};

/// Something a worker's plumbing tasks observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerNotice {
    Event(WorkerId, WorkerEvent),
    Exited(WorkerId, ExitInfo),
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "signal {}", sig),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Supervisor-side handle to a running worker process
#[derive(Debug)]
pub struct WorkerProcess {
    id: WorkerId,
    pid: u32,
    commands: mpsc::UnboundedSender<ControlCommand>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Queue a command; commands reach the worker in the order queued
    pub fn send(&self, command: ControlCommand) -> Result<(), ControlError> {
        self.commands.send(command).map_err(|_| ControlError::Closed)
    }

    /// Ask the worker to stop gracefully through the OS, bypassing the pipe
    pub fn terminate(&self) {
        if self.pid == 0 {
            return;
        }
        debug!(worker_id = %self.id, pid = self.pid, "Sending SIGTERM to worker");

        #[cfg(unix)]
        unsafe {
            libc::kill(self.pid as i32, libc::SIGTERM);
        }
    }

    /// Kill the process outright. Only the first call has an effect.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill.take() {
            info!(worker_id = %self.id, pid = self.pid, "Killing worker");
            let _ = tx.send(());
        }
    }
}

/// Launch a worker process that inherits `listener`
pub fn spawn_worker(
    command: &WorkerCommand,
    id: WorkerId,
    listener: &ListenerHandle,
    boot: &WorkerBootConfig,
    notices: mpsc::UnboundedSender<WorkerNotice>,
) -> Result<WorkerProcess, SpawnError> {
    let program = command.program.display().to_string();
    let io_err = |source: std::io::Error| SpawnError::Io {
        worker_id: id,
        program: program.clone(),
        source,
    };

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    cmd.kill_on_drop(true);

    cmd.env(WORKER_ID_ENV, id.get().to_string());
    cmd.env(WORKER_CONFIG_ENV, serde_json::to_string(boot)?);
    listener.prepare_inheritance(&mut cmd).map_err(io_err)?;

    let mut child = cmd.spawn().map_err(io_err)?;
    let pid = child.id().unwrap_or(0);

    let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => return Err(SpawnError::MissingPipes(id)),
    };

    info!(worker_id = %id, pid, program = %program, "Worker process spawned");

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = oneshot::channel();

    tokio::spawn(write_commands(id, stdin, commands_rx));
    tokio::spawn(read_events(id, stdout, notices.clone()));
    tokio::spawn(reap(id, child, kill_rx, notices));

    Ok(WorkerProcess {
        id,
        pid,
        commands: commands_tx,
        kill: Some(kill_tx),
    })
}

/// Dropping every command sender closes the child's stdin
async fn write_commands(
    id: WorkerId,
    stdin: ChildStdin,
    mut commands: mpsc::UnboundedReceiver<ControlCommand>,
) {
    let mut writer = LineWriter::new(stdin);
    while let Some(command) = commands.recv().await {
        if let Err(e) = writer.send(&command).await {
            debug!(worker_id = %id, ?command, error = %e, "Control pipe write failed");
            return;
        }
    }
}

async fn read_events(
    id: WorkerId,
    stdout: ChildStdout,
    notices: mpsc::UnboundedSender<WorkerNotice>,
) {
    let mut reader = LineReader::new(stdout);
    loop {
        match reader.next::<WorkerEvent>().await {
            Ok(Some(event)) => {
                if notices.send(WorkerNotice::Event(id, event)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(ControlError::Codec(e)) => {
                warn!(worker_id = %id, error = %e, "Ignoring malformed worker event");
            }
            Err(e) => {
                debug!(worker_id = %id, error = %e, "Event pipe read failed");
                return;
            }
        }
    }
}

async fn reap(
    id: WorkerId,
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    notices: mpsc::UnboundedSender<WorkerNotice>,
) {
    let mut armed = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            requested = &mut kill, if armed => {
                armed = false;
                if requested.is_ok() {
                    if let Err(e) = child.start_kill() {
                        warn!(worker_id = %id, error = %e, "Failed to kill worker");
                    }
                }
            }
        }
    };

    let exit = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            warn!(worker_id = %id, error = %e, "Error waiting for worker to exit");
            ExitInfo::unknown()
        }
    };
    debug!(worker_id = %id, %exit, "Worker process reaped");
    let _ = notices.send(WorkerNotice::Exited(id, exit));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener;
    use std::time::Duration;

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: "sh".into(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn boot() -> WorkerBootConfig {
        WorkerBootConfig {
            worker: Default::default(),
            app: Default::default(),
        }
    }

    async fn next_notice(rx: &mut mpsc::UnboundedReceiver<WorkerNotice>) -> WorkerNotice {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("notice channel closed")
    }

    #[test]
    fn test_exit_info_display() {
        let clean = ExitInfo { code: Some(0), signal: None };
        assert!(clean.success());
        assert_eq!(clean.to_string(), "exit code 0");

        let killed = ExitInfo { code: None, signal: Some(9) };
        assert!(!killed.success());
        assert_eq!(killed.to_string(), "signal 9");
    }

    #[tokio::test]
    async fn test_commands_and_events_flow_through_pipes() {
        let listener = listener::bind_str("127.0.0.1:0", 16).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Echo back a ready event once the start command arrives, then exit 3
        let script = r#"read cmd; case "$cmd" in *start*) echo '{"type":"ready","pid":7}';; esac; exit 3"#;
        let worker = spawn_worker(&shell(script), WorkerId::new(1), &listener, &boot(), tx).unwrap();
        assert!(worker.pid() > 0);

        worker.send(ControlCommand::Start).unwrap();

        // Reader and reaper run independently, so the two may arrive in either order
        let notices = [next_notice(&mut rx).await, next_notice(&mut rx).await];
        assert!(notices.contains(&WorkerNotice::Event(
            WorkerId::new(1),
            WorkerEvent::Ready { pid: 7 }
        )));
        assert!(notices.contains(&WorkerNotice::Exited(
            WorkerId::new(1),
            ExitInfo { code: Some(3), signal: None }
        )));
    }

    #[tokio::test]
    async fn test_worker_sees_environment_and_listener_fd() {
        let listener = listener::bind_str("127.0.0.1:0", 16).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let script = r#"[ "$PREFORK_WORKER_ID" = "5" ] && [ "$PREFORK_LISTEN_FD" = "3" ] && [ -e /proc/self/fd/3 ] || exit 1; exit 0"#;
        let _worker = spawn_worker(&shell(script), WorkerId::new(5), &listener, &boot(), tx).unwrap();

        match next_notice(&mut rx).await {
            WorkerNotice::Exited(_, exit) => assert!(exit.success(), "child saw {}", exit),
            other => panic!("unexpected notice {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kill_reports_signal() {
        let listener = listener::bind_str("127.0.0.1:0", 16).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut worker =
            spawn_worker(&shell("sleep 30"), WorkerId::new(2), &listener, &boot(), tx).unwrap();
        worker.kill();
        // Second kill is a no-op
        worker.kill();

        match next_notice(&mut rx).await {
            WorkerNotice::Exited(_, exit) => assert_eq!(exit.signal, Some(libc::SIGKILL)),
            other => panic!("unexpected notice {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let listener = listener::bind_str("127.0.0.1:0", 16).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let command = WorkerCommand {
            program: "/nonexistent/prefork-worker".into(),
            args: vec![],
        };

        let result = spawn_worker(&command, WorkerId::new(3), &listener, &boot(), tx);
        assert!(matches!(result, Err(SpawnError::Io { .. })));
    }
}
