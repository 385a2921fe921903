//! Control channel between the supervisor and its workers.
//!
//! Each worker has one ordered pipe in each direction: the supervisor writes
//! [`ControlCommand`]s to the worker's stdin and reads [`WorkerEvent`]s from
//! its stdout, one JSON object per line. Commands to a single worker therefore
//! arrive in send order. Handling on the worker side is idempotent: stop
//! requests go through a [`StopSignal`], which only ever escalates.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::watch;

use crate::error::ControlError;

/// Supervisor → worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Begin accepting connections
    Start,
    /// Stop accepting, finish in-flight work within the grace period
    GracefulStop,
    /// Close every connection and exit now
    ImmediateStop,
    /// Liveness probe; answered with a heartbeat event
    Heartbeat,
}

/// Counters a worker reports with every heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub requests_served: u64,
    pub handler_errors: u64,
}

/// Worker → supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Entered the accept loop
    Ready { pid: u32 },
    /// Periodic liveness report from the event loop
    Heartbeat { stats: WorkerStatsSnapshot },
    /// Stopped accepting; `in_flight` connections still open
    Draining { in_flight: usize },
    /// Accept loop and all connections finished; `forced` were cut at the deadline
    Stopped { forced: usize },
}

/// How an operator wants the pool shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    Graceful,
    Immediate,
}

impl std::str::FromStr for ShutdownMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "graceful" => Ok(ShutdownMode::Graceful),
            "immediate" => Ok(ShutdownMode::Immediate),
            other => Err(format!("unknown shutdown mode '{}'", other)),
        }
    }
}

/// Encode a message as one newline-terminated JSON line
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Vec<u8>, ControlError> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one line (without its terminator)
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ControlError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Reads JSON-line messages from a pipe
pub struct LineReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next message, or `None` once the writer has closed the pipe
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ControlError> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode_line(&line).map(Some),
                None => return Ok(None),
            }
        }
    }
}

/// Writes JSON-line messages to a pipe, flushing after each one
pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), ControlError> {
        let line = encode_line(msg)?;
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Requested stop level of a worker. Ordered: requests only escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopMode {
    Running,
    Graceful,
    Immediate,
}

/// Idempotent stop request shared by everything that can stop a worker
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<StopMode>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StopMode::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Request a stop. Returns true if this escalated the current mode.
    pub fn request(&self, mode: StopMode) -> bool {
        self.tx.send_if_modified(|current| {
            if mode > *current {
                *current = mode;
                true
            } else {
                false
            }
        })
    }

    pub fn current(&self) -> StopMode {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> StopWatcher {
        StopWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of a [`StopSignal`]
#[derive(Debug, Clone)]
pub struct StopWatcher {
    rx: watch::Receiver<StopMode>,
}

impl StopWatcher {
    /// Resolves once the stop mode is at least `mode`, returning the mode seen
    pub async fn at_least(&mut self, mode: StopMode) -> StopMode {
        loop {
            let current = *self.rx.borrow_and_update();
            if current >= mode {
                return current;
            }
            if self.rx.changed().await.is_err() {
                // Every StopSignal is gone; nothing can stop us any more.
                return futures::future::pending().await;
            }
        }
    }

    pub fn current(&self) -> StopMode {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let line = encode_line(&ControlCommand::GracefulStop).unwrap();
        assert_eq!(line, b"{\"type\":\"graceful_stop\"}\n");

        let cmd: ControlCommand = decode_line("{\"type\":\"immediate_stop\"}").unwrap();
        assert_eq!(cmd, ControlCommand::ImmediateStop);
    }

    #[test]
    fn test_event_wire_format() {
        let line = encode_line(&WorkerEvent::Ready { pid: 42 }).unwrap();
        let text = String::from_utf8(line).unwrap();
        assert_eq!(text, "{\"type\":\"ready\",\"pid\":42}\n");
    }

    #[test]
    fn test_decode_rejects_unknown_message() {
        let result: Result<ControlCommand, _> = decode_line("{\"type\":\"explode\"}");
        assert!(matches!(result, Err(ControlError::Codec(_))));
    }

    #[test]
    fn test_shutdown_mode_parse() {
        assert_eq!("graceful".parse::<ShutdownMode>(), Ok(ShutdownMode::Graceful));
        assert_eq!("immediate".parse::<ShutdownMode>(), Ok(ShutdownMode::Immediate));
        assert!("later".parse::<ShutdownMode>().is_err());
    }

    #[tokio::test]
    async fn test_pipe_preserves_order_and_skips_blank_lines() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = LineWriter::new(client);
        let mut reader = LineReader::new(server);

        writer.send(&ControlCommand::Start).await.unwrap();
        writer.send(&ControlCommand::Heartbeat).await.unwrap();
        writer.send(&ControlCommand::GracefulStop).await.unwrap();
        drop(writer);

        assert_eq!(reader.next::<ControlCommand>().await.unwrap(), Some(ControlCommand::Start));
        assert_eq!(
            reader.next::<ControlCommand>().await.unwrap(),
            Some(ControlCommand::Heartbeat)
        );
        assert_eq!(
            reader.next::<ControlCommand>().await.unwrap(),
            Some(ControlCommand::GracefulStop)
        );
        assert_eq!(reader.next::<ControlCommand>().await.unwrap(), None);
    }

    #[test]
    fn test_stop_signal_only_escalates() {
        let stop = StopSignal::new();
        assert_eq!(stop.current(), StopMode::Running);

        assert!(stop.request(StopMode::Graceful));
        // Second graceful-stop is a no-op
        assert!(!stop.request(StopMode::Graceful));
        assert!(stop.request(StopMode::Immediate));
        // Cannot de-escalate
        assert!(!stop.request(StopMode::Graceful));
        assert_eq!(stop.current(), StopMode::Immediate);
    }

    #[tokio::test]
    async fn test_stop_watcher_wakes_on_escalation() {
        let stop = StopSignal::new();
        let mut watcher = stop.watch();

        let waiter = tokio::spawn(async move { watcher.at_least(StopMode::Graceful).await });
        tokio::task::yield_now().await;
        stop.request(StopMode::Immediate);

        assert_eq!(waiter.await.unwrap(), StopMode::Immediate);
    }
}
