//! Process coordination - launching the managed application and talking to it.
//!
//! Replies and the exit notification arrive asynchronously as
//! `CoordinatorEvent`s on an mpsc channel; the orchestrator's event loop is
//! the only consumer.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use unattended_common::{Command, CommandReply, CommandRequest};

/// Something the managed process told us, or the fact that it went away
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Reply { command: Command, result: Value },
    Exception { command: Command, message: String },
    Exited,
}

impl From<CommandReply> for CoordinatorEvent {
    fn from(reply: CommandReply) -> Self {
        match reply.error {
            Some(message) => CoordinatorEvent::Exception {
                command: reply.command,
                message,
            },
            None => CoordinatorEvent::Reply {
                command: reply.command,
                result: reply.result.unwrap_or(Value::Null),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Managed application is not running")]
    NotRunning,

    #[error("Managed application is already running (pid {0:?})")]
    AlreadyRunning(Option<u32>),

    #[error("Failed to launch {path}: {source}")]
    Spawn { path: PathBuf, source: io::Error },

    #[error("Managed application has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Lifecycle and messaging for the managed application
#[async_trait]
pub trait ProcessCoordinator: Send + Sync {
    /// Start `application` with whitespace-separated `parameters`
    async fn launch(&self, application: &Path, parameters: &str) -> Result<()>;

    /// Ask the process to exit, killing it if it does not comply in time.
    /// Stopping a process that is not running is not an error.
    async fn stop(&self) -> Result<()>;

    async fn is_running(&self) -> bool;

    /// Fire-and-forget; any reply arrives later as a `CoordinatorEvent`
    async fn send(&self, command: Command) -> Result<()>;
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
    stopping: Arc<AtomicBool>,
}

/// Managed application as a child process speaking JSON lines on stdin/stdout
pub struct ChildProcess {
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    stop_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl ChildProcess {
    /// The receiver yields every event from every process this coordinator launches
    pub fn new(stop_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let coordinator = Self {
            events,
            stop_timeout,
            running: Mutex::new(None),
        };
        (coordinator, receiver)
    }
}

#[async_trait]
impl ProcessCoordinator for ChildProcess {
    async fn launch(&self, application: &Path, parameters: &str) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_mut() {
            if matches!(current.child.try_wait(), Ok(None)) {
                return Err(CoordinatorError::AlreadyRunning(current.child.id()).into());
            }
        }

        let mut command = ProcessCommand::new(application);
        command
            .args(parameters.split_whitespace())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = application.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| CoordinatorError::Spawn {
            path: application.to_path_buf(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(CoordinatorError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(CoordinatorError::MissingPipe("stdout"))?;

        let stopping = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_replies(stdout, self.events.clone(), stopping.clone()));

        info!(
            "Launched {} (pid {:?}) with parameters '{}'",
            application.display(),
            child.id(),
            parameters
        );

        *running = Some(Running {
            child,
            stdin,
            reader,
            stopping,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(mut process) = self.running.lock().await.take() else {
            debug!("Stop requested but nothing is running");
            return Ok(());
        };

        process.stopping.store(true, Ordering::SeqCst);
        let pid = process.child.id();

        if let Err(e) = write_command(&mut process.stdin, Command::Exit).await {
            debug!("Could not deliver exit command to pid {:?}: {}", pid, e);
        }

        match tokio::time::timeout(self.stop_timeout, process.child.wait()).await {
            Ok(Ok(status)) => info!("Managed application (pid {:?}) exited: {}", pid, status),
            Ok(Err(e)) => warn!("Failed waiting for pid {:?}: {}", pid, e),
            Err(_) => {
                warn!(
                    "Managed application (pid {:?}) ignored exit for {:?}, killing",
                    pid, self.stop_timeout
                );
                process.child.kill().await?;
            }
        }

        process.reader.abort();
        Ok(())
    }

    async fn is_running(&self) -> bool {
        let mut running = self.running.lock().await;
        match running.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        let mut running = self.running.lock().await;
        let process = running.as_mut().ok_or(CoordinatorError::NotRunning)?;
        write_command(&mut process.stdin, command).await?;
        debug!("Sent {} to managed application", command);
        Ok(())
    }
}

async fn write_command(stdin: &mut ChildStdin, command: Command) -> Result<(), CoordinatorError> {
    let mut line = CommandRequest::new(command).to_line()?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

async fn read_replies(
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    stopping: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match CommandReply::parse_line(&line) {
                    Ok(reply) => {
                        if events.send(reply.into()).is_err() {
                            return;
                        }
                    }
                    Err(_) => debug!("app: {}", line),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed reading from managed application: {}", e);
                break;
            }
        }
    }

    // A deliberate stop is not an exit the supervisor needs to react to
    if !stopping.load(Ordering::SeqCst) {
        let _ = events.send(CoordinatorEvent::Exited);
    }
}
