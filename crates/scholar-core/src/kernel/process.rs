//! Kernel engines running as child processes.
//!
//! Provides `ProcessChannel` for spawning and talking to an engine process
//! over stdin/stdout, and `ProcessLauncher` for starting fresh ones.

use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{Error, Result};

use super::channel::{KernelChannel, KernelLauncher};
use super::protocol::{KernelMessage, KernelRequest, read_message, write_message};

/// Python driver executed by the default engine.
pub const DRIVER_SOURCE: &str = include_str!("driver.py");

/// How long a kernel gets to exit after a shutdown request before it is killed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Program and arguments used to start a kernel engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCommand {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Extra environment variables for the engine.
    pub env: Vec<(String, String)>,
}

impl KernelCommand {
    /// Arbitrary engine command speaking the kernel protocol on stdin/stdout.
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    /// Python engine running the bundled driver.
    pub fn python(interpreter: impl Into<PathBuf>) -> Self {
        let mut command = Self::new(interpreter, ["-u", "-c", DRIVER_SOURCE]);
        command
            .env
            .push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
        command
    }

    /// Python engine using the first interpreter found.
    ///
    /// Looks for the interpreter in the following order:
    /// 1. `SCHOLAR_PYTHON` environment variable
    /// 2. `python3` on the system PATH
    /// 3. `python` on the system PATH
    pub fn detect_python() -> Result<Self> {
        find_python().map(Self::python)
    }

    /// Human-readable program name for logs.
    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

fn find_python() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SCHOLAR_PYTHON") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        if let Ok(resolved) = which::which(&path) {
            return Ok(resolved);
        }
        tracing::warn!("SCHOLAR_PYTHON={} not found, falling back to PATH", path.display());
    }

    for candidate in ["python3", "python"] {
        if let Ok(path) = which::which(candidate) {
            return Ok(path);
        }
    }

    Err(Error::EngineStartup(
        "Could not find a Python interpreter. Set SCHOLAR_PYTHON or ensure python3 is in PATH."
            .to_string(),
    ))
}

/// Starts kernel engines as child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: KernelCommand,
    shutdown_grace: Duration,
}

impl ProcessLauncher {
    /// Create a launcher for the given engine command.
    pub fn new(command: KernelCommand) -> Self {
        Self {
            command,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Set how long engines get to exit cleanly on shutdown.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// The engine command.
    pub fn command(&self) -> &KernelCommand {
        &self.command
    }
}

impl KernelLauncher for ProcessLauncher {
    fn launch(&self) -> Result<Box<dyn KernelChannel>> {
        let channel = ProcessChannel::spawn(&self.command, self.shutdown_grace)?;
        Ok(Box::new(channel))
    }
}

/// Channel to a kernel engine child process.
///
/// A reader thread drains the engine's stdout into a queue so that receives
/// can be bounded with a timeout.
pub struct ProcessChannel {
    /// The child process.
    child: Child,
    /// Buffered stdin writer.
    stdin: BufWriter<ChildStdin>,
    /// Messages parsed by the reader thread.
    messages: Receiver<Result<KernelMessage>>,
    /// Grace period between the shutdown request and the kill.
    shutdown_grace: Duration,
    /// Whether the engine has been shut down.
    killed: bool,
}

impl ProcessChannel {
    /// Spawn an engine process.
    ///
    /// On unix the engine leads its own process group so teardown also
    /// reaches processes started by user code.
    pub fn spawn(command: &KernelCommand, shutdown_grace: Duration) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::EngineStartup(format!(
                "Failed to spawn kernel process '{}': {}",
                command.display_name(),
                e
            ))
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::EngineStartup(
                "Failed to capture kernel stdio".to_string(),
            ));
        };

        let (tx, rx) = mpsc::channel();
        let pid = child.id();
        let spawned = thread::Builder::new()
            .name(format!("kernel-reader-{}", pid))
            .spawn(move || pump_messages(BufReader::new(stdout), tx));
        if let Err(e) = spawned {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::EngineStartup(format!(
                "Failed to start kernel reader thread: {}",
                e
            )));
        }

        tracing::debug!("Spawned kernel process {} ({})", pid, command.display_name());

        Ok(Self {
            child,
            stdin: BufWriter::new(stdin),
            messages: rx,
            shutdown_grace,
            killed: false,
        })
    }

    fn exit_description(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => format!("kernel process exited with {}", status),
            _ => "kernel output stream closed".to_string(),
        }
    }

    fn kill_process_group(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: plain signal delivery; a stale group id yields ESRCH.
            unsafe {
                libc::killpg(self.child.id() as libc::pid_t, libc::SIGKILL);
            }
        }

        if let Err(e) = self.child.kill() {
            tracing::debug!("Kernel {} kill returned: {}", self.child.id(), e);
        }
    }
}

/// Forward parsed messages until the engine's stdout closes.
fn pump_messages(mut reader: BufReader<ChildStdout>, tx: Sender<Result<KernelMessage>>) {
    loop {
        match read_message(&mut reader) {
            Ok(Some(message)) => {
                if tx.send(Ok(message)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(Error::Protocol(e)) => {
                tracing::debug!("Skipping malformed kernel output: {}", e);
            }
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

impl KernelChannel for ProcessChannel {
    fn send(&mut self, request: &KernelRequest) -> Result<()> {
        if self.killed {
            return Err(Error::Channel("Kernel has been shut down".to_string()));
        }
        write_message(&mut self.stdin, request)
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<KernelMessage>> {
        if self.killed {
            return Err(Error::Channel("Kernel has been shut down".to_string()));
        }
        match self.messages.recv_timeout(timeout) {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Channel(self.exit_description())),
        }
    }

    fn is_alive(&mut self) -> bool {
        if self.killed {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;

        // Ask politely first so the driver can flush and exit.
        let _ = write_message(
            &mut self.stdin,
            &KernelRequest::ShutdownRequest {
                msg_id: Uuid::new_v4().to_string(),
            },
        );

        let deadline = Instant::now() + self.shutdown_grace;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(_) => break,
            }
        }

        // Always sweep the group: user code may have left children behind.
        self.kill_process_group();

        self.child
            .wait()
            .map(|_| ())
            .map_err(|e| Error::Channel(format!("Failed to reap kernel process: {}", e)))
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        // Ensure the engine is killed when the channel is dropped
        let _ = self.shutdown();
    }
}
