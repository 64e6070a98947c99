//! Stateful execution kernel owned by one user.
//!
//! A `Kernel` wraps one engine process and turns its asynchronous,
//! multi-message protocol into a synchronous `execute` call. All operations
//! that touch the engine go through a single per-kernel mutex, so requests
//! for the same user run one after another while different users' kernels
//! never contend.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::channel::{KernelChannel, KernelLauncher};
use super::output::{CellOutput, ExecutionResult};
use super::protocol::KernelRequest;

/// Timeouts governing a kernel's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Bound on waiting for the engine to answer the readiness probe.
    pub startup_timeout: Duration,
    /// Bound on collecting the output of one submission.
    pub execution_timeout: Duration,
    /// Longest single blocking receive inside the collection loops.
    pub poll_interval: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Lifecycle state of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    /// Engine launched, readiness not yet confirmed.
    Starting,
    /// Idle and able to accept a submission.
    Ready,
    /// A submission is in flight.
    Executing,
    /// No usable engine; the next `execute` restarts it.
    Dead,
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Engine handle guarded by the kernel's execution lock.
struct Engine {
    channel: Option<Box<dyn KernelChannel>>,
    /// Number of engines this kernel has started.
    generation: u64,
}

/// A persistent, stateful code execution session.
pub struct Kernel {
    /// Unique identity of this kernel instance.
    id: Uuid,
    launcher: Arc<dyn KernelLauncher>,
    config: KernelConfig,
    /// Execution lock. Held for the whole of start/execute/restart/shutdown.
    engine: Mutex<Engine>,
    /// Observable state, readable without waiting on the execution lock.
    state: Mutex<KernelState>,
}

impl Kernel {
    /// Create a kernel without starting its engine.
    pub fn new(launcher: Arc<dyn KernelLauncher>, config: KernelConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            launcher,
            config,
            engine: Mutex::new(Engine {
                channel: None,
                generation: 0,
            }),
            state: Mutex::new(KernelState::Dead),
        }
    }

    /// Create and start a kernel.
    pub fn spawn(launcher: Arc<dyn KernelLauncher>, config: KernelConfig) -> Result<Self> {
        let kernel = Self::new(launcher, config);
        kernel.start()?;
        Ok(kernel)
    }

    /// Unique identity of this kernel instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> KernelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of engines started so far (restarts included).
    pub fn generation(&self) -> u64 {
        self.lock_engine().generation
    }

    /// OS process id of the current engine, if running.
    pub fn pid(&self) -> Option<u32> {
        self.lock_engine().channel.as_ref().and_then(|c| c.pid())
    }

    /// The kernel's timeouts.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn set_state(&self, state: KernelState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn lock_engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launch a fresh engine and wait until it reports readiness.
    ///
    /// Any engine already running is torn down first. On failure the
    /// kernel is left `Dead` and `start` may simply be called again.
    pub fn start(&self) -> Result<()> {
        let mut engine = self.lock_engine();
        self.start_locked(&mut engine)
    }

    /// Start the engine unless one is already running.
    pub fn ensure_started(&self) -> Result<()> {
        let mut engine = self.lock_engine();
        if self.engine_usable(&mut engine) {
            return Ok(());
        }
        self.start_locked(&mut engine)
    }

    fn engine_usable(&self, engine: &mut Engine) -> bool {
        if self.state() == KernelState::Dead {
            return false;
        }
        engine.channel.as_mut().is_some_and(|c| c.is_alive())
    }

    fn start_locked(&self, engine: &mut Engine) -> Result<()> {
        self.teardown_locked(engine);
        self.set_state(KernelState::Starting);

        let mut channel = match self.launcher.launch() {
            Ok(channel) => channel,
            Err(e) => {
                self.set_state(KernelState::Dead);
                return Err(match e {
                    Error::EngineStartup(_) => e,
                    other => Error::EngineStartup(other.to_string()),
                });
            }
        };

        if let Err(e) = self.await_ready(channel.as_mut()) {
            if let Err(teardown) = channel.shutdown() {
                tracing::warn!("Kernel {}: teardown after failed start: {}", self.id, teardown);
            }
            self.set_state(KernelState::Dead);
            return Err(e);
        }

        engine.generation += 1;
        tracing::debug!(
            "Kernel {} ready (generation {}, pid {:?})",
            self.id,
            engine.generation,
            channel.pid()
        );
        engine.channel = Some(channel);
        self.set_state(KernelState::Ready);
        Ok(())
    }

    /// Readiness handshake: probe and wait for the matching reply.
    fn await_ready(&self, channel: &mut dyn KernelChannel) -> Result<()> {
        let msg_id = Uuid::new_v4().to_string();
        channel
            .send(&KernelRequest::KernelInfoRequest {
                msg_id: msg_id.clone(),
            })
            .map_err(|e| Error::EngineStartup(format!("readiness probe failed: {}", e)))?;

        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::EngineStartup(format!(
                    "kernel did not become ready within {:?}",
                    self.config.startup_timeout
                )));
            }
            let slice = deadline.saturating_duration_since(now).min(self.config.poll_interval);
            match channel.recv_timeout(slice) {
                Ok(Some(msg)) if msg.msg_type == "kernel_info_reply" && msg.is_reply_to(&msg_id) => {
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) => {
                    return Err(Error::EngineStartup(format!(
                        "kernel exited during startup: {}",
                        e
                    )));
                }
            }
        }
    }

    /// Run code and collect its outputs.
    ///
    /// Never fails: a dead or missing engine is restarted first, channel
    /// failures become `Failed`, and hitting the execution timeout yields
    /// `TimedOut` with whatever output already arrived.
    pub fn execute(&self, code: &str) -> ExecutionResult {
        let mut engine = self.lock_engine();

        if !self.engine_usable(&mut engine) {
            tracing::info!("Kernel {} is not running, starting a new engine", self.id);
            if let Err(e) = self.start_locked(&mut engine) {
                return ExecutionResult::Failed {
                    error: e.to_string(),
                };
            }
        }

        self.set_state(KernelState::Executing);
        let result = self.run_submission(&mut engine, code);
        match &result {
            ExecutionResult::Failed { error } => {
                tracing::warn!("Kernel {} lost its engine: {}", self.id, error);
                self.teardown_locked(&mut engine);
                self.set_state(KernelState::Dead);
            }
            ExecutionResult::TimedOut { outputs } => {
                tracing::warn!(
                    "Kernel {}: no idle signal within {:?}, returning {} partial outputs",
                    self.id,
                    self.config.execution_timeout,
                    outputs.len()
                );
                self.set_state(KernelState::Ready);
            }
            ExecutionResult::Completed { .. } => self.set_state(KernelState::Ready),
        }
        result
    }

    fn run_submission(&self, engine: &mut Engine, code: &str) -> ExecutionResult {
        let Some(channel) = engine.channel.as_mut() else {
            return ExecutionResult::Failed {
                error: Error::Channel("kernel has no engine".to_string()).to_string(),
            };
        };

        let msg_id = Uuid::new_v4().to_string();
        let request = KernelRequest::ExecuteRequest {
            msg_id: msg_id.clone(),
            code: code.to_string(),
        };
        if let Err(e) = channel.send(&request) {
            return ExecutionResult::Failed {
                error: e.to_string(),
            };
        }

        let mut outputs: Vec<CellOutput> = Vec::new();
        let deadline = Instant::now() + self.config.execution_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return ExecutionResult::TimedOut { outputs };
            }
            let slice = deadline.saturating_duration_since(now).min(self.config.poll_interval);
            let msg = match channel.recv_timeout(slice) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(e) if e.is_fatal_to_kernel() => {
                    return ExecutionResult::Failed {
                        error: e.to_string(),
                    };
                }
                Err(e) => {
                    tracing::debug!("Kernel {}: skipping message: {}", self.id, e);
                    continue;
                }
            };

            // Leftovers from an earlier, timed-out submission.
            if !msg.is_reply_to(&msg_id) {
                tracing::trace!(
                    "Kernel {}: discarding {} for {:?}",
                    self.id,
                    msg.msg_type,
                    msg.parent_id
                );
                continue;
            }

            match msg.event() {
                Ok(event) if event.is_idle() => return ExecutionResult::Completed { outputs },
                Ok(event) => outputs.extend(event.into_output()),
                Err(e) => {
                    tracing::debug!("Kernel {}: undecodable {}: {}", self.id, msg.msg_type, e);
                }
            }
        }
    }

    /// Tear down the engine and start a fresh one.
    ///
    /// Nothing from the previous engine survives: bindings, imports and
    /// side effects are gone. Teardown errors are logged and ignored.
    pub fn restart(&self) -> Result<()> {
        let mut engine = self.lock_engine();
        tracing::info!("Restarting kernel {}", self.id);
        self.start_locked(&mut engine)
    }

    /// Stop the engine without starting another.
    pub fn shutdown(&self) {
        let mut engine = self.lock_engine();
        self.teardown_locked(&mut engine);
        self.set_state(KernelState::Dead);
    }

    fn teardown_locked(&self, engine: &mut Engine) {
        if let Some(mut channel) = engine.channel.take() {
            if let Err(e) = channel.shutdown() {
                tracing::warn!("Kernel {}: engine teardown failed: {}", self.id, e);
            }
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        let engine = self.engine.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(mut channel) = engine.channel.take() {
            if let Err(e) = channel.shutdown() {
                tracing::warn!("Kernel {}: engine teardown on drop failed: {}", self.id, e);
            }
        }
    }
}
