//! Transport seam between a [`Kernel`](super::Kernel) and its engine.

use std::time::Duration;

use crate::error::Result;

use super::protocol::{KernelMessage, KernelRequest};

/// Bidirectional connection to one running kernel engine.
pub trait KernelChannel: Send {
    /// Send a request to the kernel.
    fn send(&mut self, request: &KernelRequest) -> Result<()>;

    /// Wait at most `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. An error means the
    /// channel is unusable (engine exited, pipe closed).
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<KernelMessage>>;

    /// Check if the engine is still running.
    fn is_alive(&mut self) -> bool;

    /// Stop the engine and release its resources. Idempotent.
    fn shutdown(&mut self) -> Result<()>;

    /// OS process id of the engine, when there is one.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Factory for fresh kernel engines.
pub trait KernelLauncher: Send + Sync {
    /// Start a new engine and return its channel.
    ///
    /// The returned channel is connected but not yet known to be ready;
    /// the readiness handshake is the kernel's job.
    fn launch(&self) -> Result<Box<dyn KernelChannel>>;
}
