//! Execution kernels.
//!
//! A kernel is a long-lived engine process holding one user's interpreter
//! state. This module contains:
//! - `protocol`: newline-delimited JSON messages exchanged with the engine
//! - `channel`: the transport and launcher seams
//! - `process`: engines running as child processes
//! - `engine`: the synchronous `Kernel` wrapper
//! - `output`: client-facing result shapes

mod channel;
mod engine;
mod output;
mod process;
mod protocol;

pub use channel::{KernelChannel, KernelLauncher};
pub use engine::{Kernel, KernelConfig, KernelState};
pub use output::{CellOutput, ExecutionResult, MimeBundle};
pub use process::{DEFAULT_SHUTDOWN_GRACE, DRIVER_SOURCE, KernelCommand, ProcessChannel, ProcessLauncher};
pub use protocol::{KernelEvent, KernelMessage, KernelRequest, read_message, write_message};
