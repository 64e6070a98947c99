//! Core of the Scholar code execution service.
//!
//! This crate provides:
//! - Stateful per-user kernels wrapping an external engine process
//! - A per-process session registry mapping users to kernels
//! - Best-effort cross-process ownership hints backed by Redis

pub mod coordination;
pub mod error;
pub mod kernel;
pub mod session;
pub mod user;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use coordination::{HintStore, OwnershipHints, RedisHintStore};
pub use error::{Error, Result};
pub use kernel::{
    CellOutput, ExecutionResult, Kernel, KernelCommand, KernelConfig, KernelLauncher, KernelState,
    ProcessLauncher,
};
pub use session::{RegistryStats, SessionRegistry};
pub use user::UserId;
