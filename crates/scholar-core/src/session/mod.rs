//! Per-process session management.

mod registry;

pub use registry::{RegistryStats, SessionRegistry};
