//! Advisory cross-process coordination.
//!
//! Each process records "user X's kernel lives in process P" in a shared
//! key-value store with a TTL. The records are hints only: nothing here ever
//! decides where a kernel runs, and every operation degrades to a no-op when
//! the store is unreachable.

mod hints;
mod redis_store;

pub use hints::{DEFAULT_HINT_TTL, HintStore, OwnershipHints, hint_key};
pub use redis_store::{DEFAULT_REDIS_TIMEOUT, RedisHintStore};
