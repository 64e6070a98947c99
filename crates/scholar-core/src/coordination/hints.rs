//! Advisory ownership hints.
//!
//! Records which worker holds a user's kernel in a shared store. Hints are
//! informational only: lookups are logged and never redirect work, and store
//! failures never reach callers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::user::UserId;

/// How long an ownership hint lives without being refreshed (one hour).
pub const DEFAULT_HINT_TTL: Duration = Duration::from_secs(3600);

/// Minimal key-value store with expiring entries.
pub trait HintStore: Send + Sync {
    /// Check connectivity.
    fn ping(&self) -> Result<()>;

    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value that expires after `ttl`.
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Store key holding the owner hint for a user.
pub fn hint_key(user: &UserId) -> String {
    format!("kernel:user:{}", user)
}

/// Records which process owns each user's kernel.
///
/// Probed once at construction. If the store is unreachable then, hints are
/// disabled for the life of the process and every call is a no-op. Errors
/// from an enabled store are logged and swallowed.
#[derive(Clone)]
pub struct OwnershipHints {
    store: Option<Arc<dyn HintStore>>,
    worker_id: String,
    ttl: Duration,
}

impl OwnershipHints {
    /// Probe `store` and enable hints if it answers.
    pub fn connect(store: Arc<dyn HintStore>, worker_id: impl Into<String>, ttl: Duration) -> Self {
        let worker_id = worker_id.into();
        let store = match store.ping() {
            Ok(()) => {
                tracing::info!("Coordination store connected (worker {})", worker_id);
                Some(store)
            }
            Err(e) => {
                tracing::warn!(
                    "Coordination store unavailable, running without ownership hints: {}",
                    e
                );
                None
            }
        };
        Self {
            store,
            worker_id,
            ttl,
        }
    }

    /// Hints that never touch a store.
    pub fn disabled(worker_id: impl Into<String>) -> Self {
        Self {
            store: None,
            worker_id: worker_id.into(),
            ttl: DEFAULT_HINT_TTL,
        }
    }

    /// Whether a store is in use.
    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    /// Identity written as the hint value.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Last recorded owner of `user`'s kernel, if any.
    pub fn lookup(&self, user: &UserId) -> Option<String> {
        let store = self.store.as_ref()?;
        match store.get(&hint_key(user)) {
            Ok(owner) => owner,
            Err(e) => {
                tracing::debug!("Hint lookup for user {} failed: {}", user, e);
                None
            }
        }
    }

    /// Record (or refresh) this process as the owner of `user`'s kernel.
    pub fn record(&self, user: &UserId) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.set_with_ttl(&hint_key(user), &self.worker_id, self.ttl) {
            tracing::debug!("Failed to record hint for user {}: {}", user, e);
        }
    }

    /// Remove the hint for `user`.
    pub fn forget(&self, user: &UserId) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.delete(&hint_key(user)) {
            tracing::debug!("Failed to remove hint for user {}: {}", user, e);
        }
    }
}

impl fmt::Debug for OwnershipHints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnershipHints")
            .field("available", &self.is_available())
            .field("worker_id", &self.worker_id)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryHintStore;

    #[test]
    fn test_key_format() {
        assert_eq!(hint_key(&UserId::from(42)), "kernel:user:42");
    }

    #[test]
    fn test_record_lookup_forget() {
        let store = MemoryHintStore::new();
        let hints = OwnershipHints::connect(Arc::new(store.clone()), "1234", DEFAULT_HINT_TTL);
        assert!(hints.is_available());

        let user = UserId::from(7);
        assert_eq!(hints.lookup(&user), None);
        hints.record(&user);
        assert_eq!(hints.lookup(&user).as_deref(), Some("1234"));
        assert_eq!(store.value("kernel:user:7").as_deref(), Some("1234"));

        hints.forget(&user);
        assert_eq!(hints.lookup(&user), None);
    }

    #[test]
    fn test_hints_expire() {
        let store = MemoryHintStore::new();
        let hints = OwnershipHints::connect(Arc::new(store), "w", Duration::from_millis(30));
        let user = UserId::from(1);
        hints.record(&user);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(hints.lookup(&user), None);
    }

    #[test]
    fn test_unreachable_at_startup_disables_permanently() {
        let store = MemoryHintStore::new();
        store.set_unreachable(true);
        let hints = OwnershipHints::connect(Arc::new(store.clone()), "w", DEFAULT_HINT_TTL);
        assert!(!hints.is_available());

        // Recovery later does not re-enable hints.
        store.set_unreachable(false);
        let calls = store.calls();
        hints.record(&UserId::from(1));
        assert_eq!(hints.lookup(&UserId::from(1)), None);
        assert_eq!(store.calls(), calls);
    }

    #[test]
    fn test_runtime_failures_are_swallowed() {
        let store = MemoryHintStore::new();
        let hints = OwnershipHints::connect(Arc::new(store.clone()), "w", DEFAULT_HINT_TTL);
        store.set_unreachable(true);
        let user = UserId::from(3);
        hints.record(&user);
        hints.forget(&user);
        assert_eq!(hints.lookup(&user), None);
    }
}
