//! Mapping from user to kernel within one process.
//!
//! The map lock is held only to look up, insert or remove entries. Starting,
//! executing and tearing down kernels always happens outside it, under the
//! kernel's own lock, so a slow cell for one user never blocks lookups for
//! another.

use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::coordination::OwnershipHints;
use crate::error::Result;
use crate::kernel::{ExecutionResult, Kernel, KernelConfig, KernelLauncher};
use crate::user::UserId;

/// Point-in-time view of a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Identifier of the owning process.
    pub process_id: String,
    /// Number of live sessions.
    pub session_count: usize,
    /// Users with a session, sorted.
    pub user_ids: Vec<UserId>,
}

/// Owns every kernel in this process, one per user.
pub struct SessionRegistry {
    launcher: Arc<dyn KernelLauncher>,
    config: KernelConfig,
    hints: OwnershipHints,
    kernels: Mutex<FxHashMap<UserId, Arc<Kernel>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(launcher: Arc<dyn KernelLauncher>, config: KernelConfig, hints: OwnershipHints) -> Self {
        Self {
            launcher,
            config,
            hints,
            kernels: Mutex::new(FxHashMap::default()),
        }
    }

    /// This process's identifier, as written to ownership hints.
    pub fn worker_id(&self) -> &str {
        self.hints.worker_id()
    }

    /// The ownership hints in use.
    pub fn hints(&self) -> &OwnershipHints {
        &self.hints
    }

    fn lock_map(&self) -> MutexGuard<'_, FxHashMap<UserId, Arc<Kernel>>> {
        self.kernels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the entry for `user`, inserting an unstarted kernel if absent.
    ///
    /// The boolean is true when this call inserted the entry.
    fn entry(&self, user: &UserId) -> (Arc<Kernel>, bool) {
        let mut kernels = self.lock_map();
        if let Some(kernel) = kernels.get(user) {
            return (kernel.clone(), false);
        }
        let kernel = Arc::new(Kernel::new(self.launcher.clone(), self.config.clone()));
        kernels.insert(user.clone(), kernel.clone());
        (kernel, true)
    }

    fn announce_creation(&self, user: &UserId) {
        match self.hints.lookup(user) {
            Some(owner) if owner == self.worker_id() => {
                tracing::info!("Worker {}: recreating kernel for user {}", self.worker_id(), user);
            }
            Some(owner) => {
                tracing::info!(
                    "Worker {}: creating kernel for user {} (hint points at worker {})",
                    self.worker_id(),
                    user,
                    owner
                );
            }
            None => {
                tracing::info!("Worker {}: creating first kernel for user {}", self.worker_id(), user);
            }
        }
    }

    /// Get the user's kernel, creating and starting it if needed.
    ///
    /// Concurrent calls for the same new user construct exactly one kernel
    /// and all receive it. A kernel whose start fails stays registered and
    /// is started again by the next call.
    pub fn get_or_create(&self, user: &UserId) -> Result<Arc<Kernel>> {
        let (kernel, created) = self.entry(user);
        if created {
            self.announce_creation(user);
        }
        let before = kernel.generation();
        kernel.ensure_started()?;
        if kernel.generation() != before {
            self.hints.record(user);
        }
        Ok(kernel)
    }

    /// Run code in the user's kernel.
    pub fn execute(&self, user: &UserId, code: &str) -> ExecutionResult {
        match self.get_or_create(user) {
            Ok(kernel) => kernel.execute(code),
            Err(e) => {
                tracing::error!("Kernel unavailable for user {}: {}", user, e);
                ExecutionResult::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Restart the user's kernel, creating one if there is none.
    pub fn restart(&self, user: &UserId) -> Result<()> {
        let (kernel, created) = self.entry(user);
        if created {
            self.announce_creation(user);
            kernel.ensure_started()?;
        } else {
            kernel.restart()?;
        }
        self.hints.record(user);
        Ok(())
    }

    /// Remove and tear down the user's kernel.
    ///
    /// Returns whether a kernel existed. The hint is removed either way.
    pub fn cleanup(&self, user: &UserId) -> bool {
        let removed = self.lock_map().remove(user);
        let existed = removed.is_some();
        if let Some(kernel) = removed {
            tracing::info!("Worker {}: cleaning up kernel for user {}", self.worker_id(), user);
            kernel.shutdown();
        }
        self.hints.forget(user);
        existed
    }

    /// Snapshot of the registry.
    pub fn stats(&self) -> RegistryStats {
        let kernels = self.lock_map();
        let mut user_ids: Vec<UserId> = kernels.keys().cloned().collect();
        user_ids.sort();
        RegistryStats {
            process_id: self.worker_id().to_string(),
            session_count: kernels.len(),
            user_ids,
        }
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.lock_map().len()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.lock_map().is_empty()
    }

    /// Tear down every kernel. Hints are left to expire.
    pub fn shutdown_all(&self) {
        let drained: Vec<(UserId, Arc<Kernel>)> = self.lock_map().drain().collect();
        if !drained.is_empty() {
            tracing::info!("Shutting down {} kernel(s)", drained.len());
        }
        for (_, kernel) in drained {
            kernel.shutdown();
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::DEFAULT_HINT_TTL;
    use crate::testing::{MemoryHintStore, ScriptedLauncher};
    use std::thread;
    use std::time::{Duration, Instant};

    fn config() -> KernelConfig {
        KernelConfig {
            startup_timeout: Duration::from_millis(500),
            execution_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn registry(launcher: &ScriptedLauncher) -> SessionRegistry {
        SessionRegistry::new(
            Arc::new(launcher.clone()),
            config(),
            OwnershipHints::disabled("worker-1"),
        )
    }

    #[test]
    fn test_concurrent_get_or_create_builds_one_kernel() {
        let launcher = ScriptedLauncher::new().with_startup_delay(Duration::from_millis(50));
        let registry = Arc::new(registry(&launcher));
        let user = UserId::from(1);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let user = user.clone();
                thread::spawn(move || registry.get_or_create(&user).unwrap())
            })
            .collect();
        let kernels: Vec<Arc<Kernel>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(launcher.launch_count(), 1);
        assert!(kernels.iter().all(|k| Arc::ptr_eq(k, &kernels[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_different_users_execute_in_parallel() {
        let launcher = ScriptedLauncher::new();
        let registry = Arc::new(registry(&launcher));
        registry.get_or_create(&UserId::from(1)).unwrap();
        registry.get_or_create(&UserId::from(2)).unwrap();

        let start = Instant::now();
        let handles: Vec<_> = [1, 2]
            .into_iter()
            .map(|id| {
                let registry = registry.clone();
                thread::spawn(move || registry.execute(&UserId::from(id), "sleep(300)"))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_success());
        }
        assert!(start.elapsed() < Duration::from_millis(550), "took {:?}", start.elapsed());
    }

    #[test]
    fn test_slow_user_does_not_block_lookups() {
        let launcher = ScriptedLauncher::new();
        let registry = Arc::new(registry(&launcher));
        let slow = UserId::from(1);
        registry.get_or_create(&slow).unwrap();

        let busy = {
            let registry = registry.clone();
            thread::spawn(move || registry.execute(&slow, "sleep(400)"))
        };
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        let stats = registry.stats();
        assert_eq!(stats.session_count, 1);
        assert!(registry.execute(&UserId::from(2), "print(1)").is_success());
        assert!(start.elapsed() < Duration::from_millis(300));
        assert!(busy.join().unwrap().is_success());
    }

    #[test]
    fn test_restart_then_state_is_fresh() {
        let launcher = ScriptedLauncher::new();
        let registry = registry(&launcher);
        let user = UserId::from(5);
        registry.execute(&user, "y = 9");

        registry.restart(&user).unwrap();
        assert!(registry.execute(&user, "print(y)").outputs()[0].is_error());
        assert!(registry.execute(&user, "x = 1").is_success());
        assert_eq!(registry.execute(&user, "print(x)").stdout_text(), "1\n");
    }

    #[test]
    fn test_restart_unknown_user_creates_kernel() {
        let launcher = ScriptedLauncher::new();
        let registry = registry(&launcher);
        registry.restart(&UserId::from(3)).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(launcher.launch_count(), 1);
    }

    #[test]
    fn test_cleanup_tears_down_and_next_call_builds_new_kernel() {
        let launcher = ScriptedLauncher::new();
        let registry = registry(&launcher);
        let user = UserId::from(1);
        let first = registry.get_or_create(&user).unwrap();

        assert!(registry.cleanup(&user));
        assert_eq!(first.state(), crate::kernel::KernelState::Dead);
        assert!(!registry.cleanup(&user));

        let second = registry.get_or_create(&user).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(launcher.launch_count(), 2);
    }

    #[test]
    fn test_stats_snapshot() {
        let launcher = ScriptedLauncher::new();
        let registry = registry(&launcher);
        registry.get_or_create(&UserId::from("bob")).unwrap();
        registry.get_or_create(&UserId::from("alice")).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.process_id, "worker-1");
        assert_eq!(stats.session_count, 2);
        assert_eq!(stats.user_ids, vec![UserId::from("alice"), UserId::from("bob")]);

        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["user_ids"], serde_json::json!(["alice", "bob"]));
    }

    #[test]
    fn test_startup_failure_surfaces_and_recovers() {
        let launcher = ScriptedLauncher::new().failing_launches(1);
        let registry = registry(&launcher);
        let user = UserId::from(1);

        let result = registry.execute(&user, "print(1)");
        assert!(!result.is_success());
        assert!(registry.execute(&user, "print(1)").is_success());
    }

    #[test]
    fn test_hints_recorded_and_forgotten() {
        let store = MemoryHintStore::new();
        let launcher = ScriptedLauncher::new();
        let hints = OwnershipHints::connect(Arc::new(store.clone()), "4242", DEFAULT_HINT_TTL);
        let registry = SessionRegistry::new(Arc::new(launcher), config(), hints);
        let user = UserId::from(9);

        registry.get_or_create(&user).unwrap();
        assert_eq!(store.value("kernel:user:9").as_deref(), Some("4242"));

        registry.cleanup(&user);
        assert_eq!(store.value("kernel:user:9"), None);
    }

    #[test]
    fn test_foreign_hint_does_not_redirect() {
        let store = MemoryHintStore::new();
        store.insert("kernel:user:9", "other-worker");
        let hints = OwnershipHints::connect(Arc::new(store.clone()), "4242", DEFAULT_HINT_TTL);
        let registry = SessionRegistry::new(Arc::new(ScriptedLauncher::new()), config(), hints);

        assert!(registry.execute(&UserId::from(9), "print(1)").is_success());
        assert_eq!(store.value("kernel:user:9").as_deref(), Some("4242"));
    }

    #[test]
    fn test_unreachable_store_behaves_like_no_store() {
        let store = MemoryHintStore::new();
        store.set_unreachable(true);
        let hints = OwnershipHints::connect(Arc::new(store), "w", DEFAULT_HINT_TTL);
        let registry = SessionRegistry::new(Arc::new(ScriptedLauncher::new()), config(), hints);
        let user = UserId::from(1);

        assert!(registry.execute(&user, "x = 2").is_success());
        registry.restart(&user).unwrap();
        assert!(registry.cleanup(&user));
        assert_eq!(registry.stats().session_count, 0);
    }

    #[test]
    fn test_shutdown_all_empties_registry() {
        let launcher = ScriptedLauncher::new();
        let registry = registry(&launcher);
        let k = registry.get_or_create(&UserId::from(1)).unwrap();
        registry.get_or_create(&UserId::from(2)).unwrap();
        registry.shutdown_all();
        assert!(registry.is_empty());
        assert_eq!(k.state(), crate::kernel::KernelState::Dead);
    }
}
