//! In-memory kernels and hint stores for tests.
//!
//! `ScriptedLauncher` produces kernels that understand a tiny line-based
//! language instead of Python:
//!
//! | Line              | Effect                                              |
//! |-------------------|-----------------------------------------------------|
//! | `name = value`    | bind `name`                                         |
//! | `print(arg)`      | stdout stream; `arg` is a literal or a bound name   |
//! | `name`            | `execute_result` with the bound value               |
//! | `raise Kind(msg)` | in-band error, remaining lines skipped              |
//! | `sleep(ms)`       | delay everything emitted afterwards                 |
//! | `stale`           | emit output tagged with someone else's request id   |
//! | `hang`            | never report idle                                   |
//! | `crash`           | the engine dies                                     |
//!
//! Unbound names raise `NameError`, so restarts are observable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::coordination::HintStore;
use crate::error::{Error, Result};
use crate::kernel::{KernelChannel, KernelLauncher, KernelMessage, KernelRequest};

/// Launcher for scripted in-memory kernels.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLauncher {
    launches: Arc<AtomicUsize>,
    failures_remaining: Arc<AtomicUsize>,
    startup_delay: Duration,
    unresponsive: bool,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay the readiness reply of every launched kernel.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Make the next `count` launches fail outright.
    pub fn failing_launches(self, count: usize) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Launched kernels never answer the readiness probe.
    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    /// Number of launch attempts so far, failed ones included.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl KernelLauncher for ScriptedLauncher {
    fn launch(&self) -> Result<Box<dyn KernelChannel>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::EngineStartup("scripted launch failure".to_string()));
        }
        Ok(Box::new(ScriptedChannel {
            startup_delay: self.startup_delay,
            unresponsive: self.unresponsive,
            ..ScriptedChannel::default()
        }))
    }
}

/// Value bound in a scripted kernel's namespace.
type Namespace = HashMap<String, String>;

#[derive(Default)]
struct ScriptedChannel {
    queue: VecDeque<(Instant, KernelMessage)>,
    namespace: Namespace,
    execution_count: i64,
    startup_delay: Duration,
    unresponsive: bool,
    crashed: bool,
    closed: bool,
}

impl ScriptedChannel {
    fn push(&mut self, at: Instant, msg_type: &str, parent: &str, content: serde_json::Value) {
        self.queue
            .push_back((at, KernelMessage::new(msg_type, Some(parent), content)));
    }

    fn push_error(&mut self, at: Instant, parent: &str, ename: &str, evalue: &str) {
        self.push(
            at,
            "error",
            parent,
            json!({
                "ename": ename,
                "evalue": evalue,
                "traceback": ["Traceback (most recent call last):", format!("{}: {}", ename, evalue)],
            }),
        );
    }

    /// Resolve a `print` argument or bare expression.
    fn resolve(&self, expr: &str) -> std::result::Result<String, String> {
        if let Some(text) = expr
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
        {
            return Ok(text.to_string());
        }
        if expr.parse::<f64>().is_ok() {
            return Ok(expr.to_string());
        }
        self.namespace
            .get(expr)
            .cloned()
            .ok_or_else(|| format!("name '{}' is not defined", expr))
    }

    fn run(&mut self, msg_id: &str, code: &str) {
        let mut at = Instant::now();
        self.execution_count += 1;
        self.push(at, "status", msg_id, json!({"execution_state": "busy"}));

        for line in code.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line == "hang" {
                return;
            }
            if line == "crash" {
                self.crashed = true;
                return;
            }
            if line == "stale" {
                self.push(at, "stream", "previous-request", json!({"name": "stdout", "text": "stale\n"}));
                continue;
            }
            if let Some(ms) = call_arg(line, "sleep").and_then(|a| a.parse::<u64>().ok()) {
                at += Duration::from_millis(ms);
                continue;
            }
            if let Some(arg) = call_arg(line, "print") {
                match self.resolve(arg) {
                    Ok(value) => self.push(
                        at,
                        "stream",
                        msg_id,
                        json!({"name": "stdout", "text": format!("{}\n", value)}),
                    ),
                    Err(evalue) => {
                        self.push_error(at, msg_id, "NameError", &evalue);
                        break;
                    }
                }
                continue;
            }
            if let Some(raised) = line.strip_prefix("raise ") {
                let (ename, evalue) = match raised.split_once('(') {
                    Some((kind, rest)) => (kind, rest.trim_end_matches(')')),
                    None => (raised, ""),
                };
                self.push_error(at, msg_id, ename, evalue);
                break;
            }
            if let Some((name, value)) = line.split_once('=') {
                self.namespace
                    .insert(name.trim().to_string(), value.trim().to_string());
                continue;
            }
            match self.resolve(line) {
                Ok(value) => {
                    let count = self.execution_count;
                    self.push(
                        at,
                        "execute_result",
                        msg_id,
                        json!({"data": {"text/plain": value}, "execution_count": count}),
                    );
                }
                Err(evalue) => {
                    self.push_error(at, msg_id, "NameError", &evalue);
                    break;
                }
            }
        }

        self.push(at, "status", msg_id, json!({"execution_state": "idle"}));
    }
}

/// `name(arg)` -> `arg`.
fn call_arg<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

impl KernelChannel for ScriptedChannel {
    fn send(&mut self, request: &KernelRequest) -> Result<()> {
        if self.crashed || self.closed {
            return Err(Error::Channel("kernel process exited".to_string()));
        }
        match request {
            KernelRequest::KernelInfoRequest { msg_id } => {
                if !self.unresponsive {
                    let at = Instant::now() + self.startup_delay;
                    self.push(at, "kernel_info_reply", msg_id, json!({"status": "ok"}));
                }
            }
            KernelRequest::ExecuteRequest { msg_id, code } => self.run(msg_id, code),
            KernelRequest::ShutdownRequest { .. } => self.closed = true,
        }
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<KernelMessage>> {
        if self.crashed || self.closed {
            return Err(Error::Channel("kernel process exited".to_string()));
        }
        let now = Instant::now();
        let Some(ready_at) = self.queue.front().map(|(at, _)| *at) else {
            thread::sleep(timeout);
            return Ok(None);
        };
        if ready_at > now + timeout {
            thread::sleep(timeout);
            return Ok(None);
        }
        thread::sleep(ready_at.saturating_duration_since(now));
        Ok(self.queue.pop_front().map(|(_, msg)| msg))
    }

    fn is_alive(&mut self) -> bool {
        !self.crashed && !self.closed
    }

    fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        self.queue.clear();
        Ok(())
    }
}

/// In-memory [`HintStore`] with expiry and an outage switch.
#[derive(Debug, Clone, Default)]
pub struct MemoryHintStore {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
    unreachable: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl MemoryHintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going away (or coming back).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of store operations attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Read a live entry directly, bypassing outage and call counting.
    pub fn value(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone())
    }

    /// Seed an entry that lives for an hour.
    pub fn insert(&self, key: &str, value: &str) {
        let expires = Instant::now() + Duration::from_secs(3600);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (value.to_string(), expires));
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::CoordinationUnavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

impl HintStore for MemoryHintStore {
    fn ping(&self) -> Result<()> {
        self.check()
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.value(key))
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}
