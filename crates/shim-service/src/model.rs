//! The sandbox/container/exec data model (see SPEC_FULL.md §3).

use crate::error::{Result, ShimError};
use shim_protocol::ContainerStatusProto as Status;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, watch, Mutex, Notify};

pub use Status as ContainerStatus;

/// A process's exit record, broadcast through a watch channel so any
/// number of `Wait` callers — past or future — observe the same value.
/// This realises the "refill exit channel on every read" requirement
/// with a primitive built for exactly that access pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub status: i32,
    pub exit_time_unix: u64,
}

/// An entry on the sandbox-wide exit queue (§3, §4.4 step 8): posted by a
/// waiter once it has recorded the process's exit under the sandbox
/// mutex, and drained by a single consumer that turns it into a
/// `TaskExit` event. Bounding this separately from the events channel
/// lets a burst of process exits queue up without a waiter blocking on
/// the (much slower, publish-timeout-bound) event forwarder.
#[derive(Debug, Clone)]
pub struct SandboxExitRecord {
    pub container_id: String,
    pub exec_id: String,
    pub pid: u32,
    pub status: i32,
    pub exit_time_unix: u64,
}

pub const EXIT_QUEUE_CAPACITY: usize = 32;

/// A one-shot, idempotent close signal with at most one waiter.
/// `close()` may race ahead of `wait()`; `Notify::notify_one` retains a
/// permit for the next `notified().await` so either ordering resolves.
pub struct CloseSignal {
    notify: Notify,
    closed: AtomicBool,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self { notify: Notify::new(), closed: AtomicBool::new(false) }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    pub async fn wait(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.notify.notified().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Alias kept for call sites outside this module that only need "now".
pub fn model_now() -> u64 {
    now_unix()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    Sandbox,
    PodContainer,
}

pub struct StdioPaths {
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub terminal: bool,
}

pub struct Exec {
    /// The id the caller addressed this exec with; the agent assigns a
    /// separate internal process id once `EnterContainer` succeeds.
    pub id: String,
    pub agent_process_id: Option<String>,
    pub command: Vec<String>,
    pub stdio: StdioPaths,
    pub status: Status,
    pub exit_code: i32,
    pub exit_time: Option<u64>,
    pub exit_tx: watch::Sender<Option<ExitRecord>>,
    pub exit_rx: watch::Receiver<Option<ExitRecord>>,
    pub exit_io: Arc<CloseSignal>,
    pub stdin_closer: Arc<CloseSignal>,
}

impl Exec {
    pub fn new(id: impl Into<String>, command: Vec<String>, stdio: StdioPaths) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            id: id.into(),
            agent_process_id: None,
            command,
            stdio,
            status: Status::Created,
            exit_code: 255,
            exit_time: None,
            exit_tx,
            exit_rx,
            exit_io: Arc::new(CloseSignal::new()),
            stdin_closer: Arc::new(CloseSignal::new()),
        }
    }

    pub fn record_exit(&mut self, status: i32) {
        self.status = Status::Stopped;
        self.exit_code = status;
        let now = now_unix();
        self.exit_time = Some(now);
        let _ = self.exit_tx.send(Some(ExitRecord { status, exit_time_unix: now }));
    }
}

pub struct Container {
    pub id: String,
    pub bundle: String,
    pub rootfs: String,
    pub container_type: ContainerType,
    pub status: Status,
    pub exit_status: Option<u32>,
    pub exit_time: Option<u64>,
    pub stdio: StdioPaths,
    pub mounted: bool,
    /// Whether this container's OCI spec carries the CRI-O container
    /// manager annotation; gates the `oom` bundle marker file (§6).
    pub is_crio: bool,
    pub exit_tx: watch::Sender<Option<ExitRecord>>,
    pub exit_rx: watch::Receiver<Option<ExitRecord>>,
    pub exit_io: Arc<CloseSignal>,
    pub stdin_closer: Arc<CloseSignal>,
    pub execs: HashMap<String, Exec>,
}

impl Container {
    pub fn new(
        id: impl Into<String>,
        bundle: impl Into<String>,
        rootfs: impl Into<String>,
        container_type: ContainerType,
        stdio: StdioPaths,
    ) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            id: id.into(),
            bundle: bundle.into(),
            rootfs: rootfs.into(),
            container_type,
            status: Status::Created,
            exit_status: None,
            exit_time: None,
            stdio,
            mounted: false,
            is_crio: false,
            exit_tx,
            exit_rx,
            exit_io: Arc::new(CloseSignal::new()),
            stdin_closer: Arc::new(CloseSignal::new()),
            execs: HashMap::new(),
        }
    }

    pub fn record_exit(&mut self, status: u32) {
        self.status = Status::Stopped;
        self.exit_status = Some(status);
        let now = now_unix();
        self.exit_time = Some(now);
        let _ = self.exit_tx.send(Some(ExitRecord { status: status as i32, exit_time_unix: now }));
    }
}

/// Process-global singleton for this shim instance. All mutations go
/// through `Sandbox::registry` which callers must lock before touching
/// any `Container`/`Exec` (I6: status/exit/exit-time update atomically).
pub struct Sandbox {
    pub id: String,
    pub hypervisor_pid: u32,
    pub shim_pid: u32,
    pub registry: Mutex<Registry>,
    pub exit_queue: mpsc::Sender<SandboxExitRecord>,
    /// The running sandbox monitor's cancel handle, if one has been
    /// started. Taken and fired by the sandbox-init waiter (§4.4 step 4)
    /// so the monitor observer task does not re-run teardown once the
    /// waiter has already stopped and deleted the sandbox itself.
    pub monitor_cancel: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

#[derive(Default)]
pub struct Registry {
    pub containers: HashMap<String, Container>,
}

/// Character class and length rule shared by sandbox and container ids.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ShimError::validation("id", "ID cannot be blank"));
    }
    if id.len() > 64 {
        return Err(ShimError::validation("id", format!("invalid container/sandbox ID: {id}")));
    }
    let mut chars = id.chars();
    let first = chars.next().unwrap();
    if first == '.' || first == '-' {
        return Err(ShimError::validation("id", format!("invalid container/sandbox ID: {id}")));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-') {
        return Err(ShimError::validation("id", format!("invalid container/sandbox ID: {id}")));
    }
    Ok(())
}

impl Registry {
    pub fn get(&self, id: &str) -> Result<&Container> {
        self.containers.get(id).ok_or_else(|| ShimError::not_found(id))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Container> {
        self.containers.get_mut(id).ok_or_else(|| ShimError::not_found(id))
    }

    pub fn insert(&mut self, container: Container) -> Result<()> {
        if self.containers.contains_key(&container.id) {
            return Err(ShimError::conflict(container.id.clone()));
        }
        self.containers.insert(container.id.clone(), container);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Container> {
        self.containers.remove(id)
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_id_rejects_blank() {
        let err = validate_id("").unwrap_err();
        assert_eq!(err.to_string(), "validation error for 'id': ID cannot be blank");
    }

    #[test]
    fn validate_id_rejects_leading_dash() {
        assert!(validate_id("-foo").is_err());
    }

    #[test]
    fn validate_id_accepts_typical_ids() {
        assert!(validate_id("pod-1").is_ok());
        assert!(validate_id("container_1.a").is_ok());
    }

    #[test]
    fn registry_insert_rejects_duplicate() {
        let mut reg = Registry::default();
        let stdio = StdioPaths { stdin: None, stdout: None, stderr: None, terminal: false };
        reg.insert(Container::new("c1", "/b", "/r", ContainerType::PodContainer, stdio)).unwrap();
        let stdio2 = StdioPaths { stdin: None, stdout: None, stderr: None, terminal: false };
        let err = reg
            .insert(Container::new("c1", "/b", "/r", ContainerType::PodContainer, stdio2))
            .unwrap_err();
        assert_eq!(err.status_code(), crate::error::StatusCode::AlreadyExists);
    }

    #[test]
    fn create_then_delete_returns_count_to_zero() {
        let mut reg = Registry::default();
        let stdio = StdioPaths { stdin: None, stdout: None, stderr: None, terminal: false };
        reg.insert(Container::new("c1", "/b", "/r", ContainerType::PodContainer, stdio)).unwrap();
        assert_eq!(reg.container_count(), 1);
        reg.remove("c1");
        assert_eq!(reg.container_count(), 0);
    }
}
