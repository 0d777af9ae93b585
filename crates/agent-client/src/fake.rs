//! An in-process stand-in for the guest agent, used by `shim-service`'s
//! integration tests. It has no process/mount/cgroup logic of its own —
//! it just tracks scripted state and answers the same RPC surface the
//! real agent would, which is all a test of the shim's own state machine
//! needs.

use crate::client::{AgentClient, EnterResult, MonitorHandle, ProcessIo};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use shim_protocol::{
    ContainerStatsProto, ContainerStatusProto, ContainerTypeProto, ProcessSpecProto,
    ResourceLimitsProto, StdioConfigProto,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    containers: HashMap<String, ContainerStatusProto>,
    /// exit codes queued per process id, consumed by `wait_process`.
    exit_codes: HashMap<String, i32>,
    sandbox_started: bool,
    monitor_tx: Option<std::sync::Arc<Mutex<Option<tokio::sync::oneshot::Sender<Option<String>>>>>>,
}

pub struct FakeAgentClient {
    state: Mutex<State>,
    next_exec_id: AtomicU64,
}

impl FakeAgentClient {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()), next_exec_id: AtomicU64::new(1) }
    }

    /// Arranges for a future `wait_process(_, process_id)` to return `code`.
    pub fn set_exit_code(&self, process_id: &str, code: i32) {
        self.state.lock().unwrap().exit_codes.insert(process_id.to_string(), code);
    }

    /// Fires the outstanding `monitor()` handle, simulating a VM crash.
    pub fn kill_sandbox(&self, reason: &str) {
        if let Some(slot) = self.state.lock().unwrap().monitor_tx.take() {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(Some(reason.to_string()));
            }
        }
    }
}

impl Default for FakeAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentClient for FakeAgentClient {
    async fn create_sandbox(
        &self,
        sandbox_id: &str,
        _bundle: &str,
        _rootfs: &str,
        _oci_spec_json: &str,
        _hostname: &str,
        _netns: Option<&str>,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(sandbox_id.to_string(), ContainerStatusProto::Created);
        Ok(())
    }

    async fn start_sandbox(&self) -> Result<()> {
        self.state.lock().unwrap().sandbox_started = true;
        Ok(())
    }

    async fn stop_sandbox(&self, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn delete_sandbox(&self) -> Result<()> {
        Ok(())
    }

    async fn create_container(
        &self,
        container_id: &str,
        _bundle: &str,
        _rootfs: &str,
        _oci_spec_json: &str,
        _container_type: ContainerTypeProto,
        _stdio: StdioConfigProto,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(container_id.to_string(), ContainerStatusProto::Created);
        Ok(())
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let status = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| AgentError::new(shim_protocol::AgentStatusCode::NotFound, container_id))?;
        *status = ContainerStatusProto::Running;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.containers.get_mut(container_id) {
            *status = ContainerStatusProto::Stopped;
        }
        Ok(())
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        self.state.lock().unwrap().containers.remove(container_id);
        Ok(())
    }

    async fn pause_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let status = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| AgentError::new(shim_protocol::AgentStatusCode::NotFound, container_id))?;
        *status = ContainerStatusProto::Paused;
        Ok(())
    }

    async fn resume_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let status = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| AgentError::new(shim_protocol::AgentStatusCode::NotFound, container_id))?;
        *status = ContainerStatusProto::Running;
        Ok(())
    }

    async fn enter_container(
        &self,
        _container_id: &str,
        _process: ProcessSpecProto,
    ) -> Result<EnterResult> {
        let id = self.next_exec_id.fetch_add(1, Ordering::SeqCst);
        Ok(EnterResult { process_id: format!("fake-exec-{id}") })
    }

    async fn signal_process(
        &self,
        _container_id: &str,
        process_id: &str,
        signal: u32,
        _all: bool,
    ) -> Result<()> {
        // SIGKILL=9, SIGTERM=15: record a plausible exit code for a subsequent wait.
        if signal == 9 || signal == 15 {
            self.state.lock().unwrap().exit_codes.entry(process_id.to_string()).or_insert(128 + signal as i32);
        }
        Ok(())
    }

    async fn wait_process(&self, _container_id: &str, process_id: &str) -> Result<i32> {
        Ok(self.state.lock().unwrap().exit_codes.get(process_id).copied().unwrap_or(0))
    }

    async fn open_io(&self, _container_id: &str, _process_id: &str) -> Result<ProcessIo> {
        Ok(ProcessIo { stdin: None, stdout: None, stderr: None })
    }

    async fn winsize(
        &self,
        _container_id: &str,
        _process_id: &str,
        _rows: u16,
        _cols: u16,
    ) -> Result<()> {
        Ok(())
    }

    async fn status_container(&self, container_id: &str) -> Result<ContainerStatusProto> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .copied()
            .ok_or_else(|| AgentError::new(shim_protocol::AgentStatusCode::NotFound, container_id))
    }

    async fn stats_container(&self, container_id: &str) -> Result<ContainerStatsProto> {
        Ok(ContainerStatsProto { container_id: container_id.to_string(), ..Default::default() })
    }

    async fn update_container(
        &self,
        _container_id: &str,
        _resources: ResourceLimitsProto,
    ) -> Result<()> {
        Ok(())
    }

    async fn get_oom_event(&self) -> Result<String> {
        Err(AgentError::new(shim_protocol::AgentStatusCode::Unimplemented, "fake agent has no OOM source"))
    }

    async fn get_agent_metrics(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn update_runtime_metrics(&self) -> Result<()> {
        Ok(())
    }

    async fn monitor(&self) -> Result<MonitorHandle> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        let slot = std::sync::Arc::new(Mutex::new(Some(tx)));
        self.state.lock().unwrap().monitor_tx = Some(slot.clone());
        tokio::spawn(async move {
            if cancel_rx.await.is_ok() {
                if let Some(tx) = slot.lock().unwrap().take() {
                    let _ = tx.send(None);
                }
            }
        });
        Ok(MonitorHandle { receiver: rx, cancel: cancel_tx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_stop_transitions_status() {
        let agent = FakeAgentClient::new();
        agent.create_container("c1", "/b", "/r", "{}", ContainerTypeProto::PodContainer, StdioConfigProto::default()).await.unwrap();
        assert_eq!(agent.status_container("c1").await.unwrap(), ContainerStatusProto::Created);
        agent.start_container("c1").await.unwrap();
        assert_eq!(agent.status_container("c1").await.unwrap(), ContainerStatusProto::Running);
        agent.stop_container("c1", false).await.unwrap();
        assert_eq!(agent.status_container("c1").await.unwrap(), ContainerStatusProto::Stopped);
    }

    #[tokio::test]
    async fn wait_process_defaults_to_zero() {
        let agent = FakeAgentClient::new();
        assert_eq!(agent.wait_process("c1", "init").await.unwrap(), 0);
        agent.set_exit_code("init", 7);
        assert_eq!(agent.wait_process("c1", "init").await.unwrap(), 7);
    }
}
