//! One waiter task per process (SPEC_FULL.md §4.4): blocks on end-of-I/O,
//! calls `waitProcess`, records the exit under the sandbox mutex, and —
//! for a sandbox-init process — drives sandbox teardown.

use crate::model::{model_now, CloseSignal, ContainerType, Sandbox, SandboxExitRecord};
use agent_client::AgentClient;
use std::sync::Arc;

pub struct WaiterParams {
    pub container_id: String,
    pub exec_id: Option<String>,
    pub agent_process_id: String,
    pub hypervisor_pid: u32,
    pub is_sandbox_init: bool,
}

/// Looks up the `exit_io` signal for the target process without holding
/// the registry lock across the subsequent await.
async fn exit_io_signal(sandbox: &Sandbox, params: &WaiterParams) -> Option<Arc<CloseSignal>> {
    let registry = sandbox.registry.lock().await;
    let container = registry.get(&params.container_id).ok()?;
    if let Some(exec_id) = &params.exec_id {
        container.execs.get(exec_id).map(|e| e.exit_io.clone())
    } else {
        Some(container.exit_io.clone())
    }
}

pub fn spawn_waiter(sandbox: Arc<Sandbox>, agent: Arc<dyn AgentClient>, params: WaiterParams) {
    let exit_queue = sandbox.exit_queue.clone();
    tokio::spawn(async move {
        // Step 1: wait for the I/O fabric to fully drain before reaping.
        if let Some(signal) = exit_io_signal(&sandbox, &params).await {
            signal.wait().await;
        }

        // Step 2: ask the agent for the real exit status; default to 255.
        let status = agent
            .wait_process(&params.container_id, &params.agent_process_id)
            .await
            .unwrap_or_else(|e| {
                log::warn!(
                    "waitProcess failed for {}/{}: {e}",
                    params.container_id,
                    params.agent_process_id
                );
                255
            });

        // Steps 3-7: record the exit under the sandbox mutex.
        let mut registry = sandbox.registry.lock().await;
        if params.is_sandbox_init {
            let is_sandbox_type = registry
                .get(&params.container_id)
                .map(|c| c.container_type == ContainerType::Sandbox)
                .unwrap_or(false);
            drop(registry);
            if is_sandbox_type {
                // §4.4 step 4: cancel the sandbox monitor before tearing
                // down ourselves, so its observer task doesn't race us
                // into re-running stop/delete against an already-gone
                // sandbox once the agent connection drops.
                if let Some(cancel) = sandbox.monitor_cancel.lock().await.take() {
                    let _ = cancel.send(());
                }
                if let Err(e) = agent.stop_sandbox(true).await {
                    log::warn!("stopSandbox on init exit failed: {e}");
                }
                if let Err(e) = agent.delete_sandbox().await {
                    log::warn!("deleteSandbox on init exit failed: {e}");
                }
            } else if let Err(e) = agent.stop_container(&params.container_id, false).await {
                log::warn!("stopContainer on init exit failed: {e}");
            }
            registry = sandbox.registry.lock().await;
        }

        if let Ok(container) = registry.get_mut(&params.container_id) {
            if let Some(exec_id) = &params.exec_id {
                if let Some(exec) = container.execs.get_mut(exec_id) {
                    exec.record_exit(status);
                }
            } else {
                container.record_exit(status as u32);
            }
        }
        drop(registry);

        log::info!(
            "process exited: container={} exec={:?} status={status}",
            params.container_id,
            params.exec_id
        );

        // Step 8: post to the sandbox exit queue rather than the events
        // pipeline directly; a single consumer drains it into `TaskExit`.
        let _ = exit_queue
            .send(SandboxExitRecord {
                container_id: params.container_id.clone(),
                exec_id: params.exec_id.clone().unwrap_or_default(),
                pid: params.hypervisor_pid,
                status,
                exit_time_unix: model_now(),
            })
            .await;
    });
}
