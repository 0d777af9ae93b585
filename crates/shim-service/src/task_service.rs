//! The task RPC surface (SPEC_FULL.md §4.6). Composes the registry,
//! agent client, I/O fabric, waiter and event pipeline to implement the
//! containerd task v2 contract.

use crate::config::RuntimeConfig;
use crate::error::{Result, ShimError};
use crate::events::{EventPipeline, TaskEvent};
use crate::io_fabric::{spawn_io, BufferPool, StdioPathsSpec};
use crate::model::{
    validate_id, model_now, ContainerType, Exec, Registry, Sandbox, StdioPaths,
};
use crate::sandbox_manager::SandboxManager;
use crate::waiter::{spawn_waiter, WaiterParams};
use agent_client::AgentClient;
use shim_protocol::{
    ContainerSnapshot, ContainerStatusProto, ContainerTypeProto, ExecSnapshot, ProcessSpecProto,
    ResourceLimitsProto, SandboxSnapshot, StdioConfigProto,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

pub struct CreateRequest {
    pub id: String,
    pub bundle: String,
    pub rootfs: String,
    pub oci_spec_json: String,
    pub container_type: ContainerType,
    pub stdio: StdioPaths,
    pub options_config_path: Option<String>,
}

pub struct StateSnapshot {
    pub id: String,
    pub bundle: String,
    pub pid: u32,
    pub status: ContainerStatusProto,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub terminal: bool,
    pub exit_status: u32,
}

pub struct ExecRequest {
    pub container_id: String,
    pub exec_id: String,
    pub command: Vec<String>,
    pub stdio: StdioPaths,
}

/// Serialises start-before-exit event ordering: held for the full
/// critical section of `start` so a racing waiter cannot emit `TaskExit`
/// before the corresponding `TaskStart` lands in the queue.
type EventSendGuard = AsyncMutex<()>;

pub struct TaskService {
    sandbox: Arc<Sandbox>,
    agent: Arc<dyn AgentClient>,
    events: EventPipeline,
    sandbox_manager: Arc<dyn SandboxManager>,
    config: RuntimeConfig,
    buffer_pool: Arc<BufferPool>,
    event_send_guard: EventSendGuard,
    shutdown: tokio::sync::Notify,
}

impl TaskService {
    pub fn new(
        sandbox: Arc<Sandbox>,
        agent: Arc<dyn AgentClient>,
        events: EventPipeline,
        sandbox_manager: Arc<dyn SandboxManager>,
        config: RuntimeConfig,
        exit_queue_rx: mpsc::Receiver<crate::model::SandboxExitRecord>,
    ) -> Self {
        spawn_exit_queue_consumer(exit_queue_rx, events.sender());
        Self {
            sandbox,
            agent,
            events,
            sandbox_manager,
            config,
            buffer_pool: Arc::new(BufferPool::new()),
            event_send_guard: AsyncMutex::new(()),
            shutdown: tokio::sync::Notify::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub async fn create(&self, req: CreateRequest) -> Result<()> {
        validate_id(&req.id)?;

        let is_sandbox = req.container_type == ContainerType::Sandbox;
        {
            let registry = self.sandbox.registry.lock().await;
            if is_sandbox {
                if registry.containers.values().any(|c| c.container_type == ContainerType::Sandbox) {
                    return Err(ShimError::conflict(format!("sandbox already attached: {}", req.id)));
                }
            } else if registry.containers.contains_key(&req.id) {
                return Err(ShimError::conflict(req.id.clone()));
            }
        }

        let mounted = self
            .sandbox_manager
            .mount_rootfs(&req.bundle)
            .await
            .map_err(|e| ShimError::internal(format!("mount_rootfs failed: {e}")))?;

        let stdio_proto = StdioConfigProto {
            terminal: req.stdio.terminal,
            stdin_path: req.stdio.stdin.clone(),
            stdout_path: req.stdio.stdout.clone(),
            stderr_path: req.stdio.stderr.clone(),
        };

        if is_sandbox {
            self.agent
                .create_sandbox(&req.id, &req.bundle, &req.rootfs, &req.oci_spec_json, &req.id, None)
                .await?;
        } else {
            self.agent
                .create_container(
                    &req.id,
                    &req.bundle,
                    &req.rootfs,
                    &req.oci_spec_json,
                    ContainerTypeProto::PodContainer,
                    stdio_proto,
                )
                .await?;
        }

        let mut container =
            crate::model::Container::new(req.id.clone(), req.bundle.clone(), req.rootfs.clone(), req.container_type, req.stdio);
        container.mounted = mounted;
        container.is_crio = is_crio_manifest(&req.oci_spec_json);

        let mut registry = self.sandbox.registry.lock().await;
        registry.insert(container)?;
        drop(registry);

        self.events
            .emit(TaskEvent::TaskCreate {
                container_id: req.id,
                bundle: req.bundle,
                rootfs: req.rootfs,
                pid: self.sandbox.hypervisor_pid,
            })
            .await;
        Ok(())
    }

    pub async fn start(&self, container_id: &str, exec_id: &str) -> Result<u32> {
        let _send_guard = self.event_send_guard.lock().await;

        if exec_id.is_empty() {
            let is_sandbox = {
                let registry = self.sandbox.registry.lock().await;
                registry.get(container_id)?.container_type == ContainerType::Sandbox
            };

            if is_sandbox {
                self.agent.start_sandbox().await?;
                if let Ok(monitor) = self.agent.monitor().await {
                    *self.sandbox.monitor_cancel.lock().await = Some(monitor.cancel);
                    spawn_sandbox_monitor(
                        self.sandbox.clone(),
                        self.agent.clone(),
                        self.sandbox_manager.clone(),
                        self.events.sender(),
                        monitor.receiver,
                    );
                }
                tokio::spawn(crate::events::run_oom_watcher(
                    self.agent.clone(),
                    self.events.sender(),
                    self.sandbox.clone(),
                    self.config.oom_marker_dir.clone(),
                ));
            } else {
                self.agent.start_container(container_id).await?;
            }

            self.sandbox_manager
                .run_post_start_hooks(&{
                    let registry = self.sandbox.registry.lock().await;
                    registry.get(container_id)?.bundle.clone()
                })
                .await
                .ok();

            let process_io = self.agent.open_io(container_id, "").await.ok();
            self.wire_io_and_waiter(container_id, None, process_io).await;

            let mut registry = self.sandbox.registry.lock().await;
            registry.get_mut(container_id)?.status = ContainerStatusProto::Running;
            drop(registry);

            self.events
                .emit(TaskEvent::TaskStart { container_id: container_id.to_string(), pid: self.sandbox.hypervisor_pid })
                .await;
            Ok(self.sandbox.hypervisor_pid)
        } else {
            let process_spec = {
                let registry = self.sandbox.registry.lock().await;
                let exec = registry.get(container_id)?.execs.get(exec_id).ok_or_else(|| ShimError::not_found(exec_id))?;
                ProcessSpecProto {
                    args: exec.command.clone(),
                    env: vec![],
                    cwd: "/".to_string(),
                    uid: 0,
                    gid: 0,
                    additional_gids: vec![],
                    capabilities_drop: vec![],
                    no_new_privileges: false,
                    stdio: StdioConfigProto {
                        terminal: exec.stdio.terminal,
                        stdin_path: exec.stdio.stdin.clone(),
                        stdout_path: exec.stdio.stdout.clone(),
                        stderr_path: exec.stdio.stderr.clone(),
                    },
                }
            };

            let entered = self.agent.enter_container(container_id, process_spec).await?;

            {
                let mut registry = self.sandbox.registry.lock().await;
                let exec = registry
                    .get_mut(container_id)?
                    .execs
                    .get_mut(exec_id)
                    .ok_or_else(|| ShimError::not_found(exec_id))?;
                exec.agent_process_id = Some(entered.process_id.clone());
            }

            let process_io = self.agent.open_io(container_id, &entered.process_id).await.ok();
            self.wire_io_and_waiter(container_id, Some(exec_id.to_string()), process_io).await;

            self.events
                .emit(TaskEvent::TaskExecStarted {
                    container_id: container_id.to_string(),
                    exec_id: exec_id.to_string(),
                })
                .await;
            Ok(self.sandbox.hypervisor_pid)
        }
    }

    async fn wire_io_and_waiter(
        &self,
        container_id: &str,
        exec_id: Option<String>,
        process_io: Option<agent_client::client::ProcessIo>,
    ) {
        let (stdio_spec, exit_io, stdin_closer, agent_process_id) = {
            let registry = self.sandbox.registry.lock().await;
            let Ok(container) = registry.get(container_id) else { return };
            if let Some(exec_id) = &exec_id {
                let Some(exec) = container.execs.get(exec_id) else { return };
                (
                    StdioPathsSpec {
                        stdin: exec.stdio.stdin.clone(),
                        stdout: exec.stdio.stdout.clone(),
                        stderr: exec.stdio.stderr.clone(),
                    },
                    exec.exit_io.clone(),
                    exec.stdin_closer.clone(),
                    exec.agent_process_id.clone().unwrap_or_default(),
                )
            } else {
                (
                    StdioPathsSpec {
                        stdin: container.stdio.stdin.clone(),
                        stdout: container.stdio.stdout.clone(),
                        stderr: container.stdio.stderr.clone(),
                    },
                    container.exit_io.clone(),
                    container.stdin_closer.clone(),
                    String::new(),
                )
            }
        };

        if let Some(process_io) = process_io {
            tokio::spawn(spawn_io(self.buffer_pool.clone(), stdio_spec, process_io, exit_io, stdin_closer));
        } else {
            exit_io.close();
            stdin_closer.close();
        }

        let is_sandbox_init = exec_id.is_none()
            && {
                let registry = self.sandbox.registry.lock().await;
                registry.get(container_id).map(|c| c.container_type == ContainerType::Sandbox).unwrap_or(false)
            };

        spawn_waiter(
            self.sandbox.clone(),
            self.agent.clone(),
            WaiterParams {
                container_id: container_id.to_string(),
                exec_id,
                agent_process_id,
                hypervisor_pid: self.sandbox.hypervisor_pid,
                is_sandbox_init,
            },
        );
    }

    pub async fn delete(&self, container_id: &str, exec_id: &str) -> Result<(u32, u64)> {
        if exec_id.is_empty() {
            let (container_type, bundle, mounted) = {
                let registry = self.sandbox.registry.lock().await;
                let container = registry.get(container_id)?;
                (container.container_type, container.bundle.clone(), container.mounted)
            };

            if container_type != ContainerType::Sandbox {
                let already_stopped = {
                    let registry = self.sandbox.registry.lock().await;
                    registry.get(container_id)?.status == ContainerStatusProto::Stopped
                };
                if !already_stopped {
                    self.agent.stop_container(container_id, false).await.ok();
                }
            }
            // I7: only remove the registry entry once `deleteContainer`
            // has succeeded, or the agent never knew about it to begin
            // with (its own `NotFound` — "never started" from the
            // agent's point of view).
            if let Err(e) = self.agent.delete_container(container_id).await {
                if e.code != shim_protocol::AgentStatusCode::NotFound {
                    return Err(e.into());
                }
            }
            self.sandbox_manager.run_post_stop_hooks(&bundle).await.ok();
            if mounted {
                self.sandbox_manager.unmount_rootfs(&bundle).await.ok();
            }

            let mut registry = self.sandbox.registry.lock().await;
            let container = registry.remove(container_id).ok_or_else(|| ShimError::not_found(container_id))?;
            drop(registry);

            let exit_status = container.exit_status.unwrap_or(0);
            let exit_time = container.exit_time.unwrap_or_else(model_now);
            self.events
                .emit(TaskEvent::TaskDelete {
                    container_id: container_id.to_string(),
                    exit_status,
                    exit_time_unix: exit_time,
                    pid: self.sandbox.hypervisor_pid,
                })
                .await;
            Ok((exit_status, exit_time))
        } else {
            let mut registry = self.sandbox.registry.lock().await;
            let container = registry.get_mut(container_id)?;
            let exec = container.execs.remove(exec_id).ok_or_else(|| ShimError::not_found(exec_id))?;
            Ok((exec.exit_code as u32, exec.exit_time.unwrap_or_else(model_now)))
        }
    }

    pub async fn exec(&self, req: ExecRequest) -> Result<()> {
        let mut registry = self.sandbox.registry.lock().await;
        let container = registry.get_mut(&req.container_id)?;
        if container.execs.contains_key(&req.exec_id) {
            return Err(ShimError::conflict(req.exec_id.clone()));
        }
        container.execs.insert(req.exec_id.clone(), Exec::new(req.exec_id.clone(), req.command, req.stdio));
        drop(registry);

        self.events
            .emit(TaskEvent::TaskExecAdded { container_id: req.container_id, exec_id: req.exec_id })
            .await;
        Ok(())
    }

    pub async fn kill(&self, container_id: &str, exec_id: &str, signal: u32, all: bool) -> Result<()> {
        let status = {
            let registry = self.sandbox.registry.lock().await;
            let container = registry.get(container_id)?;
            if exec_id.is_empty() {
                container.status
            } else {
                container.execs.get(exec_id).ok_or_else(|| ShimError::not_found(exec_id))?.status
            }
        };

        const SIGKILL: u32 = 9;
        const SIGTERM: u32 = 15;
        if (signal == SIGKILL || signal == SIGTERM) && status == ContainerStatusProto::Stopped {
            return Ok(());
        }

        let process_id = if exec_id.is_empty() {
            String::new()
        } else {
            let registry = self.sandbox.registry.lock().await;
            registry
                .get(container_id)?
                .execs
                .get(exec_id)
                .and_then(|e| e.agent_process_id.clone())
                .unwrap_or_default()
        };
        self.agent.signal_process(container_id, &process_id, signal, all).await?;
        Ok(())
    }

    pub async fn resize_pty(&self, container_id: &str, exec_id: &str, rows: u16, cols: u16) -> Result<()> {
        let process_id = {
            let registry = self.sandbox.registry.lock().await;
            let container = registry.get(container_id)?;
            if exec_id.is_empty() {
                String::new()
            } else {
                container.execs.get(exec_id).and_then(|e| e.agent_process_id.clone()).unwrap_or_default()
            }
        };
        self.agent.winsize(container_id, &process_id, rows, cols).await?;
        Ok(())
    }

    pub async fn state(&self, container_id: &str, exec_id: &str) -> Result<StateSnapshot> {
        let registry = self.sandbox.registry.lock().await;
        let container = registry.get(container_id)?;
        if exec_id.is_empty() {
            Ok(StateSnapshot {
                id: container.id.clone(),
                bundle: container.bundle.clone(),
                pid: self.sandbox.hypervisor_pid,
                status: container.status,
                stdin: container.stdio.stdin.clone(),
                stdout: container.stdio.stdout.clone(),
                stderr: container.stdio.stderr.clone(),
                terminal: container.stdio.terminal,
                exit_status: container.exit_status.unwrap_or(0),
            })
        } else {
            let exec = container.execs.get(exec_id).ok_or_else(|| ShimError::not_found(exec_id))?;
            Ok(StateSnapshot {
                id: exec.id.clone(),
                bundle: container.bundle.clone(),
                pid: self.sandbox.hypervisor_pid,
                status: exec.status,
                stdin: exec.stdio.stdin.clone(),
                stdout: exec.stdio.stdout.clone(),
                stderr: exec.stdio.stderr.clone(),
                terminal: exec.stdio.terminal,
                exit_status: exec.exit_code as u32,
            })
        }
    }

    pub async fn pause(&self, container_id: &str) -> Result<()> {
        let mut registry = self.sandbox.registry.lock().await;
        registry.get_mut(container_id)?.status = ContainerStatusProto::Pausing;
        drop(registry);

        match self.agent.pause_container(container_id).await {
            Ok(()) => {
                let mut registry = self.sandbox.registry.lock().await;
                registry.get_mut(container_id)?.status = ContainerStatusProto::Paused;
                drop(registry);
                self.events.emit(TaskEvent::TaskPaused { container_id: container_id.to_string() }).await;
                Ok(())
            }
            Err(e) => {
                self.refresh_status_best_effort(container_id).await;
                Err(e.into())
            }
        }
    }

    pub async fn resume(&self, container_id: &str) -> Result<()> {
        match self.agent.resume_container(container_id).await {
            Ok(()) => {
                let mut registry = self.sandbox.registry.lock().await;
                registry.get_mut(container_id)?.status = ContainerStatusProto::Running;
                drop(registry);
                self.events.emit(TaskEvent::TaskResumed { container_id: container_id.to_string() }).await;
                Ok(())
            }
            Err(e) => {
                self.refresh_status_best_effort(container_id).await;
                Err(e.into())
            }
        }
    }

    async fn refresh_status_best_effort(&self, container_id: &str) {
        let refreshed = self.agent.status_container(container_id).await.unwrap_or(ContainerStatusProto::Unknown);
        let mut registry = self.sandbox.registry.lock().await;
        if let Ok(container) = registry.get_mut(container_id) {
            container.status = refreshed;
        }
    }

    /// Releases the sandbox mutex before blocking so other handlers can
    /// keep making progress while this call waits for an exit.
    pub async fn wait(&self, container_id: &str, exec_id: &str) -> Result<i32> {
        let mut rx = {
            let registry = self.sandbox.registry.lock().await;
            let container = registry.get(container_id)?;
            if exec_id.is_empty() {
                container.exit_rx.clone()
            } else {
                container.execs.get(exec_id).ok_or_else(|| ShimError::not_found(exec_id))?.exit_rx.clone()
            }
        };

        loop {
            if let Some(record) = *rx.borrow() {
                return Ok(record.status);
            }
            if rx.changed().await.is_err() {
                return Err(ShimError::internal("exit channel closed without a value"));
            }
        }
    }

    pub async fn close_io(&self, container_id: &str, exec_id: &str) -> Result<()> {
        let stdin_closer = {
            let registry = self.sandbox.registry.lock().await;
            let container = registry.get(container_id)?;
            if exec_id.is_empty() {
                container.stdin_closer.clone()
            } else {
                container.execs.get(exec_id).ok_or_else(|| ShimError::not_found(exec_id))?.stdin_closer.clone()
            }
        };
        stdin_closer.wait().await;
        Ok(())
    }

    pub async fn pids(&self, container_id: &str) -> Result<Vec<u32>> {
        let registry = self.sandbox.registry.lock().await;
        registry.get(container_id)?;
        Ok(vec![self.sandbox.hypervisor_pid])
    }

    pub async fn connect(&self) -> (u32, u32) {
        (self.sandbox.shim_pid, self.sandbox.hypervisor_pid)
    }

    pub async fn stats(&self, container_id: &str) -> Result<shim_protocol::ContainerStatsProto> {
        Ok(self.agent.stats_container(container_id).await?)
    }

    pub async fn update(&self, container_id: &str, resources: ResourceLimitsProto) -> Result<()> {
        self.agent.update_container(container_id, resources).await?;
        Ok(())
    }

    /// Returns true if the shim should exit after this call.
    pub async fn shutdown(&self) -> bool {
        let remaining = self.sandbox.registry.lock().await.container_count();
        if remaining > 0 {
            return false;
        }
        self.shutdown.notify_waiters();
        true
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown.notified().await;
    }

    pub async fn checkpoint(&self) -> Result<()> {
        Err(ShimError::unimplemented("checkpoint"))
    }

    /// Crash-recovery path: idempotent even if `container_id` is unknown
    /// (the orchestrator calls this against bundles whose shim may
    /// already be gone). Returns the conventional `128 + SIGKILL` code.
    pub async fn cleanup(&self, container_id: &str) -> Result<i32> {
        let bundle = {
            let registry = self.sandbox.registry.lock().await;
            registry.get(container_id).map(|c| c.bundle.clone()).unwrap_or_default()
        };
        let _ = self.sandbox_manager.cleanup(&bundle).await;
        Ok(128 + 9)
    }

    /// Read-only snapshots for the debug control socket (`shim-ctl`).
    pub async fn sandbox_snapshot(&self) -> SandboxSnapshot {
        let registry = self.sandbox.registry.lock().await;
        SandboxSnapshot {
            id: self.sandbox.id.clone(),
            hypervisor_pid: self.sandbox.hypervisor_pid,
            shim_pid: self.sandbox.shim_pid,
            container_count: registry.container_count(),
        }
    }

    pub async fn container_snapshots(&self) -> Vec<ContainerSnapshot> {
        let registry = self.sandbox.registry.lock().await;
        registry
            .containers
            .values()
            .map(|c| ContainerSnapshot {
                id: c.id.clone(),
                status: c.status,
                exit_status: c.exit_status,
                exec_count: c.execs.len(),
            })
            .collect()
    }

    pub async fn exec_snapshots(&self, container_id: &str) -> Result<Vec<ExecSnapshot>> {
        let registry = self.sandbox.registry.lock().await;
        let container = registry.get(container_id)?;
        Ok(container
            .execs
            .values()
            .map(|e| ExecSnapshot { id: e.id.clone(), status: e.status, exit_code: e.exit_code })
            .collect())
    }
}

/// Whether the bundle's OCI spec carries CRI-O's container-manager
/// annotation. The OCI spec never gets a full JSON parse elsewhere in this
/// crate (it is passed through to the agent opaquely), so this is a
/// targeted substring probe rather than a new `serde_json` dependency.
fn is_crio_manifest(oci_spec_json: &str) -> bool {
    oci_spec_json.contains("\"io.container.manager\":\"cri-o\"")
        || oci_spec_json.contains("\"io.container.manager\": \"cri-o\"")
}

fn spawn_sandbox_monitor(
    sandbox: Arc<Sandbox>,
    agent: Arc<dyn AgentClient>,
    sandbox_manager: Arc<dyn SandboxManager>,
    events: tokio::sync::mpsc::Sender<TaskEvent>,
    monitor_rx: tokio::sync::oneshot::Receiver<Option<String>>,
) {
    tokio::spawn(async move {
        // `Ok(None)` means the sandbox-init waiter cancelled us after
        // tearing the sandbox down itself (§4.4 step 4); `Err` means the
        // sender was dropped without firing, which only happens on the
        // same cancellation path. Neither warrants re-running teardown.
        if let Ok(Some(reason)) = monitor_rx.await {
            log::warn!("sandbox monitor reported failure: {reason}");
            let _ = agent.stop_sandbox(true).await;
            let _ = agent.delete_sandbox().await;

            let bundles: Vec<String> = {
                let registry = sandbox.registry.lock().await;
                registry.containers.values().filter(|c| c.mounted).map(|c| c.bundle.clone()).collect()
            };
            for bundle in bundles {
                let _ = sandbox_manager.unmount_rootfs(&bundle).await;
            }
            let _ = events; // per-process waiters emit their own TaskExit events
        }
    });
}

pub fn new_sandbox(
    id: impl Into<String>,
    hypervisor_pid: u32,
) -> (Sandbox, mpsc::Receiver<crate::model::SandboxExitRecord>) {
    let (exit_queue, exit_queue_rx) = mpsc::channel(crate::model::EXIT_QUEUE_CAPACITY);
    let sandbox = Sandbox {
        id: id.into(),
        hypervisor_pid,
        shim_pid: std::process::id(),
        registry: AsyncMutex::new(Registry { containers: HashMap::new() }),
        exit_queue,
        monitor_cancel: AsyncMutex::new(None),
    };
    (sandbox, exit_queue_rx)
}

/// Drains the sandbox exit queue and turns each record into a `TaskExit`
/// event. The waiter (§4.4) only ever touches this channel, never the
/// events channel directly, so `TaskStart`/`TaskExit` ordering rests on
/// the waiter acquiring the sandbox mutex only after the agent
/// `waitProcess` call returns — by which point any racing `start` has
/// long since released the event-send mutex (§5).
fn spawn_exit_queue_consumer(
    mut exit_queue_rx: mpsc::Receiver<crate::model::SandboxExitRecord>,
    events: mpsc::Sender<TaskEvent>,
) {
    tokio::spawn(async move {
        while let Some(record) = exit_queue_rx.recv().await {
            let _ = events
                .send(TaskEvent::TaskExit {
                    container_id: record.container_id,
                    exec_id: record.exec_id,
                    pid: record.pid,
                    status: record.status,
                    exit_time_unix: record.exit_time_unix,
                })
                .await;
        }
    });
}
