use crate::error::{AgentError, Result};
use crate::transport::{self, AgentEndpoint, AgentStream};
use async_trait::async_trait;
use shim_protocol::{
    AgentRequest, AgentResponse, AgentStatusCode, ContainerStatsProto, ContainerStatusProto,
    ContainerTypeProto, CreateContainerRequest, CreateSandboxRequest, IoChannelProto,
    IoOpenRequest, ProcessSpecProto, ResourceLimitsProto, StdioConfigProto,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn write_frame(stream: &mut AgentStream, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut AgentStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn call(endpoint: &AgentEndpoint, request: AgentRequest) -> Result<AgentResponse> {
    let mut stream = transport::connect(endpoint).await?;
    write_frame(&mut stream, &shim_protocol::serialize(&request)).await?;
    let payload = read_frame(&mut stream).await?;
    shim_protocol::deserialize(&payload)
        .map_err(|e| AgentError::internal(format!("malformed agent response: {e}")))
}

fn expect_error(resp: AgentResponse) -> AgentError {
    match resp {
        AgentResponse::Error { code, message } => AgentError::new(code, message),
        other => AgentError::internal(format!("unexpected agent response: {other:?}")),
    }
}

/// Result of a successful `EnterContainer` call.
pub struct EnterResult {
    pub process_id: String,
}

/// Handle to a process's stdio, each direction its own connected stream.
pub struct ProcessIo {
    pub stdin: Option<AgentStream>,
    pub stdout: Option<AgentStream>,
    pub stderr: Option<AgentStream>,
}

/// A single error from the sandbox monitor: the VM or agent died. The
/// receiver yields `Some(reason)` on a genuine crash and `None` when the
/// monitor was cancelled (the sandbox-init waiter calls `cancel` once it
/// has torn the sandbox down itself, so the observer does not re-run
/// teardown against an already-gone sandbox — §3/§4.4 step 4's "send nil
/// on its channel if present").
pub struct MonitorHandle {
    pub receiver: tokio::sync::oneshot::Receiver<Option<String>>,
    pub cancel: tokio::sync::oneshot::Sender<()>,
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn create_sandbox(
        &self,
        sandbox_id: &str,
        bundle: &str,
        rootfs: &str,
        oci_spec_json: &str,
        hostname: &str,
        netns: Option<&str>,
    ) -> Result<()>;
    async fn start_sandbox(&self) -> Result<()>;
    async fn stop_sandbox(&self, force: bool) -> Result<()>;
    async fn delete_sandbox(&self) -> Result<()>;

    async fn create_container(
        &self,
        container_id: &str,
        bundle: &str,
        rootfs: &str,
        oci_spec_json: &str,
        container_type: ContainerTypeProto,
        stdio: StdioConfigProto,
    ) -> Result<()>;
    async fn start_container(&self, container_id: &str) -> Result<()>;
    async fn stop_container(&self, container_id: &str, force: bool) -> Result<()>;
    async fn delete_container(&self, container_id: &str) -> Result<()>;
    /// Freezes every process in the container's cgroup (`SIGSTOP`-equivalent
    /// at the guest cgroup freezer, not a signal to any one process).
    async fn pause_container(&self, container_id: &str) -> Result<()>;
    async fn resume_container(&self, container_id: &str) -> Result<()>;

    async fn enter_container(
        &self,
        container_id: &str,
        process: ProcessSpecProto,
    ) -> Result<EnterResult>;
    async fn signal_process(
        &self,
        container_id: &str,
        process_id: &str,
        signal: u32,
        all: bool,
    ) -> Result<()>;
    async fn wait_process(&self, container_id: &str, process_id: &str) -> Result<i32>;

    async fn open_io(&self, container_id: &str, process_id: &str) -> Result<ProcessIo>;
    async fn winsize(
        &self,
        container_id: &str,
        process_id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<()>;

    async fn status_container(&self, container_id: &str) -> Result<ContainerStatusProto>;
    async fn stats_container(&self, container_id: &str) -> Result<ContainerStatsProto>;
    async fn update_container(
        &self,
        container_id: &str,
        resources: ResourceLimitsProto,
    ) -> Result<()>;

    async fn get_oom_event(&self) -> Result<String>;
    async fn get_agent_metrics(&self) -> Result<String>;
    async fn update_runtime_metrics(&self) -> Result<()>;

    /// Yields exactly one error when the sandbox (VM or agent) dies.
    async fn monitor(&self) -> Result<MonitorHandle>;
}

/// The production `AgentClient`: reconnects to `endpoint` for each call.
pub struct RpcAgentClient {
    endpoint: AgentEndpoint,
}

impl RpcAgentClient {
    pub fn new(endpoint: AgentEndpoint) -> Self {
        Self { endpoint }
    }

    async fn open_channel(
        &self,
        container_id: &str,
        process_id: &str,
        channel: IoChannelProto,
    ) -> Result<AgentStream> {
        let mut stream = transport::connect(&self.endpoint).await?;
        let handshake = IoOpenRequest {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
            channel,
        };
        write_frame(&mut stream, &shim_protocol::serialize(&handshake)).await?;
        Ok(stream)
    }
}

#[async_trait]
impl AgentClient for RpcAgentClient {
    async fn create_sandbox(
        &self,
        sandbox_id: &str,
        bundle: &str,
        rootfs: &str,
        oci_spec_json: &str,
        hostname: &str,
        netns: Option<&str>,
    ) -> Result<()> {
        let req = AgentRequest::CreateSandbox(CreateSandboxRequest {
            sandbox_id: sandbox_id.to_string(),
            bundle: bundle.to_string(),
            rootfs: rootfs.to_string(),
            oci_spec_json: oci_spec_json.to_string(),
            hostname: hostname.to_string(),
            network_namespace_path: netns.map(str::to_string),
        });
        match call(&self.endpoint, req).await? {
            AgentResponse::SandboxCreated => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn start_sandbox(&self) -> Result<()> {
        match call(&self.endpoint, AgentRequest::StartSandbox).await? {
            AgentResponse::SandboxStarted => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn stop_sandbox(&self, force: bool) -> Result<()> {
        match call(&self.endpoint, AgentRequest::StopSandbox { force }).await? {
            AgentResponse::SandboxStopped => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn delete_sandbox(&self) -> Result<()> {
        match call(&self.endpoint, AgentRequest::DeleteSandbox).await? {
            AgentResponse::SandboxDeleted => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn create_container(
        &self,
        container_id: &str,
        bundle: &str,
        rootfs: &str,
        oci_spec_json: &str,
        container_type: ContainerTypeProto,
        stdio: StdioConfigProto,
    ) -> Result<()> {
        let req = AgentRequest::CreateContainer(CreateContainerRequest {
            container_id: container_id.to_string(),
            bundle: bundle.to_string(),
            rootfs: rootfs.to_string(),
            oci_spec_json: oci_spec_json.to_string(),
            container_type,
            stdio,
        });
        match call(&self.endpoint, req).await? {
            AgentResponse::ContainerCreated => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let req = AgentRequest::StartContainer { container_id: container_id.to_string() };
        match call(&self.endpoint, req).await? {
            AgentResponse::ContainerStarted => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn stop_container(&self, container_id: &str, force: bool) -> Result<()> {
        let req = AgentRequest::StopContainer { container_id: container_id.to_string(), force };
        match call(&self.endpoint, req).await? {
            AgentResponse::ContainerStopped => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        let req = AgentRequest::DeleteContainer { container_id: container_id.to_string() };
        match call(&self.endpoint, req).await? {
            AgentResponse::ContainerDeleted => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn pause_container(&self, container_id: &str) -> Result<()> {
        let req = AgentRequest::PauseContainer { container_id: container_id.to_string() };
        match call(&self.endpoint, req).await? {
            AgentResponse::ContainerPaused => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn resume_container(&self, container_id: &str) -> Result<()> {
        let req = AgentRequest::ResumeContainer { container_id: container_id.to_string() };
        match call(&self.endpoint, req).await? {
            AgentResponse::ContainerResumed => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn enter_container(
        &self,
        container_id: &str,
        process: ProcessSpecProto,
    ) -> Result<EnterResult> {
        let req = AgentRequest::EnterContainer { container_id: container_id.to_string(), process };
        match call(&self.endpoint, req).await? {
            AgentResponse::ProcessEntered { process_id } => Ok(EnterResult { process_id }),
            other => Err(expect_error(other)),
        }
    }

    async fn signal_process(
        &self,
        container_id: &str,
        process_id: &str,
        signal: u32,
        all: bool,
    ) -> Result<()> {
        let req = AgentRequest::SignalProcess {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
            signal,
            all,
        };
        match call(&self.endpoint, req).await? {
            AgentResponse::Signaled => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn wait_process(&self, container_id: &str, process_id: &str) -> Result<i32> {
        let req = AgentRequest::WaitProcess {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
        };
        match call(&self.endpoint, req).await? {
            AgentResponse::ProcessExited { exit_code } => Ok(exit_code),
            other => Err(expect_error(other)),
        }
    }

    async fn open_io(&self, container_id: &str, process_id: &str) -> Result<ProcessIo> {
        let stdin = self.open_channel(container_id, process_id, IoChannelProto::Stdin).await?;
        let stdout = self.open_channel(container_id, process_id, IoChannelProto::Stdout).await?;
        let stderr = self.open_channel(container_id, process_id, IoChannelProto::Stderr).await?;
        Ok(ProcessIo { stdin: Some(stdin), stdout: Some(stdout), stderr: Some(stderr) })
    }

    async fn winsize(
        &self,
        container_id: &str,
        process_id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<()> {
        let req = AgentRequest::Winsize {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
            rows,
            cols,
        };
        match call(&self.endpoint, req).await? {
            AgentResponse::WinsizeSet => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn status_container(&self, container_id: &str) -> Result<ContainerStatusProto> {
        let req = AgentRequest::StatusContainer { container_id: container_id.to_string() };
        match call(&self.endpoint, req).await? {
            AgentResponse::ContainerStatus(status) => Ok(status),
            other => Err(expect_error(other)),
        }
    }

    async fn stats_container(&self, container_id: &str) -> Result<ContainerStatsProto> {
        let req = AgentRequest::StatsContainer { container_id: container_id.to_string() };
        match call(&self.endpoint, req).await? {
            AgentResponse::ContainerStats(stats) => Ok(*stats),
            other => Err(expect_error(other)),
        }
    }

    async fn update_container(
        &self,
        container_id: &str,
        resources: ResourceLimitsProto,
    ) -> Result<()> {
        let req =
            AgentRequest::UpdateContainer { container_id: container_id.to_string(), resources };
        match call(&self.endpoint, req).await? {
            AgentResponse::ContainerUpdated => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn get_oom_event(&self) -> Result<String> {
        match call(&self.endpoint, AgentRequest::GetOomEvent).await? {
            AgentResponse::OomEvent { container_id } => Ok(container_id),
            AgentResponse::Error { code: AgentStatusCode::Unimplemented, message } => {
                Err(AgentError::new(AgentStatusCode::Unimplemented, message))
            }
            other => Err(expect_error(other)),
        }
    }

    async fn get_agent_metrics(&self) -> Result<String> {
        match call(&self.endpoint, AgentRequest::GetAgentMetrics).await? {
            AgentResponse::AgentMetrics(text) => Ok(text),
            other => Err(expect_error(other)),
        }
    }

    async fn update_runtime_metrics(&self) -> Result<()> {
        match call(&self.endpoint, AgentRequest::UpdateRuntimeMetrics).await? {
            AgentResponse::RuntimeMetricsUpdated => Ok(()),
            other => Err(expect_error(other)),
        }
    }

    async fn monitor(&self) -> Result<MonitorHandle> {
        let mut stream = transport::connect(&self.endpoint).await?;
        write_frame(&mut stream, &shim_protocol::serialize(&AgentRequest::Monitor)).await?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut cancel_rx => {
                    let _ = tx.send(None);
                }
                result = read_frame(&mut stream) => {
                    let reason = match result {
                        Ok(payload) => match shim_protocol::deserialize::<AgentResponse>(&payload) {
                            Ok(AgentResponse::Error { message, .. }) => message,
                            Ok(other) => format!("unexpected monitor frame: {other:?}"),
                            Err(e) => format!("malformed monitor frame: {e}"),
                        },
                        Err(e) => e.to_string(),
                    };
                    let _ = tx.send(Some(reason));
                }
            }
        });
        Ok(MonitorHandle { receiver: rx, cancel: cancel_tx })
    }
}
