//! Wire envelopes for the three local RPC surfaces this repository owns:
//! the shim-to-agent protocol (`AgentRequest`/`AgentResponse`), the
//! containerd-to-shim task protocol (`TaskRequest`/`TaskResponse`), and
//! the shim-to-shim-ctl debug protocol (`ControlRequest`/`ControlResponse`).
//!
//! All three are bincode-encoded and length-prefixed by the transport
//! layer that uses them; this crate only defines the envelopes
//! themselves. The real containerd task v2 shim speaks ttrpc framing
//! `config.json`/protobuf messages; this workspace does not depend on a
//! generated containerd-proto client, so `TaskRequest`/`TaskResponse`
//! carry the same method surface and fields over the same bincode
//! framing every other local socket in this repository uses.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize)]
pub enum AgentRequest {
    CreateSandbox(CreateSandboxRequest),
    StartSandbox,
    StopSandbox { force: bool },
    DeleteSandbox,
    CreateContainer(CreateContainerRequest),
    StartContainer { container_id: String },
    StopContainer { container_id: String, force: bool },
    DeleteContainer { container_id: String },
    PauseContainer { container_id: String },
    ResumeContainer { container_id: String },
    EnterContainer { container_id: String, process: ProcessSpecProto },
    SignalProcess { container_id: String, process_id: String, signal: u32, all: bool },
    WaitProcess { container_id: String, process_id: String },
    Winsize { container_id: String, process_id: String, rows: u16, cols: u16 },
    StatusContainer { container_id: String },
    StatsContainer { container_id: String },
    UpdateContainer { container_id: String, resources: ResourceLimitsProto },
    GetOomEvent,
    GetAgentMetrics,
    UpdateRuntimeMetrics,
    /// Opens a long-lived connection that the agent holds open until the
    /// sandbox dies, at which point it sends one `AgentResponse::Error`
    /// frame describing why and closes the stream.
    Monitor,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum AgentResponse {
    SandboxCreated,
    SandboxStarted,
    SandboxStopped,
    SandboxDeleted,
    ContainerCreated,
    ContainerStarted,
    ContainerStopped,
    ContainerDeleted,
    ContainerPaused,
    ContainerResumed,
    ProcessEntered { process_id: String },
    Signaled,
    ProcessExited { exit_code: i32 },
    WinsizeSet,
    ContainerStatus(ContainerStatusProto),
    ContainerStats(Box<ContainerStatsProto>),
    ContainerUpdated,
    OomEvent { container_id: String },
    AgentMetrics(String),
    RuntimeMetricsUpdated,
    Error { code: AgentStatusCode, message: String },
}

/// gRPC-style status codes the agent client maps onto `ShimError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatusCode {
    NotFound,
    AlreadyExists,
    Unimplemented,
    Unavailable,
    InvalidArgument,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ContainerTypeProto {
    #[default]
    PodContainer,
    Sandbox,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub sandbox_id: String,
    pub bundle: String,
    pub rootfs: String,
    pub oci_spec_json: String,
    pub hostname: String,
    pub network_namespace_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub container_id: String,
    pub bundle: String,
    pub rootfs: String,
    pub oci_spec_json: String,
    pub container_type: ContainerTypeProto,
    pub stdio: StdioConfigProto,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StdioConfigProto {
    pub terminal: bool,
    pub stdin_path: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProcessSpecProto {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    pub capabilities_drop: Vec<String>,
    pub no_new_privileges: bool,
    pub stdio: StdioConfigProto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ContainerStatusProto {
    #[default]
    Created,
    Running,
    Pausing,
    Paused,
    Stopped,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceLimitsProto {
    pub cpu: Option<f64>,
    pub memory: Option<u64>,
    pub memory_swap: Option<u64>,
    pub pids: Option<i64>,
    pub blkio_weight: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContainerStatsProto {
    pub container_id: String,
    pub timestamp: u64,
    pub cpu: CpuMetricsProto,
    pub memory: MemoryMetricsProto,
    pub blkio: BlkioMetricsProto,
    pub network: NetworkMetricsProto,
    pub pids: PidsMetricsProto,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CpuMetricsProto {
    pub usage_total: u64,
    pub usage_user: u64,
    pub usage_system: u64,
    pub throttled_periods: u64,
    pub throttled_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryMetricsProto {
    pub usage: u64,
    pub limit: u64,
    pub cache: u64,
    pub rss: u64,
    pub swap: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlkioMetricsProto {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkMetricsProto {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PidsMetricsProto {
    pub current: u64,
    pub limit: u64,
}

/// Read-only debug protocol between `shim-ctl` and a running shim's control socket.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlRequest {
    ListSandbox,
    ListContainers,
    ListExecs { container_id: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    Sandbox(SandboxSnapshot),
    Containers(Vec<ContainerSnapshot>),
    Execs(Vec<ExecSnapshot>),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSnapshot {
    pub id: String,
    pub hypervisor_pid: u32,
    pub shim_pid: u32,
    pub container_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub id: String,
    pub status: ContainerStatusProto,
    pub exit_status: Option<u32>,
    pub exec_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSnapshot {
    pub id: String,
    pub status: ContainerStatusProto,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnnotationMap(pub HashMap<String, String>);

/// First frame sent on a freshly connected I/O stream; everything after
/// it is raw bytes copied verbatim in the direction the channel implies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoOpenRequest {
    pub container_id: String,
    pub process_id: String,
    pub channel: IoChannelProto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoChannelProto {
    Stdin,
    Stdout,
    Stderr,
}

pub fn serialize<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("wire envelopes are always serializable")
}

pub fn deserialize<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, Box<dyn std::error::Error>> {
    Ok(bincode::deserialize(data)?)
}

/// The containerd task v2 shim contract (SPEC_FULL.md §6), addressed by
/// `{id, exec_id}` everywhere; a blank `exec_id` means "the container init".
#[derive(Debug, Serialize, Deserialize)]
pub enum TaskRequest {
    Create(CreateTaskRequestProto),
    Start { id: String, exec_id: String },
    Delete { id: String, exec_id: String },
    Exec(ExecTaskRequestProto),
    ResizePty { id: String, exec_id: String, rows: u16, cols: u16 },
    State { id: String, exec_id: String },
    Pause { id: String },
    Resume { id: String },
    Kill { id: String, exec_id: String, signal: u32, all: bool },
    Pids { id: String },
    CloseIo { id: String, exec_id: String },
    Checkpoint { id: String },
    Connect,
    Shutdown,
    Stats { id: String },
    Update { id: String, resources: ResourceLimitsProto },
    Wait { id: String, exec_id: String },
    Cleanup { id: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskRequestProto {
    pub id: String,
    pub bundle: String,
    pub rootfs: String,
    pub oci_spec_json: String,
    pub container_type: ContainerTypeProto,
    pub stdio: StdioConfigProto,
    pub options_config_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecTaskRequestProto {
    pub container_id: String,
    pub exec_id: String,
    pub command: Vec<String>,
    pub stdio: StdioConfigProto,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateProto {
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

#[derive(Debug, Serialize, Deserialize)]
pub enum TaskResponse {
    Created,
    Started { pid: u32 },
    Deleted { exit_status: u32, exit_time_unix: u64, pid: u32 },
    ExecAdded,
    ResizePtyDone,
    State(StateProto),
    Paused,
    Resumed,
    Killed,
    Pids(Vec<u32>),
    IoClosed,
    /// Returns `should_exit`: whether the shim process should terminate
    /// after replying (see `TaskService::shutdown`).
    ShutdownAck { should_exit: bool },
    Connected { shim_pid: u32, task_pid: u32 },
    Stats(Box<ContainerStatsProto>),
    Updated,
    Waited { exit_status: i32 },
    CleanedUp { exit_code: i32 },
    /// Shares `AgentStatusCode` with the agent-facing surface: both are
    /// gRPC-style status codes over the same local bincode framing.
    Error { code: AgentStatusCode, message: String },
}
