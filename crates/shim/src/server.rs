//! The long-running server process: reconstructs the listening sockets
//! `bootstrap` handed it on fixed fds, wires a [`shim_service::TaskService`]
//! against a real [`agent_client::client::RpcAgentClient`], and serves
//! the containerd task RPC surface and the read-only debug surface side
//! by side over the same bincode framing `agent-client` uses.

use crate::bootstrap::{listener_from_fd, CONTROL_FD_NO, TASK_FD_NO};
use crate::publisher::PublishBinaryPublisher;
use crate::Cli;
use agent_client::client::RpcAgentClient;
use agent_client::{AgentClient, AgentEndpoint};
use clap::Parser;
use shim_protocol::{
    AgentStatusCode, ContainerTypeProto, ControlRequest, ControlResponse, ExecTaskRequestProto, StateProto,
    TaskRequest, TaskResponse,
};
use shim_service::config::RuntimeConfig;
use shim_service::error::{ShimError, StatusCode};
use shim_service::events::EventPipeline;
use shim_service::model::{ContainerType, StdioPaths};
use shim_service::sandbox_manager::NoopSandboxManager;
use shim_service::task_service::{CreateRequest, ExecRequest, StateSnapshot};
use shim_service::{new_sandbox, TaskService};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Runs the shim with `worker_threads(2)`, the Rust analogue of the
/// bootstrap contract's `GOMAXPROCS`-equivalent=2 (SPEC_FULL.md §6).
pub fn run_inherited() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.debug { "debug" } else { "info" }),
    )
    .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build the shim's tokio runtime");
    runtime.block_on(serve(cli));
}

async fn serve(cli: Cli) {
    let config = RuntimeConfig::resolve(None, None).unwrap_or_else(|e| {
        log::warn!("runtime config resolution failed, using defaults: {e}");
        RuntimeConfig::default()
    });

    let agent_socket = format!("/run/containerd-shim/{}/{}.agent.sock", cli.namespace, cli.id);
    let agent: Arc<dyn AgentClient> = Arc::new(RpcAgentClient::new(AgentEndpoint::unix(agent_socket)));

    let publisher = Arc::new(PublishBinaryPublisher::new(cli.publish_binary.clone(), cli.namespace.clone()));
    let events = EventPipeline::spawn(publisher);

    // Launching and supervising the hypervisor itself is out of scope
    // (SPEC_FULL.md §1); until a real driver is wired in behind
    // `SandboxManager`, the shim's own pid stands in for the task pid
    // every `TaskService` method reports.
    let hypervisor_pid = std::process::id();
    let (sandbox, exit_queue_rx) = new_sandbox(cli.id.clone(), hypervisor_pid);
    let sandbox = Arc::new(sandbox);
    let service =
        Arc::new(TaskService::new(sandbox, agent, events, Arc::new(NoopSandboxManager), config, exit_queue_rx));

    let shutdown_watcher = {
        let service = service.clone();
        tokio::spawn(async move {
            service.wait_for_shutdown().await;
            log::info!("shutdown requested with an empty registry, exiting");
            std::process::exit(0);
        })
    };

    let task_listener = listener_from_fd(TASK_FD_NO);
    let control_listener = listener_from_fd(CONTROL_FD_NO);
    let control_service = service.clone();

    let task_server = tokio::spawn(accept_task_loop(task_listener, service));
    let control_server = tokio::spawn(accept_control_loop(control_listener, control_service));

    tokio::select! {
        _ = task_server => {}
        _ = control_server => {}
        _ = shutdown_watcher => {}
    }
}

async fn read_frame(stream: &mut UnixStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

async fn accept_task_loop(listener: UnixListener, service: Arc<TaskService>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("task socket accept failed: {e}");
                continue;
            }
        };
        let service = service.clone();
        tokio::spawn(async move { handle_task_connection(stream, service).await });
    }
}

async fn handle_task_connection(mut stream: UnixStream, service: Arc<TaskService>) {
    loop {
        let payload = match read_frame(&mut stream).await {
            Ok(p) => p,
            Err(_) => return,
        };
        let request: TaskRequest = match shim_protocol::deserialize(&payload) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("malformed task request: {e}");
                return;
            }
        };
        let response = dispatch_task(&service, request).await;
        if write_frame(&mut stream, &shim_protocol::serialize(&response)).await.is_err() {
            return;
        }
    }
}

fn status_to_agent_code(code: StatusCode) -> AgentStatusCode {
    match code {
        StatusCode::InvalidArgument => AgentStatusCode::InvalidArgument,
        StatusCode::NotFound => AgentStatusCode::NotFound,
        StatusCode::AlreadyExists => AgentStatusCode::AlreadyExists,
        StatusCode::Unimplemented => AgentStatusCode::Unimplemented,
        StatusCode::Unavailable => AgentStatusCode::Unavailable,
        StatusCode::Internal => AgentStatusCode::Internal,
    }
}

fn error_response(err: ShimError) -> TaskResponse {
    let code = status_to_agent_code(err.status_code());
    TaskResponse::Error { code, message: err.to_string() }
}

fn state_to_proto(s: StateSnapshot) -> StateProto {
    StateProto {
        id: s.id,
        bundle: s.bundle,
        pid: s.pid,
        status: s.status,
        stdin: s.stdin,
        stdout: s.stdout,
        stderr: s.stderr,
        terminal: s.terminal,
        exit_status: s.exit_status,
    }
}

async fn dispatch_task(service: &TaskService, request: TaskRequest) -> TaskResponse {
    match request {
        TaskRequest::Create(req) => {
            let create = CreateRequest {
                id: req.id,
                bundle: req.bundle,
                rootfs: req.rootfs,
                oci_spec_json: req.oci_spec_json,
                container_type: match req.container_type {
                    ContainerTypeProto::Sandbox => ContainerType::Sandbox,
                    ContainerTypeProto::PodContainer => ContainerType::PodContainer,
                },
                stdio: StdioPaths {
                    stdin: req.stdio.stdin_path,
                    stdout: req.stdio.stdout_path,
                    stderr: req.stdio.stderr_path,
                    terminal: req.stdio.terminal,
                },
                options_config_path: req.options_config_path,
            };
            match service.create(create).await {
                Ok(()) => TaskResponse::Created,
                Err(e) => error_response(e),
            }
        }
        TaskRequest::Start { id, exec_id } => match service.start(&id, &exec_id).await {
            Ok(pid) => TaskResponse::Started { pid },
            Err(e) => error_response(e),
        },
        TaskRequest::Delete { id, exec_id } => match service.delete(&id, &exec_id).await {
            Ok((exit_status, exit_time_unix)) => {
                TaskResponse::Deleted { exit_status, exit_time_unix, pid: 0 }
            }
            Err(e) => error_response(e),
        },
        TaskRequest::Exec(ExecTaskRequestProto { container_id, exec_id, command, stdio }) => {
            let req = ExecRequest {
                container_id,
                exec_id,
                command,
                stdio: StdioPaths {
                    stdin: stdio.stdin_path,
                    stdout: stdio.stdout_path,
                    stderr: stdio.stderr_path,
                    terminal: stdio.terminal,
                },
            };
            match service.exec(req).await {
                Ok(()) => TaskResponse::ExecAdded,
                Err(e) => error_response(e),
            }
        }
        TaskRequest::ResizePty { id, exec_id, rows, cols } => {
            match service.resize_pty(&id, &exec_id, rows, cols).await {
                Ok(()) => TaskResponse::ResizePtyDone,
                Err(e) => error_response(e),
            }
        }
        TaskRequest::State { id, exec_id } => match service.state(&id, &exec_id).await {
            Ok(snapshot) => TaskResponse::State(state_to_proto(snapshot)),
            Err(e) => error_response(e),
        },
        TaskRequest::Pause { id } => match service.pause(&id).await {
            Ok(()) => TaskResponse::Paused,
            Err(e) => error_response(e),
        },
        TaskRequest::Resume { id } => match service.resume(&id).await {
            Ok(()) => TaskResponse::Resumed,
            Err(e) => error_response(e),
        },
        TaskRequest::Kill { id, exec_id, signal, all } => match service.kill(&id, &exec_id, signal, all).await {
            Ok(()) => TaskResponse::Killed,
            Err(e) => error_response(e),
        },
        TaskRequest::Pids { id } => match service.pids(&id).await {
            Ok(pids) => TaskResponse::Pids(pids),
            Err(e) => error_response(e),
        },
        TaskRequest::CloseIo { id, exec_id } => match service.close_io(&id, &exec_id).await {
            Ok(()) => TaskResponse::IoClosed,
            Err(e) => error_response(e),
        },
        TaskRequest::Checkpoint { .. } => match service.checkpoint().await {
            Ok(()) => TaskResponse::Updated,
            Err(e) => error_response(e),
        },
        TaskRequest::Connect => {
            let (shim_pid, task_pid) = service.connect().await;
            TaskResponse::Connected { shim_pid, task_pid }
        }
        TaskRequest::Shutdown => TaskResponse::ShutdownAck { should_exit: service.shutdown().await },
        TaskRequest::Stats { id } => match service.stats(&id).await {
            Ok(stats) => TaskResponse::Stats(Box::new(stats)),
            Err(e) => error_response(e),
        },
        TaskRequest::Update { id, resources } => match service.update(&id, resources).await {
            Ok(()) => TaskResponse::Updated,
            Err(e) => error_response(e),
        },
        TaskRequest::Wait { id, exec_id } => match service.wait(&id, &exec_id).await {
            Ok(exit_status) => TaskResponse::Waited { exit_status },
            Err(e) => error_response(e),
        },
        TaskRequest::Cleanup { id } => match service.cleanup(&id).await {
            Ok(exit_code) => TaskResponse::CleanedUp { exit_code },
            Err(e) => error_response(e),
        },
    }
}

async fn accept_control_loop(listener: UnixListener, service: Arc<TaskService>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("control socket accept failed: {e}");
                continue;
            }
        };
        let service = service.clone();
        tokio::spawn(async move { handle_control_connection(stream, service).await });
    }
}

async fn handle_control_connection(mut stream: UnixStream, service: Arc<TaskService>) {
    loop {
        let payload = match read_frame(&mut stream).await {
            Ok(p) => p,
            Err(_) => return,
        };
        let request: ControlRequest = match shim_protocol::deserialize(&payload) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("malformed control request: {e}");
                return;
            }
        };

        let response = match request {
            ControlRequest::ListSandbox => ControlResponse::Sandbox(service.sandbox_snapshot().await),
            ControlRequest::ListContainers => {
                ControlResponse::Containers(service.container_snapshots().await)
            }
            ControlRequest::ListExecs { container_id } => match service.exec_snapshots(&container_id).await {
                Ok(execs) => ControlResponse::Execs(execs),
                Err(e) => ControlResponse::Error(e.to_string()),
            },
        };
        if write_frame(&mut stream, &shim_protocol::serialize(&response)).await.is_err() {
            return;
        }
    }
}
