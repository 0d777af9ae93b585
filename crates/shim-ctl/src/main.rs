use clap::{Parser, Subcommand};
use colored::Colorize;
use shim_protocol::{ContainerSnapshot, ContainerStatusProto, ControlRequest, ControlResponse, ExecSnapshot, SandboxSnapshot};
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "shim-ctl")]
#[command(author, version, about = "Inspect a running containerd-shim-kata-v2 sandbox", long_about = None)]
struct Cli {
    /// containerd namespace the sandbox was created in
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Sandbox (pod) id
    #[arg(short, long)]
    id: String,

    /// Control socket path, overriding the namespace/id-derived default
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the sandbox's own pid and container count
    Sandbox {
        #[arg(short, long, default_value = "table")]
        format: String,
    },
    /// List containers attached to the sandbox
    #[command(alias = "ps")]
    Containers {
        #[arg(short, long, default_value = "table")]
        format: String,
    },
    /// List execs running inside a container
    Execs {
        /// Container id
        container_id: String,
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "EXIT")]
    exit_status: String,
    #[tabled(rename = "EXECS")]
    exec_count: usize,
}

#[derive(Tabled)]
struct ExecRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "EXIT CODE")]
    exit_code: i32,
}

fn default_socket(namespace: &str, id: &str) -> PathBuf {
    let run_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/run".to_string());
    PathBuf::from(run_dir).join("containerd-shim").join(namespace).join(format!("{id}.ctl.sock"))
}

async fn call(socket: &PathBuf, request: ControlRequest) -> std::io::Result<ControlResponse> {
    let mut stream = UnixStream::connect(socket).await?;
    let payload = shim_protocol::serialize(&request);
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut response_buf = vec![0u8; len];
    stream.read_exact(&mut response_buf).await?;
    shim_protocol::deserialize(&response_buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let socket = cli.socket.clone().unwrap_or_else(|| default_socket(&cli.namespace, &cli.id));

    let result = match &cli.command {
        Commands::Sandbox { format } => print_sandbox(&socket, format).await,
        Commands::Containers { format } => print_containers(&socket, format).await,
        Commands::Execs { container_id, format } => print_execs(&socket, container_id, format).await,
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

async fn print_sandbox(socket: &PathBuf, format: &str) -> std::io::Result<()> {
    match call(socket, ControlRequest::ListSandbox).await? {
        ControlResponse::Sandbox(snapshot) => {
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&SandboxJson::from(&snapshot))?);
            } else {
                println!("{}: {}", "sandbox".bold(), snapshot.id);
                println!("  shim pid:       {}", snapshot.shim_pid);
                println!("  hypervisor pid: {}", snapshot.hypervisor_pid);
                println!("  containers:     {}", snapshot.container_count);
            }
            Ok(())
        }
        ControlResponse::Error(message) => Err(std::io::Error::new(std::io::ErrorKind::Other, message)),
        other => Err(unexpected(&other)),
    }
}

async fn print_containers(socket: &PathBuf, format: &str) -> std::io::Result<()> {
    match call(socket, ControlRequest::ListContainers).await? {
        ControlResponse::Containers(containers) => {
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&containers)?);
            } else if containers.is_empty() {
                println!("No containers found");
            } else {
                let rows: Vec<ContainerRow> = containers.into_iter().map(container_row).collect();
                println!("{}", Table::new(rows));
            }
            Ok(())
        }
        ControlResponse::Error(message) => Err(std::io::Error::new(std::io::ErrorKind::Other, message)),
        other => Err(unexpected(&other)),
    }
}

async fn print_execs(socket: &PathBuf, container_id: &str, format: &str) -> std::io::Result<()> {
    match call(socket, ControlRequest::ListExecs { container_id: container_id.to_string() }).await? {
        ControlResponse::Execs(execs) => {
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&execs)?);
            } else if execs.is_empty() {
                println!("No execs found");
            } else {
                let rows: Vec<ExecRow> = execs.into_iter().map(exec_row).collect();
                println!("{}", Table::new(rows));
            }
            Ok(())
        }
        ControlResponse::Error(message) => Err(std::io::Error::new(std::io::ErrorKind::Other, message)),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &ControlResponse) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, format!("unexpected control response: {response:?}"))
}

fn container_row(c: ContainerSnapshot) -> ContainerRow {
    ContainerRow {
        id: c.id,
        status: format_status(c.status),
        exit_status: c.exit_status.map(|s| s.to_string()).unwrap_or_default(),
        exec_count: c.exec_count,
    }
}

fn exec_row(e: ExecSnapshot) -> ExecRow {
    ExecRow { id: e.id, status: format_status(e.status), exit_code: e.exit_code }
}

fn format_status(status: ContainerStatusProto) -> String {
    match status {
        ContainerStatusProto::Running => "Running".green().to_string(),
        ContainerStatusProto::Created => "Created".yellow().to_string(),
        ContainerStatusProto::Pausing => "Pausing".yellow().to_string(),
        ContainerStatusProto::Paused => "Paused".blue().to_string(),
        ContainerStatusProto::Stopped => "Stopped".dimmed().to_string(),
        ContainerStatusProto::Unknown => "Unknown".red().to_string(),
    }
}

#[derive(serde::Serialize)]
struct SandboxJson {
    id: String,
    shim_pid: u32,
    hypervisor_pid: u32,
    container_count: usize,
}

impl From<&SandboxSnapshot> for SandboxJson {
    fn from(s: &SandboxSnapshot) -> Self {
        Self { id: s.id.clone(), shim_pid: s.shim_pid, hypervisor_pid: s.hypervisor_pid, container_count: s.container_count }
    }
}
