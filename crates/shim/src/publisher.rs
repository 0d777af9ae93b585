//! Publishes `TaskEvent`s to containerd's event stream through its
//! `publish-binary` mechanism: the same containerd binary containerd
//! passed us at bootstrap, invoked as a short-lived child per event with
//! the event JSON on stdin, exactly as the `-publish-binary` contract
//! (SPEC_FULL.md §6) specifies.

use async_trait::async_trait;
use serde::Serialize;
use shim_service::events::{Publisher, TaskEvent};
use std::io;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub struct PublishBinaryPublisher {
    publish_binary: String,
    namespace: String,
}

impl PublishBinaryPublisher {
    pub fn new(publish_binary: String, namespace: String) -> Self {
        Self { publish_binary, namespace }
    }
}

#[derive(Serialize)]
struct EventEnvelope<'a> {
    container_id: &'a str,
    exec_id: Option<&'a str>,
    pid: u32,
    status: Option<i32>,
    exit_time_unix: Option<u64>,
}

fn envelope(event: &TaskEvent) -> EventEnvelope<'_> {
    match event {
        TaskEvent::TaskCreate { container_id, pid, .. } => {
            EventEnvelope { container_id, exec_id: None, pid: *pid, status: None, exit_time_unix: None }
        }
        TaskEvent::TaskStart { container_id, pid } => {
            EventEnvelope { container_id, exec_id: None, pid: *pid, status: None, exit_time_unix: None }
        }
        TaskEvent::TaskExit { container_id, exec_id, pid, status, exit_time_unix } => EventEnvelope {
            container_id,
            exec_id: Some(exec_id),
            pid: *pid,
            status: Some(*status),
            exit_time_unix: Some(*exit_time_unix),
        },
        TaskEvent::TaskDelete { container_id, exit_status, exit_time_unix, pid } => EventEnvelope {
            container_id,
            exec_id: None,
            pid: *pid,
            status: Some(*exit_status as i32),
            exit_time_unix: Some(*exit_time_unix),
        },
        TaskEvent::TaskExecAdded { container_id, exec_id } | TaskEvent::TaskExecStarted { container_id, exec_id } => {
            EventEnvelope { container_id, exec_id: Some(exec_id), pid: 0, status: None, exit_time_unix: None }
        }
        TaskEvent::TaskPaused { container_id }
        | TaskEvent::TaskResumed { container_id }
        | TaskEvent::TaskOOM { container_id }
        | TaskEvent::TaskCheckpointed { container_id } => {
            EventEnvelope { container_id, exec_id: None, pid: 0, status: None, exit_time_unix: None }
        }
    }
}

#[async_trait]
impl Publisher for PublishBinaryPublisher {
    async fn publish(&self, topic: &str, event: &TaskEvent) -> io::Result<()> {
        let body = serde_json::to_vec(&envelope(event))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut child = Command::new(&self.publish_binary)
            .args(["publish", "--namespace", &self.namespace, "--topic", topic])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&body).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("publish-binary exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr)),
            ));
        }
        Ok(())
    }
}
