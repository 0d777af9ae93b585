//! Bounded event queue, single forwarder, OOM watcher and sandbox-monitor
//! observer (SPEC_FULL.md §4.5).

use crate::model::Sandbox;
use agent_client::{AgentClient, AgentError};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_QUEUE_CAPACITY: usize = 128;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const OOM_POLL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum TaskEvent {
    TaskCreate { container_id: String, bundle: String, rootfs: String, pid: u32 },
    TaskStart { container_id: String, pid: u32 },
    TaskExit { container_id: String, exec_id: String, pid: u32, status: i32, exit_time_unix: u64 },
    TaskDelete { container_id: String, exit_status: u32, exit_time_unix: u64, pid: u32 },
    TaskExecAdded { container_id: String, exec_id: String },
    TaskExecStarted { container_id: String, exec_id: String },
    TaskPaused { container_id: String },
    TaskResumed { container_id: String },
    TaskOOM { container_id: String },
    TaskCheckpointed { container_id: String },
}

impl TaskEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            TaskEvent::TaskCreate { .. } => "tasks/create",
            TaskEvent::TaskStart { .. } => "tasks/start",
            TaskEvent::TaskExit { .. } => "tasks/exit",
            TaskEvent::TaskDelete { .. } => "tasks/delete",
            TaskEvent::TaskExecAdded { .. } => "tasks/exec-added",
            TaskEvent::TaskExecStarted { .. } => "tasks/exec-started",
            TaskEvent::TaskPaused { .. } => "tasks/paused",
            TaskEvent::TaskResumed { .. } => "tasks/resumed",
            TaskEvent::TaskOOM { .. } => "tasks/oom",
            TaskEvent::TaskCheckpointed { .. } => "tasks/checkpointed",
        }
    }
}

/// containerd's event sink, reached through its `publish-binary`
/// mechanism in the real binary; opaque here beyond this contract.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &TaskEvent) -> std::io::Result<()>;
}

pub struct EventPipeline {
    sender: mpsc::Sender<TaskEvent>,
}

impl EventPipeline {
    /// Spawns the single forwarder task and returns a handle producers
    /// can clone freely; the queue itself backpressures at capacity 128.
    pub fn spawn(publisher: Arc<dyn Publisher>) -> Self {
        let (sender, mut receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let topic = event.topic();
                match tokio::time::timeout(PUBLISH_TIMEOUT, publisher.publish(topic, &event)).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!("event publish failed for {topic}: {e}"),
                    Err(_) => log::warn!("event publish timed out for {topic}"),
                }
            }
        });
        Self { sender }
    }

    pub async fn emit(&self, event: TaskEvent) {
        if self.sender.send(event).await.is_err() {
            log::error!("event pipeline forwarder has stopped; dropping event");
        }
    }

    pub fn sender(&self) -> mpsc::Sender<TaskEvent> {
        self.sender.clone()
    }
}

/// Polls `getOOMEvent` in a loop and turns each hit into a `TaskOOM`.
/// Stops permanently once the agent reports the API is unimplemented or
/// the agent connection is gone for good; any other error just backs off.
///
/// For containers created under CRI-O, also drops an `oom` marker file in
/// the container's bundle directory (§6's "persisted state" contract) —
/// CRI-O polls for that file rather than the event stream.
pub async fn run_oom_watcher(
    agent: Arc<dyn AgentClient>,
    events: mpsc::Sender<TaskEvent>,
    sandbox: Arc<Sandbox>,
    oom_marker_dir: String,
) {
    loop {
        match agent.get_oom_event().await {
            Ok(container_id) => {
                mark_oom_if_crio(&sandbox, &container_id, &oom_marker_dir).await;
                if events.send(TaskEvent::TaskOOM { container_id }).await.is_err() {
                    return;
                }
            }
            Err(AgentError { code: shim_protocol::AgentStatusCode::Unimplemented, .. }) => return,
            Err(e) => {
                log::debug!("oom poll failed, retrying: {e}");
                tokio::time::sleep(OOM_POLL_BACKOFF).await;
            }
        }
    }
}

async fn mark_oom_if_crio(sandbox: &Sandbox, container_id: &str, fallback_dir: &str) {
    let registry = sandbox.registry.lock().await;
    let Ok(container) = registry.get(container_id) else { return };
    if !container.is_crio {
        return;
    }
    let bundle = container.bundle.clone();
    drop(registry);

    let marker_dir = if bundle.is_empty() { fallback_dir.to_string() } else { bundle };
    let marker_path = Path::new(&marker_dir).join("oom");
    if let Err(e) = tokio::fs::write(&marker_path, b"").await {
        log::warn!("failed to write oom marker at {}: {e}", marker_path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct RecordingPublisher {
        topics: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, _event: &TaskEvent) -> std::io::Result<()> {
            self.topics.lock().await.push(topic.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_are_forwarded_in_order() {
        let publisher = Arc::new(RecordingPublisher { topics: Mutex::new(Vec::new()) });
        let pipeline = EventPipeline::spawn(publisher.clone());
        pipeline
            .emit(TaskEvent::TaskCreate {
                container_id: "c1".into(),
                bundle: "/b".into(),
                rootfs: "/r".into(),
                pid: 1,
            })
            .await;
        pipeline.emit(TaskEvent::TaskStart { container_id: "c1".into(), pid: 1 }).await;
        pipeline
            .emit(TaskEvent::TaskExit {
                container_id: "c1".into(),
                exec_id: String::new(),
                pid: 1,
                status: 0,
                exit_time_unix: 0,
            })
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let topics = publisher.topics.lock().await;
        assert_eq!(*topics, vec!["tasks/create", "tasks/start", "tasks/exit"]);
    }
}
