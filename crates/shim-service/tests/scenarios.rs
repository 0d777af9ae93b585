use agent_client::fake::FakeAgentClient;
use async_trait::async_trait;
use shim_service::config::RuntimeConfig;
use shim_service::error::StatusCode;
use shim_service::events::{EventPipeline, Publisher, TaskEvent};
use shim_service::model::{ContainerType, StdioPaths};
use shim_service::sandbox_manager::NoopSandboxManager;
use shim_service::task_service::{CreateRequest, ExecRequest};
use shim_service::{new_sandbox, TaskService};
use std::sync::{Arc, Mutex};

struct RecordingPublisher {
    topics: Mutex<Vec<String>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, _event: &TaskEvent) -> std::io::Result<()> {
        self.topics.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}

fn empty_stdio() -> StdioPaths {
    StdioPaths { stdin: None, stdout: None, stderr: None, terminal: false }
}

fn make_service() -> (TaskService, Arc<RecordingPublisher>, Arc<FakeAgentClient>) {
    let (sandbox, exit_queue_rx) = new_sandbox("pod-1", 4242);
    let sandbox = Arc::new(sandbox);
    let agent = Arc::new(FakeAgentClient::new());
    let publisher = Arc::new(RecordingPublisher { topics: Mutex::new(Vec::new()) });
    let events = EventPipeline::spawn(publisher.clone());
    let service = TaskService::new(
        sandbox,
        agent.clone(),
        events,
        Arc::new(NoopSandboxManager),
        RuntimeConfig::default(),
        exit_queue_rx,
    );
    (service, publisher, agent)
}

async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
}

#[tokio::test]
async fn create_start_delete_sandbox_only() {
    let (service, publisher, _agent) = make_service();

    service
        .create(CreateRequest {
            id: "pod-1".into(),
            bundle: "/bundle".into(),
            rootfs: "/rootfs".into(),
            oci_spec_json: "{}".into(),
            container_type: ContainerType::Sandbox,
            stdio: empty_stdio(),
            options_config_path: None,
        })
        .await
        .unwrap();
    service.start("pod-1", "").await.unwrap();
    settle().await;

    service.kill("pod-1", "", 9, false).await.unwrap();
    let exit = service.wait("pod-1", "").await.unwrap();
    assert_eq!(exit, 128 + 9);

    service.delete("pod-1", "").await.unwrap();

    let topics = publisher.topics.lock().unwrap().clone();
    assert_eq!(topics, vec!["tasks/create", "tasks/start", "tasks/exit", "tasks/delete"]);
}

#[tokio::test]
async fn exec_lifecycle_emits_added_then_started_then_exit() {
    let (service, publisher, agent) = make_service();

    service
        .create(CreateRequest {
            id: "pod-1".into(),
            bundle: "/bundle".into(),
            rootfs: "/rootfs".into(),
            oci_spec_json: "{}".into(),
            container_type: ContainerType::Sandbox,
            stdio: empty_stdio(),
            options_config_path: None,
        })
        .await
        .unwrap();
    service.start("pod-1", "").await.unwrap();
    settle().await;

    service
        .exec(ExecRequest {
            container_id: "pod-1".into(),
            exec_id: "e1".into(),
            command: vec!["/bin/true".into()],
            stdio: empty_stdio(),
        })
        .await
        .unwrap();
    service.start("pod-1", "e1").await.unwrap();
    agent.set_exit_code("fake-exec-1", 0);
    settle().await;

    let exit = service.wait("pod-1", "e1").await.unwrap();
    assert_eq!(exit, 0);

    let topics = publisher.topics.lock().unwrap().clone();
    assert!(topics.contains(&"tasks/exec-added".to_string()));
    assert!(topics.contains(&"tasks/exec-started".to_string()));
}

#[tokio::test]
async fn kill_on_already_stopped_process_is_idempotent() {
    let (service, _publisher, agent) = make_service();
    service
        .create(CreateRequest {
            id: "c1".into(),
            bundle: "/b".into(),
            rootfs: "/r".into(),
            oci_spec_json: "{}".into(),
            container_type: ContainerType::PodContainer,
            stdio: empty_stdio(),
            options_config_path: None,
        })
        .await
        .unwrap();
    service.start("c1", "").await.unwrap();
    settle().await;
    service.kill("c1", "", 9, false).await.unwrap();
    service.wait("c1", "").await.unwrap();

    // A second SIGKILL against an already-Stopped process must not touch
    // the agent at all.
    service.kill("c1", "", 9, false).await.unwrap();
    agent.set_exit_code("should-not-matter", 1);
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let (service, _publisher, _agent) = make_service();
    let req = || CreateRequest {
        id: "x".into(),
        bundle: "/b".into(),
        rootfs: "/r".into(),
        oci_spec_json: "{}".into(),
        container_type: ContainerType::PodContainer,
        stdio: empty_stdio(),
        options_config_path: None,
    };
    service.create(req()).await.unwrap();
    let err = service.create(req()).await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::AlreadyExists);
}

#[tokio::test]
async fn blank_id_is_rejected() {
    let (service, _publisher, _agent) = make_service();
    let err = service
        .create(CreateRequest {
            id: "".into(),
            bundle: "/b".into(),
            rootfs: "/r".into(),
            oci_spec_json: "{}".into(),
            container_type: ContainerType::PodContainer,
            stdio: empty_stdio(),
            options_config_path: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "validation error for 'id': ID cannot be blank");
}

#[tokio::test]
async fn concurrent_waiters_observe_the_same_exit_status() {
    let (service, _publisher, agent) = make_service();
    service
        .create(CreateRequest {
            id: "c1".into(),
            bundle: "/b".into(),
            rootfs: "/r".into(),
            oci_spec_json: "{}".into(),
            container_type: ContainerType::PodContainer,
            stdio: empty_stdio(),
            options_config_path: None,
        })
        .await
        .unwrap();
    service.start("c1", "").await.unwrap();
    settle().await;
    agent.kill_sandbox("unused");
    service.kill("c1", "", 15, false).await.unwrap();

    let service = Arc::new(service);
    let a = service.clone();
    let b = service.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { a.wait("c1", "").await.unwrap() }),
        tokio::spawn(async move { b.wait("c1", "").await.unwrap() }),
    );
    assert_eq!(r1.unwrap(), r2.unwrap());
}

#[tokio::test]
async fn sandbox_monitor_death_unmounts_and_does_not_hang_waiters() {
    let (service, _publisher, agent) = make_service();
    service
        .create(CreateRequest {
            id: "pod-1".into(),
            bundle: "/bundle".into(),
            rootfs: "/rootfs".into(),
            oci_spec_json: "{}".into(),
            container_type: ContainerType::Sandbox,
            stdio: empty_stdio(),
            options_config_path: None,
        })
        .await
        .unwrap();
    service.start("pod-1", "").await.unwrap();
    settle().await;

    agent.kill_sandbox("guest crashed");
    settle().await;

    service.kill("pod-1", "", 9, false).await.unwrap();
    let exit = tokio::time::timeout(std::time::Duration::from_secs(2), service.wait("pod-1", ""))
        .await
        .expect("wait must not hang after sandbox monitor death")
        .unwrap();
    assert_eq!(exit, 128 + 9);
}

#[tokio::test]
async fn pause_then_resume_round_trips_container_status() {
    use shim_service::model::ContainerStatus;

    let (service, publisher, _agent) = make_service();
    service
        .create(CreateRequest {
            id: "c1".into(),
            bundle: "/b".into(),
            rootfs: "/r".into(),
            oci_spec_json: "{}".into(),
            container_type: ContainerType::PodContainer,
            stdio: empty_stdio(),
            options_config_path: None,
        })
        .await
        .unwrap();
    service.start("c1", "").await.unwrap();
    settle().await;

    service.pause("c1").await.unwrap();
    let paused = service.state("c1", "").await.unwrap();
    assert_eq!(paused.status, ContainerStatus::Paused);

    service.resume("c1").await.unwrap();
    let running = service.state("c1", "").await.unwrap();
    assert_eq!(running.status, ContainerStatus::Running);

    let topics = publisher.topics.lock().unwrap().clone();
    assert!(topics.contains(&"tasks/paused".to_string()));
    assert!(topics.contains(&"tasks/resumed".to_string()));
}
