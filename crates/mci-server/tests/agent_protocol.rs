//! Agent-protocol integration tests against an in-process API server.

use std::net::SocketAddr;
use std::sync::Arc;

use mci_core::model::{Distro, Host, HostStatus, Task, TaskStatus};
use mci_core::queue::TaskQueueItem;
use mci_core::settings::Settings;
use mci_core::storage::Storage;
use mci_core::wire::{
    EndTaskDetail, EndTaskResponse, HeartbeatResponse, NextTaskResponse, HOST_ID_HEADER,
    HOST_SECRET_HEADER, TASK_SECRET_HEADER,
};
use mci_server::api::{self, ApiState};
use mci_server::metrics::ServerMetrics;
use mci_server::Env;

struct Harness {
    env: Env,
    base: String,
    client: reqwest::Client,
}

impl Harness {
    async fn start() -> Self {
        let env = Env::in_memory(Settings::default());
        env.storage
            .upsert_distro(Distro::new("linux-64", "mock", 10))
            .await
            .unwrap();

        let state = Arc::new(ApiState {
            env: env.clone(),
            metrics: Arc::new(ServerMetrics::new().unwrap()),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, api::router(state)).await.unwrap();
        });

        Self {
            env,
            base: format!("http://{addr}/api/2"),
            client: reqwest::Client::new(),
        }
    }

    async fn add_task(&self, id: &str) -> Task {
        let task = Task::new(id, "proj", "linux-64");
        self.env.storage.insert_task(task.clone()).await.unwrap();
        task
    }

    async fn add_host(&self, id: &str) -> Host {
        let mut host = Host::intent("linux-64", "mock");
        host.id = id.to_string();
        host.status = HostStatus::Running;
        self.env.storage.insert_host(host.clone()).await.unwrap();
        host
    }

    async fn queue(&self, ids: &[&str]) {
        let mut items = Vec::new();
        for id in ids {
            let task = self.env.storage.get_task(id).await.unwrap().unwrap();
            items.push(TaskQueueItem::from_task(&task, None));
        }
        self.env
            .storage
            .save_task_queue("linux-64", items)
            .await
            .unwrap();
    }

    fn post(&self, task_id: &str, op: &str, task_secret: &str, host: &Host) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/task/{task_id}/{op}", self.base))
            .header(TASK_SECRET_HEADER, task_secret)
            .header(HOST_ID_HEADER, &host.id)
            .header(HOST_SECRET_HEADER, &host.secret)
    }

    async fn next_task(&self, host: &Host) -> NextTaskResponse {
        self.post("none", "next_task", "", host)
            .json(&serde_json::json!("next"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_happy_path_bind_start_heartbeat_end() {
    let harness = Harness::start().await;
    harness.add_task("t1").await;
    let host = harness.add_host("h1").await;
    harness.queue(&["t1"]).await;

    // bind via next_task
    let bound = harness.next_task(&host).await;
    assert_eq!(bound.task_id.as_deref(), Some("t1"));
    let secret = bound.task_secret.unwrap();

    // start
    let resp = harness
        .post("t1", "start", &secret, &host)
        .json(&serde_json::json!({"pid": 4242}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let stored = harness.env.storage.get_task("t1").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Started);
    let stored_host = harness.env.storage.get_host("h1").await.unwrap().unwrap();
    assert_eq!(stored_host.agent_pid, Some(4242));
    assert_eq!(stored_host.running_task.as_deref(), Some("t1"));

    // heartbeat
    let beat: HeartbeatResponse = harness
        .post("t1", "heartbeat", &secret, &host)
        .json(&serde_json::json!("heartbeat"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!beat.abort);

    // end
    let ended: EndTaskResponse = harness
        .post("t1", "end", &secret, &host)
        .json(&EndTaskDetail::success())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!ended.should_exit);
    assert!(!ended.run_next);

    let stored = harness.env.storage.get_task("t1").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Succeeded);
    let stored_host = harness.env.storage.get_host("h1").await.unwrap().unwrap();
    assert!(stored_host.running_task.is_none());
}

#[tokio::test]
async fn test_end_hands_out_successor_task() {
    let harness = Harness::start().await;
    harness.add_task("t1").await;
    harness.add_task("t2").await;
    let host = harness.add_host("h1").await;
    harness.queue(&["t1", "t2"]).await;

    let bound = harness.next_task(&host).await;
    let secret = bound.task_secret.unwrap();
    harness
        .post("t1", "start", &secret, &host)
        .json(&serde_json::json!({"pid": 1}))
        .send()
        .await
        .unwrap();

    let ended: EndTaskResponse = harness
        .post("t1", "end", &secret, &host)
        .json(&EndTaskDetail::success())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ended.run_next);
    assert_eq!(ended.task_id.as_deref(), Some("t2"));
    assert!(ended.task_secret.is_some());

    let stored_host = harness.env.storage.get_host("h1").await.unwrap().unwrap();
    assert_eq!(stored_host.running_task.as_deref(), Some("t2"));
}

#[tokio::test]
async fn test_abort_flow_heartbeat_then_inactive_end() {
    let harness = Harness::start().await;
    harness.add_task("t2").await;
    let host = harness.add_host("h2").await;
    harness.queue(&["t2"]).await;

    let bound = harness.next_task(&host).await;
    let secret = bound.task_secret.unwrap();
    harness
        .post("t2", "start", &secret, &host)
        .json(&serde_json::json!({"pid": 7}))
        .send()
        .await
        .unwrap();

    // out-of-band abort
    harness.env.storage.set_task_abort("t2").await.unwrap();

    let beat: HeartbeatResponse = harness
        .post("t2", "heartbeat", &secret, &host)
        .json(&serde_json::json!("heartbeat"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(beat.abort);

    // the agent reports end with status undispatched
    let detail = EndTaskDetail {
        status: TaskStatus::Undispatched,
        kind: String::new(),
        description: "aborted by user".to_string(),
        timed_out: false,
    };
    let resp = harness
        .post("t2", "end", &secret, &host)
        .json(&detail)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let stored = harness.env.storage.get_task("t2").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Undispatched);
    assert!(!stored.activated);
    let stored_host = harness.env.storage.get_host("h2").await.unwrap().unwrap();
    assert!(stored_host.running_task.is_none());
}

#[tokio::test]
async fn test_stale_secret_heartbeat_409_without_mutation() {
    let harness = Harness::start().await;
    harness.add_task("t3").await;
    let host = harness.add_host("h3").await;
    harness.queue(&["t3"]).await;

    let bound = harness.next_task(&host).await;
    let old_secret = bound.task_secret.unwrap();

    // simulate crash + re-dispatch: secret rotates
    harness.env.storage.mark_task_undispatched("t3").await.unwrap();
    harness
        .env
        .storage
        .cas_running_task("h3", Some("t3"), None)
        .await
        .unwrap();
    harness
        .env
        .storage
        .mark_task_dispatched("t3", "h3", "rotated-secret")
        .await
        .unwrap();
    let before = harness.env.storage.get_task("t3").await.unwrap().unwrap();

    let resp = harness
        .post("t3", "heartbeat", &old_secret, &host)
        .json(&serde_json::json!("heartbeat"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let after = harness.env.storage.get_task("t3").await.unwrap().unwrap();
    assert_eq!(before.last_heartbeat, after.last_heartbeat);
    assert_eq!(after.status, TaskStatus::Dispatched);
}

#[tokio::test]
async fn test_concurrent_next_task_never_double_binds() {
    let harness = Harness::start().await;
    harness.add_task("t4").await;
    harness.add_task("t5").await;
    let host_a = harness.add_host("ha").await;
    let host_b = harness.add_host("hb").await;
    harness.queue(&["t4", "t5"]).await;

    let (first, second) =
        tokio::join!(harness.next_task(&host_a), harness.next_task(&host_b));

    let mut bound: Vec<String> = [first.task_id, second.task_id]
        .into_iter()
        .flatten()
        .collect();
    bound.sort();
    bound.dedup();
    // exactly one host received t4; the other got t5 or nothing
    assert!(bound.contains(&"t4".to_string()));
    assert_eq!(
        bound.len(),
        bound.iter().collect::<std::collections::HashSet<_>>().len()
    );

    let task = harness.env.storage.get_task("t4").await.unwrap().unwrap();
    let holders = [
        harness.env.storage.get_host("ha").await.unwrap().unwrap(),
        harness.env.storage.get_host("hb").await.unwrap().unwrap(),
    ]
    .into_iter()
    .filter(|h| h.running_task.as_deref() == Some("t4"))
    .count();
    assert_eq!(holders, 1);
    assert_eq!(task.status, TaskStatus::Dispatched);
}

#[tokio::test]
async fn test_end_is_idempotent_over_replay() {
    let harness = Harness::start().await;
    harness.add_task("t6").await;
    let host = harness.add_host("h6").await;
    harness.queue(&["t6"]).await;

    let bound = harness.next_task(&host).await;
    let secret = bound.task_secret.unwrap();
    harness
        .post("t6", "start", &secret, &host)
        .json(&serde_json::json!({"pid": 9}))
        .send()
        .await
        .unwrap();

    let detail = EndTaskDetail {
        status: TaskStatus::Failed,
        kind: "test".to_string(),
        description: "exit 1".to_string(),
        timed_out: false,
    };
    for _ in 0..2 {
        let resp = harness
            .post("t6", "end", &secret, &host)
            .json(&detail)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let stored = harness.env.storage.get_task("t6").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_oversized_test_log_rejected() {
    let harness = Harness::start().await;
    let task = harness.add_task("t7").await;
    let host = harness.add_host("h7").await;

    let big = "x".repeat(17 * 1024 * 1024);
    let body = serde_json::json!({
        "name": "huge",
        "task_id": "t7",
        "lines": [big],
    });
    let resp = harness
        .post("t7", "test_logs", &task.secret, &host)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);
}

#[tokio::test]
async fn test_stale_agent_revision_told_to_exit() {
    let harness = Harness::start().await;
    harness.add_task("t9").await;
    let host = harness.add_host("h9").await;
    harness.queue(&["t9"]).await;

    let bound = harness.next_task(&host).await;
    let secret = bound.task_secret.unwrap();
    harness
        .post("t9", "start", &secret, &host)
        .json(&serde_json::json!({"pid": 11}))
        .send()
        .await
        .unwrap();

    harness
        .env
        .storage
        .set_host_agent_revision("h9", "0.0.1-old")
        .await
        .unwrap();

    let ended: EndTaskResponse = harness
        .post("t9", "end", &secret, &host)
        .json(&EndTaskDetail::success())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ended.should_exit);

    // the finished task still reached its terminal status
    let stored = harness.env.storage.get_task("t9").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn test_decommissioned_host_told_to_exit() {
    let harness = Harness::start().await;
    harness.add_task("t8").await;
    let host = harness.add_host("h8").await;
    harness.queue(&["t8"]).await;

    let bound = harness.next_task(&host).await;
    let secret = bound.task_secret.unwrap();
    harness
        .post("t8", "start", &secret, &host)
        .json(&serde_json::json!({"pid": 3}))
        .send()
        .await
        .unwrap();

    harness
        .env
        .storage
        .set_host_status("h8", HostStatus::Decommissioned)
        .await
        .unwrap();

    let ended: EndTaskResponse = harness
        .post("t8", "end", &secret, &host)
        .json(&EndTaskDetail::success())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ended.should_exit);
    assert!(!ended.run_next);
}
