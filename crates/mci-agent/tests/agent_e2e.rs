//! End-to-end agent tests against an in-process API server.

use std::net::SocketAddr;
use std::sync::Arc;

use mci_agent::{AgentOptions, EXIT_OK, EXIT_WRONG_SECRET};
use mci_core::logmsg::LogChannel;
use mci_core::model::{
    CommandDescriptor, Distro, Host, HostStatus, ProjectConfig, Task, TaskDef, TaskStatus,
};
use mci_core::settings::Settings;
use mci_core::storage::Storage;
use mci_server::api::{self, ApiState};
use mci_server::metrics::ServerMetrics;
use mci_server::Env;
use serde_json::json;

struct Harness {
    env: Env,
    api_server: String,
    _workdir: tempfile::TempDir,
    workdir_path: std::path::PathBuf,
}

impl Harness {
    async fn start(project: ProjectConfig) -> Self {
        let env = Env::in_memory(Settings::default());
        env.storage
            .upsert_distro(Distro::new("linux-64", "mock", 10))
            .await
            .unwrap();
        env.storage.upsert_project(project).await.unwrap();

        let state = Arc::new(ApiState {
            env: env.clone(),
            metrics: Arc::new(ServerMetrics::new().unwrap()),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, api::router(state)).await.unwrap();
        });

        let workdir = tempfile::tempdir().unwrap();
        let workdir_path = workdir.path().to_path_buf();
        Self {
            env,
            api_server: format!("http://{addr}"),
            _workdir: workdir,
            workdir_path,
        }
    }

    /// Seed a dispatched task bound to a running host, the way the
    /// dispatcher records it.
    async fn dispatch(&self, task_name: &str, task_id: &str, host_id: &str) -> AgentOptions {
        let mut task = Task::new(task_id, "proj", "linux-64");
        task.display_name = task_name.to_string();
        self.env.storage.insert_task(task).await.unwrap();

        let mut host = Host::intent("linux-64", "mock");
        host.id = host_id.to_string();
        host.status = HostStatus::Running;
        let host_secret = host.secret.clone();
        self.env.storage.insert_host(host).await.unwrap();

        self.env
            .storage
            .cas_running_task(host_id, None, Some(task_id))
            .await
            .unwrap();
        let dispatched = self
            .env
            .storage
            .mark_task_dispatched(task_id, host_id, "task-secret")
            .await
            .unwrap();

        AgentOptions {
            api_server: self.api_server.clone(),
            task_id: dispatched.id,
            task_secret: dispatched.secret,
            host_id: host_id.to_string(),
            host_secret,
            https_cert: None,
            working_dir: self.workdir_path.clone(),
            pid_file: Some(self.workdir_path.join("agent.pid")),
        }
    }

    async fn task_log_text(&self, task_id: &str) -> String {
        self.env
            .storage
            .get_task_logs(task_id)
            .await
            .unwrap()
            .iter()
            .filter(|m| m.channel == LogChannel::Task)
            .map(|m| m.message.clone())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn shell(script: &str) -> CommandDescriptor {
    CommandDescriptor::new("shell.exec", json!({ "script": script }))
}

fn project_with_task(name: &str, commands: Vec<CommandDescriptor>) -> ProjectConfig {
    ProjectConfig {
        id: "proj".to_string(),
        enabled: true,
        pre: Vec::new(),
        post: Vec::new(),
        tasks: vec![TaskDef {
            name: name.to_string(),
            commands,
        }],
        expansions: std::collections::HashMap::new(),
        vars: std::collections::HashMap::from([(
            "greeting".to_string(),
            "world".to_string(),
        )]),
    }
}

#[tokio::test]
async fn test_happy_path_two_shell_commands() {
    let project = project_with_task(
        "compile",
        vec![shell("echo hello ${greeting}"), shell("exit 0")],
    );
    let harness = Harness::start(project).await;
    let options = harness.dispatch("compile", "t1", "h1").await;

    let code = mci_agent::run(options).await;
    assert_eq!(code, EXIT_OK);

    let task = harness.env.storage.get_task("t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert!(task.time_taken.is_some());

    let host = harness.env.storage.get_host("h1").await.unwrap().unwrap();
    assert!(host.running_task.is_none());
    assert_eq!(host.last_task_completed.as_deref(), Some("t1"));

    let log = harness.task_log_text("t1").await;
    assert!(log.contains("hello world"), "{log}");
}

#[tokio::test]
async fn test_failing_command_fails_the_task() {
    let project = project_with_task("broken", vec![shell("exit 3"), shell("echo never")]);
    let harness = Harness::start(project).await;
    let options = harness.dispatch("broken", "t1", "h1").await;

    let code = mci_agent::run(options).await;
    assert_eq!(code, EXIT_OK);

    let task = harness.env.storage.get_task("t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let log = harness.task_log_text("t1").await;
    assert!(!log.contains("never"), "{log}");
}

#[tokio::test]
async fn test_continue_on_err_keeps_pipeline_alive() {
    let flaky = CommandDescriptor::new(
        "shell.exec",
        json!({ "script": "exit 1", "continue_on_err": true }),
    );
    let project = project_with_task("flaky", vec![flaky, shell("echo recovered")]);
    let harness = Harness::start(project).await;
    let options = harness.dispatch("flaky", "t1", "h1").await;

    let code = mci_agent::run(options).await;
    assert_eq!(code, EXIT_OK);

    let task = harness.env.storage.get_task("t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);

    let log = harness.task_log_text("t1").await;
    assert!(log.contains("recovered"), "{log}");
}

#[tokio::test]
async fn test_wrong_secret_exits_nonzero() {
    let project = project_with_task("compile", vec![shell("true")]);
    let harness = Harness::start(project).await;
    let mut options = harness.dispatch("compile", "t1", "h1").await;
    options.task_secret = "stale-secret".to_string();

    let code = mci_agent::run(options).await;
    assert_eq!(code, EXIT_WRONG_SECRET);

    // no state mutation happened
    let task = harness.env.storage.get_task("t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Dispatched);
}

#[tokio::test]
async fn test_agent_chains_to_next_task() {
    let mut project = project_with_task("compile", vec![shell("echo one")]);
    project.tasks.push(TaskDef {
        name: "compile-2".to_string(),
        commands: vec![shell("echo two")],
    });
    let harness = Harness::start(project).await;
    let options = harness.dispatch("compile", "t1", "h1").await;

    // a second undispatched task waits on the queue
    let mut next = Task::new("t2", "proj", "linux-64");
    next.display_name = "compile-2".to_string();
    harness.env.storage.insert_task(next.clone()).await.unwrap();
    harness
        .env
        .storage
        .save_task_queue(
            "linux-64",
            vec![mci_core::queue::TaskQueueItem::from_task(&next, None)],
        )
        .await
        .unwrap();

    let code = mci_agent::run(options).await;
    assert_eq!(code, EXIT_OK);

    let first = harness.env.storage.get_task("t1").await.unwrap().unwrap();
    let second = harness.env.storage.get_task("t2").await.unwrap().unwrap();
    assert_eq!(first.status, TaskStatus::Succeeded);
    assert_eq!(second.status, TaskStatus::Succeeded);

    let host = harness.env.storage.get_host("h1").await.unwrap().unwrap();
    assert!(host.running_task.is_none());
    assert_eq!(host.last_task_completed.as_deref(), Some("t2"));
}
