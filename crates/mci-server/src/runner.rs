//! Background loop supervisor.
//!
//! The scheduler, dispatcher, monitor and host allocator are independent
//! loops run on the configured interval. Each pass checks the admin
//! service flags first, records its runtime when it completes, and logs
//! its errors without taking the other loops down.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use mci_core::storage::{ServiceFlags, Storage};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::allocator::Allocator;
use crate::dispatch::{HostGateway, TaskRunner};
use crate::env::Env;
use crate::metrics::SharedMetrics;
use crate::monitor::Monitor;
use crate::scheduler::Scheduler;

/// One background loop.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Loop name; used for bookkeeping and service flags.
    fn name(&self) -> &'static str;

    /// One-line description for the CLI.
    fn description(&self) -> &'static str;

    /// Whether the admin flags disable this loop.
    fn disabled(&self, flags: &ServiceFlags) -> bool;

    /// One pass. Returns aggregated error strings; never panics the loop.
    async fn run(&self, env: &Env) -> Vec<String>;
}

/// Queues tasks for execution and requests hosts to run them.
pub struct SchedulerRunner;

#[async_trait]
impl Runner for SchedulerRunner {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn description(&self) -> &'static str {
        "queue tasks for execution and allocate hosts"
    }

    fn disabled(&self, flags: &ServiceFlags) -> bool {
        flags.scheduler_disabled
    }

    async fn run(&self, env: &Env) -> Vec<String> {
        let scheduler = Scheduler::new(env.clone());
        match scheduler.schedule().await {
            Ok(output) => {
                let mut errors = output.errors;
                errors.extend(
                    Allocator::new(env.clone())
                        .allocate(&output.desired_new_hosts)
                        .await,
                );
                errors
            },
            Err(err) => vec![format!("scheduling: {err}")],
        }
    }
}

/// Provisions confirmed hosts so they can take tasks.
pub struct HostInitRunner;

#[async_trait]
impl Runner for HostInitRunner {
    fn name(&self) -> &'static str {
        "hostinit"
    }

    fn description(&self) -> &'static str {
        "initialize newly spawned hosts"
    }

    fn disabled(&self, flags: &ServiceFlags) -> bool {
        flags.hostinit_disabled
    }

    async fn run(&self, env: &Env) -> Vec<String> {
        Allocator::new(env.clone()).provision_ready_hosts().await
    }
}

/// Flags and retires hosts, reconciles reachability, reclaims stale tasks.
pub struct MonitorRunner {
    metrics: SharedMetrics,
}

impl MonitorRunner {
    /// Create the monitor loop.
    #[must_use]
    pub fn new(metrics: SharedMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Runner for MonitorRunner {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn description(&self) -> &'static str {
        "monitor host health and terminate flagged hosts"
    }

    fn disabled(&self, flags: &ServiceFlags) -> bool {
        flags.monitor_disabled
    }

    async fn run(&self, env: &Env) -> Vec<String> {
        Monitor::new(env.clone(), self.metrics.clone()).run().await
    }
}

/// Pairs queued tasks with free hosts and starts agents.
pub struct DispatchRunner {
    gateway: Arc<dyn HostGateway>,
    metrics: SharedMetrics,
}

impl DispatchRunner {
    /// Create the dispatch loop.
    #[must_use]
    pub fn new(gateway: Arc<dyn HostGateway>, metrics: SharedMetrics) -> Self {
        Self { gateway, metrics }
    }
}

#[async_trait]
impl Runner for DispatchRunner {
    fn name(&self) -> &'static str {
        "taskrunner"
    }

    fn description(&self) -> &'static str {
        "dispatch queued tasks onto free hosts"
    }

    fn disabled(&self, flags: &ServiceFlags) -> bool {
        flags.taskrunner_disabled
    }

    async fn run(&self, env: &Env) -> Vec<String> {
        TaskRunner::new(env.clone(), Arc::clone(&self.gateway), self.metrics.clone())
            .run()
            .await
    }
}

/// The standard loop set.
#[must_use]
pub fn default_runners(
    gateway: Arc<dyn HostGateway>,
    metrics: SharedMetrics,
) -> Vec<Arc<dyn Runner>> {
    vec![
        Arc::new(SchedulerRunner),
        Arc::new(DispatchRunner::new(gateway, metrics.clone())),
        Arc::new(MonitorRunner::new(metrics)),
        Arc::new(HostInitRunner),
    ]
}

/// Run every loop on the configured interval until `cancel` fires.
pub async fn run_all(env: Env, runners: Vec<Arc<dyn Runner>>, cancel: CancellationToken) {
    let interval = env.settings.runner.interval;
    let mut join_set = JoinSet::new();

    for runner in runners {
        let env = env.clone();
        let cancel = cancel.clone();
        join_set.spawn(async move {
            info!(runner = runner.name(), "starting background loop");
            loop {
                run_pass(&env, runner.as_ref()).await;
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {},
                }
            }
            info!(runner = runner.name(), "background loop stopped");
        });
    }

    while join_set.join_next().await.is_some() {}
}

/// One pass of one loop: flag check, run, bookkeeping.
async fn run_pass(env: &Env, runner: &dyn Runner) {
    match env.storage.get_service_flags().await {
        Ok(flags) if runner.disabled(&flags) => {
            info!(runner = runner.name(), "service disabled; skipping pass");
            return;
        },
        Ok(_) => {},
        Err(err) => {
            warn!(runner = runner.name(), "reading service flags: {err}");
        },
    }

    let start = Instant::now();
    let errors = runner.run(env).await;
    let runtime = start.elapsed();

    for err in &errors {
        error!(runner = runner.name(), "{err}");
    }
    info!(
        runner = runner.name(),
        runtime_ms = runtime.as_millis() as u64,
        errors = errors.len(),
        "pass complete"
    );
    if let Err(err) = env.storage.set_process_runtime(runner.name(), runtime).await {
        warn!(runner = runner.name(), "recording process runtime: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mci_core::model::{Distro, Task, TaskStatus};
    use mci_core::settings::Settings;

    use super::*;
    use crate::dispatch::NoopHostGateway;
    use crate::metrics::ServerMetrics;

    #[tokio::test]
    async fn test_disabled_service_skips_pass() {
        let env = Env::in_memory(Settings::default());
        env.storage
            .upsert_distro(Distro::new("linux-64", "mock", 10))
            .await
            .unwrap();
        env.storage
            .insert_task(Task::new("t1", "proj", "linux-64"))
            .await
            .unwrap();

        let mut flags = ServiceFlags::default();
        flags.scheduler_disabled = true;
        env.storage.set_service_flags(flags).await.unwrap();

        run_pass(&env, &SchedulerRunner).await;
        // nothing queued because the pass was skipped
        assert!(env.storage.get_task_queue("linux-64").await.unwrap().is_empty());

        // runtimes only recorded for passes that ran
        assert!(env.storage.all_process_runtimes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scheduler_then_dispatch_pass() {
        let env = Env::in_memory(Settings::default());
        env.storage
            .upsert_distro(Distro::new("linux-64", "mock", 10))
            .await
            .unwrap();
        env.storage
            .insert_task(Task::new("t1", "proj", "linux-64"))
            .await
            .unwrap();
        let mut host = mci_core::model::Host::intent("linux-64", "mock");
        host.id = "h1".to_string();
        host.status = mci_core::model::HostStatus::Running;
        env.storage.insert_host(host).await.unwrap();

        let metrics = Arc::new(ServerMetrics::new().unwrap());
        run_pass(&env, &SchedulerRunner).await;
        run_pass(
            &env,
            &DispatchRunner::new(Arc::new(NoopHostGateway), metrics),
        )
        .await;

        let task = env.storage.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Dispatched);

        let runtimes = env.storage.all_process_runtimes().await.unwrap();
        let names: Vec<&str> = runtimes.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"scheduler"));
        assert!(names.contains(&"taskrunner"));
    }

    #[tokio::test]
    async fn test_run_all_stops_on_cancel() {
        let mut settings = Settings::default();
        settings.runner.interval = Duration::from_millis(10);
        let env = Env::in_memory(settings);

        let cancel = CancellationToken::new();
        let metrics = Arc::new(ServerMetrics::new().unwrap());
        let runners = default_runners(Arc::new(NoopHostGateway), metrics);

        let handle = tokio::spawn(run_all(env, runners, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loops should stop promptly")
            .unwrap();
    }
}
