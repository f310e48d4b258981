//! `mci service` - the long-running processes.

use std::sync::Arc;

use anyhow::{Context, Result};
use mci_core::settings::Settings;
use mci_server::api::{self, ApiState};
use mci_server::dispatch::SshHostGateway;
use mci_server::metrics::ServerMetrics;
use mci_server::{runner, Env};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::build_env;

fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        let (Ok(mut interrupt), Ok(mut terminate)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            tracing::warn!("could not install shutdown signal handlers");
            return;
        };
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
        trigger.cancel();
    });
    cancel
}

fn runners(env: &Env, metrics: Arc<ServerMetrics>) -> Vec<Arc<dyn runner::Runner>> {
    let agent_path = format!(
        "{}/mci",
        env.settings.taskrunner.agent_executables_dir.trim_end_matches('/')
    );
    runner::default_runners(Arc::new(SshHostGateway::new(agent_path)), metrics)
}

/// `mci service runner`: the background loops.
pub async fn runner(settings: Settings) -> Result<()> {
    let env = build_env(settings);
    let metrics = Arc::new(ServerMetrics::new().context("building metrics")?);
    let cancel = shutdown_token();

    info!("starting background loops");
    runner::run_all(env.clone(), runners(&env, metrics), cancel).await;
    Ok(())
}

/// `mci service web`: the agent-facing API server.
pub async fn web(settings: Settings) -> Result<()> {
    let env = build_env(settings);
    let metrics = Arc::new(ServerMetrics::new().context("building metrics")?);
    let cancel = shutdown_token();

    let addr = env.settings.api.listen_addr.clone();
    let state = Arc::new(ApiState {
        env,
        metrics,
    });
    api::serve(state, &addr, cancel)
        .await
        .context("API server failed")?;
    Ok(())
}

/// `mci service all`: loops and API sharing one environment, for
/// single-node deployments.
pub async fn all(settings: Settings) -> Result<()> {
    let env = build_env(settings);
    let metrics = Arc::new(ServerMetrics::new().context("building metrics")?);
    let cancel = shutdown_token();

    let addr = env.settings.api.listen_addr.clone();
    let state = Arc::new(ApiState {
        env: env.clone(),
        metrics: Arc::clone(&metrics),
    });

    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move { api::serve(state, &addr, api_cancel).await });

    runner::run_all(env.clone(), runners(&env, metrics), cancel).await;
    api_handle.await?.context("API server failed")?;
    Ok(())
}
