use std::{sync::Arc, time::Duration};

use anyhow::Context;
use kiln_agent::{
    DirectoryLocator, JsonFileStore, Outcome, Supervisor, SupervisorConfig, error::format_error_chain,
    platform_control,
};
use kiln_process::SupervisorEvent;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

async fn run() -> anyhow::Result<()> {
    let config = SupervisorConfig::from_env();
    let instances_dir = config.instances_dir();
    tokio::fs::create_dir_all(&instances_dir)
        .await
        .with_context(|| format!("create {}", instances_dir.display()))?;
    tracing::info!(
        data_root = %config.data_root.display(),
        java = %config.java_command,
        "kiln-agent starting"
    );

    let supervisor = Supervisor::new(
        config,
        Arc::new(JsonFileStore::new(&instances_dir)),
        Arc::new(DirectoryLocator::new(&instances_dir)),
        platform_control(),
    );

    let mut events = supervisor.subscribe().await;
    tokio::spawn(async move {
        while let Some(ev) = events.recv().await {
            match ev {
                SupervisorEvent::Output(batch) => {
                    for line in batch.text.lines() {
                        tracing::info!(instance_id = %batch.instance_id, stream = ?batch.stream, "{line}");
                    }
                }
                SupervisorEvent::Exited {
                    instance_id,
                    exit_code,
                    unexpected,
                } => tracing::info!(%instance_id, ?exit_code, unexpected, "worker exited"),
            }
        }
    });

    let poller = supervisor.clone();
    tokio::spawn(async move {
        loop {
            let outcome = Outcome::from(poller.list().await);
            match serde_json::to_string(&outcome) {
                Ok(json) => tracing::debug!(instances = %json, "reconciled"),
                Err(e) => tracing::warn!(error = %e, "failed to encode instance list"),
            }
            tokio::time::sleep(RECONCILE_INTERVAL).await;
        }
    });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!(tracked = ?supervisor.tracked().await, "shutting down; stopping tracked workers");
    supervisor.stop_all().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %format_error_chain(&e), "kiln-agent failed");
        std::process::exit(1);
    }
}
