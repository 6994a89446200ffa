// Broker service main entry point.
use anyhow::{Context, Result};
use broker::{config, observability, transport};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("courier-broker");

    let config = config::BrokerConfig::from_env_or_yaml()?;
    let broker = Arc::new(config.build_broker()?);
    tracing::info!(
        server_id = %broker.server_id(),
        auth_required = broker.auth_required(),
        max_payload = config.limits.max_payload,
        "broker started"
    );

    // Expose Prometheus metrics on the configured bind address.
    let metrics_bind = config.metrics_bind;
    let metrics_task = tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics listener exited");
        }
    });

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind client listener {}", config.bind))?;
    tracing::info!(addr = %listener.local_addr()?, "client listener started");

    let accept_task = {
        let broker = Arc::clone(&broker);
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = transport::serve(listener, broker, config).await {
                tracing::warn!(error = %err, "accept loop exited");
            }
        })
    };

    // Block until shutdown so the process stays alive.
    shutdown.await;
    accept_task.abort();
    metrics_task.abort();
    tracing::info!(sessions = broker.session_count(), "broker stopped");
    Ok(())
}
