//! Connector entry point.

use connector_service::config::ConnectorConfig;
use connector_service::metrics::init_metrics;
use connector_service::startup::Application;

use service_core::observability::init_tracing;
use tokio::signal;
use tokio_util::sync::CancellationToken;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping connector");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    let config = ConnectorConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )
    .map_err(|e| std::io::Error::other(format!("Tracing setup error: {}", e)))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.environment,
        "Starting connector-service"
    );

    init_metrics();

    // The access key stays out of the log.
    tracing::info!(
        server_url = %config.server.url,
        destination = %config.name,
        kind = %config.kind,
        endpoint = %config.endpoint_addr,
        metrics_addr = %config.metrics_addr,
        destination_sync_secs = config.destination_sync_interval.as_secs(),
        "Configuration loaded"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build connector");
        std::io::Error::other(format!("Connector build error: {}", e))
    })?;

    let cancel = CancellationToken::new();
    let run = tokio::spawn(app.run_until_stopped(cancel.clone()));

    let stopper = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stopper.cancel();
    });

    match run.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Connector error");
            return Err(std::io::Error::other(e.to_string()));
        }
        Err(e) => {
            tracing::error!(error = %e, "Connector task panicked");
            return Err(std::io::Error::other(e.to_string()));
        }
    }

    tracing::info!("Connector shutdown complete");
    Ok(())
}
