use identity_service::{config::IdentityConfig, Collaborators, IdentityCore};
use service_core::observability::init_tracing;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    let http = reqwest::Client::builder()
        .timeout(config.providers.call_timeout())
        .user_agent(concat!("identity-service/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(anyhow::Error::from)?;

    let core = IdentityCore::builder(Collaborators::network(http))
        .token_policy(config.tokens.policy())
        .call_timeout(config.providers.call_timeout())
        .build()
        .await?;

    let handles = core.spawn_background(
        config.tokens.sweep_interval(),
        config.providers.group_refresh_interval(),
    );
    tracing::info!(
        sweep_interval_secs = config.tokens.sweep_interval_seconds,
        group_refresh_interval_secs = config.providers.group_refresh_interval_seconds,
        "Background tasks started"
    );

    shutdown_signal().await;

    for handle in handles {
        handle.abort();
    }
    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
