use anyhow::bail;
use artifact_registry::api;
use artifact_registry::config::RegistryConfig;
use artifact_registry::storage;
use artifact_registry::utils::cli::{Args, Command};
use artifact_registry::utils::state::AppState;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.to_config();

    match args.command() {
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::InitDb => {
            validate_database(&config)?;
            storage::connect(&config.database_file).await?;
            tracing::info!("database {} is up to date", config.database_file.display());
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: RegistryConfig) -> anyhow::Result<()> {
    validate_config(&config).await?;

    let pool = storage::connect(&config.database_file).await?;
    let addr = format!("{}:{}", config.host, config.port);
    let sweep_interval = Duration::from_secs(config.sweep_interval_secs);
    let state = Arc::new(AppState::new(config, pool)?);

    let sweeper = state.uploads.clone().spawn_sweeper(sweep_interval);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    sweeper.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
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
                tracing::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down...");
}

fn validate_database(config: &RegistryConfig) -> anyhow::Result<()> {
    if let Some(parent) = config.database_file.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            bail!(
                "The directory for the database `{}` does not exist",
                parent.display()
            );
        }
    }
    Ok(())
}

async fn validate_config(config: &RegistryConfig) -> anyhow::Result<()> {
    let mut validation_errors = Vec::new();

    match tokio::fs::metadata(&config.root_dir).await {
        Ok(meta) => {
            if !meta.is_dir() {
                validation_errors.push(format!(
                    "OCI_REGISTRY_ROOTDIR `{}` exists but is not a directory",
                    config.root_dir.display(),
                ));
            }
        }
        Err(_) => {
            if let Err(e) = tokio::fs::create_dir_all(&config.root_dir).await {
                validation_errors.push(format!(
                    "OCI_REGISTRY_ROOTDIR `{}` does not exist and cannot be created: {e}",
                    config.root_dir.display(),
                ));
            }
        }
    }

    if let Err(e) = validate_database(config) {
        validation_errors.push(e.to_string());
    }

    if let Some(htpasswd) = &config.htpasswd_file {
        if !htpasswd.is_file() {
            validation_errors.push(format!(
                "OCI_REGISTRY_HTPASSWD `{}` is not a readable file",
                htpasswd.display()
            ));
        }
    }

    if !config.registry_url.starts_with("http://") && !config.registry_url.starts_with("https://") {
        validation_errors.push(format!(
            "OCI_REGISTRY_PUBLIC_URL `{}` must start with http:// or https://",
            config.registry_url
        ));
    }

    if config.sweep_interval_secs == 0 || config.request_timeout_secs == 0 {
        validation_errors.push(
            "OCI_REGISTRY_SWEEP_INTERVAL and OCI_REGISTRY_REQUEST_TIMEOUT must be positive".to_string(),
        );
    }

    if !validation_errors.is_empty() {
        for error in &validation_errors {
            tracing::error!("{error}");
        }
        bail!("invalid configuration ({} problem(s))", validation_errors.len());
    }
    Ok(())
}
