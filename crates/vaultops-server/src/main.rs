use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use vaultops_core::{HandlerRegistry, MemoryStore, OperationStore, SqliteStore};
use vaultops_server::server::{
    config::{CliArgs, ServerConfig},
    seed::{load_submissions, load_targets, register_targets, submit_all},
    service::Engine,
    telemetry::init_telemetry,
    vault::HttpVaultApi,
};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let result = run(&config).await;
    if let Err(e) = &result {
        tracing::error!("{e:#}");
    }

    providers.shutdown();
    result
}

async fn run(config: &ServerConfig) -> anyhow::Result<()> {
    let store: Arc<dyn OperationStore> = match &config.database_path {
        Some(path) => Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("failed to open database {}", path.display()))?,
        ),
        None => {
            tracing::warn!("DATABASE_PATH not set; operation state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let vault = HttpVaultApi::new(config.vault_api_token.clone(), config.engine.attempt_timeout)
        .context("failed to build HTTP client")?;
    let registry = HandlerRegistry::with_vault_api(Arc::new(vault));
    let engine = Engine::builder(store, registry)
        .config(config.engine.clone())
        .build();

    if let Some(path) = &config.targets_file {
        let report = register_targets(&engine, load_targets(path)?)?;
        tracing::info!(
            registered = report.registered,
            existing = report.existing,
            updated = report.updated,
            "Loaded targets from {}",
            path.display()
        );
    }

    // Submitting before the dispatcher starts lets the whole batch compete on
    // priority instead of the first entries grabbing every slot.
    if let Some(path) = &config.submit_file {
        let ids = submit_all(&engine, load_submissions(path)?)?;
        tracing::info!("Submitted {} operations from {}", ids.len(), path.display());
    }

    engine.start().await?;

    if config.exit_when_idle {
        tokio::select! {
            res = engine.wait_idle() => {
                res?;
                tracing::info!("All operations settled");
            }
            () = shutdown_signal() => {}
        }
    } else {
        shutdown_signal().await;
    }

    engine.shutdown().await;

    let stats = engine.stats()?;
    tracing::info!(
        pending = stats.pending,
        running = stats.running,
        retrying = stats.retrying,
        succeeded = stats.succeeded,
        failed = stats.failed,
        "Final queue state"
    );
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting vaultops engine with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting vaultops engine with {} workers, {} attempts per operation",
            config.engine.num_workers,
            config.engine.retry.max_attempts
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
