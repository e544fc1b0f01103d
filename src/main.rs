use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use ledgerwatch_analyzer::algo::registry::AlgorithmRegistry;
use ledgerwatch_analyzer::config::Config;
use ledgerwatch_analyzer::db::PgStore;
use ledgerwatch_analyzer::run::orchestrator::Orchestrator;
use ledgerwatch_analyzer::run::store::ResultStore;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Initialize structured logging (set RUST_LOG=info for output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    tracing::info!("LedgerWatch Analyzer starting");

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;
    tracing::info!(
        max_concurrent_runs = config.analysis.max_concurrent_runs,
        "Configuration loaded from {}",
        config_path
    );

    // Create database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;

    tracing::info!("Connected to PostgreSQL");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;

    tracing::info!("Database migrations complete");

    // Algorithm registry is assembled once at startup and read-only after
    let registry = Arc::new(AlgorithmRegistry::builtin());
    tracing::info!(algorithms = ?registry.names(), "Algorithm registry initialized");

    let store: Arc<dyn ResultStore> = Arc::new(PgStore::new(pool));
    let orchestrator = Orchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        config.analysis.clone(),
    );

    // Spawn API server
    if config.api.enabled {
        let registry = Arc::clone(&registry);
        let store = Arc::clone(&store);
        let orchestrator = Arc::clone(&orchestrator);
        let host = config.api.host.clone();
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) =
                ledgerwatch_analyzer::api::serve(registry, store, orchestrator, &host, port).await
            {
                tracing::error!(error = %e, "API server failed");
            }
        });
    }

    tracing::info!("Analyzer started. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, cancelling active runs...");
    orchestrator.shutdown().await;

    tracing::info!("LedgerWatch Analyzer stopped gracefully");
    Ok(())
}
