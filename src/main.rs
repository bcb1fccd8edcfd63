use grid_coordinator::api;
use grid_coordinator::config::GridConfig;
use grid_coordinator::coordinator::service::GridCoordinator;
use grid_coordinator::probe::HttpProbe;
use grid_coordinator::tasks::store::InMemoryTaskStore;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut bind_addr: SocketAddr = DEFAULT_BIND.parse()?;
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("--bind requires <addr:port>"))?;
                bind_addr = value.parse()?;
                i += 2;
            }
            "--config" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("--config requires <path>"))?;
                config_path = Some(PathBuf::from(value));
                i += 2;
            }
            "--help" | "-h" => {
                eprintln!("Usage: {} [--bind <addr:port>] [--config <path.toml>]", args[0]);
                eprintln!("Example: {} --bind 0.0.0.0:8080 --config grid.toml", args[0]);
                return Ok(());
            }
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
            }
        }
    }

    // 1. Configuration:
    let config = match &config_path {
        Some(path) => GridConfig::from_file(path)?,
        None => {
            tracing::info!("No --config given, using defaults");
            GridConfig::default()
        }
    };

    // 2. Coordinator with the standalone task store and HTTP health probes:
    let coordinator = GridCoordinator::new(config, InMemoryTaskStore::new(), Arc::new(HttpProbe::new()));
    coordinator.start();

    // 3. Spawn stats reporter:
    let stats_coordinator = coordinator.clone();
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            interval.tick().await;
            let health = stats_coordinator.get_system_health();
            let balancer = stats_coordinator.get_balancer_stats();
            tracing::info!(
                "Grid stats: {}/{} healthy ({:.1}%, {:?}), {} quarantined, {} selections, {} migrations",
                health.healthy_nodes,
                health.total_nodes,
                health.health_percentage,
                health.system_status,
                health.quarantined_nodes,
                balancer.total_selections,
                balancer.total_migrations
            );
        }
    });

    // 4. Start HTTP server:
    let app = api::router(coordinator.clone());

    tracing::info!("HTTP server listening on {}", bind_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;

    // 5. Stop background work:
    reporter.abort();
    coordinator.shutdown().await;

    Ok(())
}
