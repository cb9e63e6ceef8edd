//! Agent subgraph binary.

use std::sync::Arc;
use std::time::Duration;

use devmesh_agent::batch::BatchDispatcher;
use devmesh_agent::cli::ChildProcessLauncher;
use devmesh_agent::prewarm::PreWarmPool;
use devmesh_agent::runs::RunStore;
use devmesh_agent::schema::{build_schema, AgentServices};
use devmesh_agent::{AgentServiceConfig, SessionManager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                std::env::var("LOG_LEVEL")
                    .map(|level| format!("devmesh_agent={level},tower_http=warn"))
                    .unwrap_or_else(|_| "devmesh_agent=info,tower_http=warn".into())
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentServiceConfig::from_env()?;
    tracing::info!(
        addr = %config.bind_addr,
        cli = %config.cli_binary,
        pool_size = config.prewarm_pool_size,
        "starting agent subgraph v{}",
        env!("CARGO_PKG_VERSION")
    );

    let launcher = Arc::new(ChildProcessLauncher::new(
        config.cli_binary.clone(),
        config.cli_args.clone(),
    ));

    let manager = SessionManager::new(config.clone(), launcher.clone());
    let pool = PreWarmPool::new(&config, launcher);
    let maintenance = pool.spawn_maintenance();

    let runs = Arc::new(RunStore::new());
    let batch = BatchDispatcher::new(
        manager.clone(),
        runs.clone(),
        Duration::from_secs(config.batch_cache_ttl_secs),
    );

    let schema = Arc::new(build_schema(AgentServices {
        manager,
        pool,
        runs,
        batch,
        config: config.clone(),
    }));

    let result = devmesh_subgraph::serve(schema, config.bind_addr).await;
    maintenance.abort();
    result?;
    Ok(())
}
