//! Git subgraph binary.

use std::sync::Arc;

use devmesh_git::{GitExecutor, GitServiceConfig, SystemGitRunner};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                std::env::var("LOG_LEVEL")
                    .map(|level| format!("devmesh_git={level},tower_http=warn"))
                    .unwrap_or_else(|_| "devmesh_git=info,tower_http=warn".into())
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GitServiceConfig::from_env()?;
    tracing::info!(
        workspace_root = %config.workspace_root.display(),
        addr = %config.bind_addr,
        "starting git subgraph v{}",
        env!("CARGO_PKG_VERSION")
    );

    let runner = Arc::new(SystemGitRunner::new(config.git_binary.clone()));
    let executor = Arc::new(GitExecutor::new(runner, &config.workspace_root)?);
    let schema = Arc::new(devmesh_git::schema::build_schema(
        executor,
        config.history_limit,
    ));

    devmesh_subgraph::serve(schema, config.bind_addr).await?;
    Ok(())
}
