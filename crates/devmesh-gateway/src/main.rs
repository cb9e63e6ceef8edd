//! Gateway binary.

use devmesh_gateway::server::{serve, start_background};
use devmesh_gateway::{GatewayConfig, GatewayState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                std::env::var("LOG_LEVEL")
                    .map(|level| format!("devmesh_gateway={level},tower_http=warn"))
                    .unwrap_or_else(|_| "devmesh_gateway=info,tower_http=warn".into())
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env()?;
    let addr = config.bind_addr;
    tracing::info!(
        %addr,
        subgraphs = config.subgraphs.len(),
        "starting gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let state = GatewayState::new(config);
    let background = start_background(&state).await;

    let result = serve(state, addr).await;
    background.shutdown();
    result?;
    Ok(())
}
