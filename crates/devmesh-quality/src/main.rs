//! Quality subgraph binary.

use std::net::SocketAddr;
use std::sync::Arc;

use devmesh_quality::schema::build_schema;
use devmesh_quality::QualityStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                std::env::var("LOG_LEVEL")
                    .map(|level| format!("devmesh_quality={level},tower_http=warn"))
                    .unwrap_or_else(|_| "devmesh_quality=info,tower_http=warn".into())
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut addr: SocketAddr = "127.0.0.1:4003".parse()?;
    if let Ok(port) = std::env::var("QUALITY_SERVICE_PORT") {
        addr.set_port(port.parse()?);
    }
    if let Ok(host) = std::env::var("QUALITY_SERVICE_HOST") {
        addr.set_ip(host.parse()?);
    }

    tracing::info!(%addr, "starting quality subgraph v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(QualityStore::new());
    let schema = Arc::new(build_schema(store));
    devmesh_subgraph::serve(schema, addr).await?;
    Ok(())
}
