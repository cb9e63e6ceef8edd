//! Periodic supergraph composition from live subgraph SDL.
//!
//! On every pass the composer fetches `{ _service { sdl } }` from each
//! registered subgraph and recomposes. A failed pass (fetch or
//! composition) keeps the last good supergraph and surfaces the error
//! on the health endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devmesh_error::{DevmeshError, Result};
use devmesh_graphql::request::{GraphQLRequest, GraphQLResponse};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::SubgraphEndpoint;
use crate::supergraph::{SubgraphHealth, Supergraph};

/// Composition state shared with the health endpoint.
#[derive(Debug, Default)]
struct ComposerState {
    supergraph:      Option<Arc<Supergraph>>,
    last_error:      Option<String>,
    last_success_at: Option<DateTime<Utc>>,
    subgraph_health: Vec<SubgraphHealth>,
}

/// Fetches SDL and owns the current supergraph.
pub struct Composer {
    subgraphs: Vec<SubgraphEndpoint>,
    client:    reqwest::Client,
    state:     RwLock<ComposerState>,
}

impl Composer {
    /// Create a composer over the registered subgraphs.
    #[must_use]
    pub fn new(subgraphs: Vec<SubgraphEndpoint>, fetch_timeout: Duration) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            subgraphs,
            client,
            state: RwLock::new(ComposerState::default()),
        })
    }

    /// The current supergraph, if any composition has succeeded.
    #[must_use]
    pub fn supergraph(&self) -> Option<Arc<Supergraph>> {
        self.state.read().supergraph.clone()
    }

    /// The current supergraph or a `SUBGRAPH_UNAVAILABLE` error when
    /// none has composed yet.
    ///
    /// # Errors
    ///
    /// Returns an error before the first successful composition.
    pub fn require_supergraph(&self) -> Result<Arc<Supergraph>> {
        self.supergraph().ok_or_else(|| {
            DevmeshError::subgraph_unavailable("*", "no supergraph composed yet")
        })
    }

    /// Composition status for `/health`.
    #[must_use]
    pub fn health(&self) -> Value {
        let state = self.state.read();
        serde_json::json!({
            "composed": state.supergraph.is_some(),
            "lastSuccessAt": state.last_success_at.map(|t| t.to_rfc3339()),
            "compositionError": state.last_error,
        })
    }

    /// Per-subgraph reachability for `/services`.
    #[must_use]
    pub fn services(&self) -> Vec<SubgraphHealth> {
        let state = self.state.read();
        if state.subgraph_health.is_empty() {
            // Before the first pass, report registered but unprobed.
            return self
                .subgraphs
                .iter()
                .map(|s| SubgraphHealth {
                    name:    s.name.clone(),
                    url:     s.url.clone(),
                    healthy: false,
                })
                .collect();
        }
        state.subgraph_health.clone()
    }

    /// URL of a subgraph by name.
    #[must_use]
    pub fn url_of(&self, subgraph: &str) -> Option<&str> {
        self.subgraphs
            .iter()
            .find(|s| s.name == subgraph)
            .map(|s| s.url.as_str())
    }

    /// Run one composition pass.
    pub async fn recompose(&self) {
        let mut sdls = Vec::with_capacity(self.subgraphs.len());
        let mut health = Vec::with_capacity(self.subgraphs.len());
        let mut fetch_errors = Vec::new();

        for subgraph in &self.subgraphs {
            match self.fetch_sdl(&subgraph.url).await {
                Ok(sdl) => {
                    health.push(SubgraphHealth {
                        name:    subgraph.name.clone(),
                        url:     subgraph.url.clone(),
                        healthy: true,
                    });
                    sdls.push((subgraph.name.clone(), sdl));
                }
                Err(err) => {
                    warn!(subgraph = %subgraph.name, error = %err, "SDL fetch failed");
                    health.push(SubgraphHealth {
                        name:    subgraph.name.clone(),
                        url:     subgraph.url.clone(),
                        healthy: false,
                    });
                    fetch_errors.push(format!("{}: {err}", subgraph.name));
                }
            }
        }

        let outcome = if fetch_errors.is_empty() {
            Supergraph::compose(&sdls).map(Arc::new)
        } else {
            Err(DevmeshError::composition(format!(
                "SDL fetch failed for {}",
                fetch_errors.join("; ")
            )))
        };

        let mut state = self.state.write();
        state.subgraph_health = health;
        match outcome {
            Ok(supergraph) => {
                info!(
                    queries = supergraph.query_fields.len(),
                    mutations = supergraph.mutation_fields.len(),
                    subscriptions = supergraph.subscription_fields.len(),
                    entities = supergraph.entities.len(),
                    "supergraph composed"
                );
                state.supergraph = Some(supergraph);
                state.last_error = None;
                state.last_success_at = Some(Utc::now());
            }
            Err(err) => {
                // Keep the previous supergraph; surface the error.
                state.last_error = Some(err.to_string());
            }
        }
    }

    async fn fetch_sdl(&self, base_url: &str) -> Result<String> {
        let request = GraphQLRequest::new("{ _service { sdl } }");
        let response = self
            .client
            .post(format!("{}/graphql", base_url.trim_end_matches('/')))
            .json(&request)
            .send()
            .await
            .map_err(|e| DevmeshError::upstream(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(DevmeshError::upstream(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body: GraphQLResponse = response
            .json()
            .await
            .map_err(|e| DevmeshError::upstream(format!("invalid response body: {e}")))?;

        body.data
            .as_ref()
            .and_then(|d| d.get("_service"))
            .and_then(|s| s.get("sdl"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| DevmeshError::upstream("response carried no _service.sdl"))
    }

    /// Spawn the periodic recomposition loop. The first pass runs
    /// immediately.
    pub fn spawn_loop(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let composer = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(composer) = composer.upgrade() else {
                    return;
                };
                composer.recompose().await;
            }
        })
    }

    /// Inject a composed supergraph directly (tests and static
    /// deployments).
    pub fn install(&self, supergraph: Supergraph) {
        let mut state = self.state.write();
        state.supergraph = Some(Arc::new(supergraph));
        state.last_error = None;
        state.last_success_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_supergraph_before_first_pass() {
        let composer = Composer::new(Vec::new(), Duration::from_secs(5));
        assert!(composer.supergraph().is_none());
        let err = composer.require_supergraph().unwrap_err();
        assert_eq!(err.error_code(), "SUBGRAPH_UNAVAILABLE");
    }

    #[test]
    fn test_install_and_health() {
        let composer = Composer::new(Vec::new(), Duration::from_secs(5));
        composer.install(Supergraph::default());
        assert!(composer.supergraph().is_some());
        let health = composer.health();
        assert_eq!(health["composed"], serde_json::json!(true));
        assert_eq!(health["compositionError"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_failed_pass_keeps_last_good() {
        let composer = Composer::new(
            vec![SubgraphEndpoint {
                name: "git".to_string(),
                // Nothing listens here; the fetch fails fast.
                url:  "http://127.0.0.1:1".to_string(),
            }],
            Duration::from_millis(200),
        );
        composer.install(Supergraph::default());

        composer.recompose().await;

        // The stale supergraph survives and the error is surfaced.
        assert!(composer.supergraph().is_some());
        let health = composer.health();
        assert!(health["compositionError"].is_string());
        let services = composer.services();
        assert_eq!(services.len(), 1);
        assert!(!services[0].healthy);
    }
}
