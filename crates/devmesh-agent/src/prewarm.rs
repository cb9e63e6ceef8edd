//! Pre-warm pool: child processes held at the "handshake complete,
//! awaiting first prompt" state.
//!
//! Slot state machine: `WARMING -> READY -> CLAIMED` (drained by the
//! next maintenance pass), or `WARMING -> FAILED` on launch error or
//! handshake timeout. A background maintenance loop prunes aged and
//! failed slots and tops the pool back up to its configured size, so
//! `ready + warming` converges to `pool_size` over any sustained idle
//! interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devmesh_error::Result;
use devmesh_events::EventBus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cli::envelope::CliEnvelope;
use crate::cli::transport::{CliLauncher, CliTransport, LaunchSpec};
use crate::config::AgentServiceConfig;

/// Slot lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
    /// Child launched, waiting for the handshake marker.
    Warming,
    /// Handshake complete, awaiting first prompt.
    Ready,
    /// Adopted by a session; drained on the next maintenance pass.
    Claimed,
    /// Launch or handshake failed; replaced on the next pass.
    Failed,
}

/// A state transition, published on the pool's event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreWarmEvent {
    /// Slot id.
    pub slot_id: String,
    /// New state.
    pub state: SlotState,
    /// Transition time.
    pub at: DateTime<Utc>,
    /// Error detail for FAILED transitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimOutcome {
    /// Whether a READY slot was adopted.
    pub success: bool,
    /// Pool state hint when no slot was available: `WARMING` when a
    /// slot is on its way, `NONE` when the pool is empty.
    pub status: String,
}

struct Slot {
    id:                  String,
    state:               SlotState,
    created_at:          DateTime<Utc>,
    transport:           Option<Arc<dyn CliTransport>>,
    upstream_session_id: Option<String>,
    error:               Option<String>,
}

/// The pool.
pub struct PreWarmPool {
    pool_size:      usize,
    max_age:        Duration,
    warmup_timeout: Duration,
    cleanup_every:  Duration,
    launcher:       Arc<dyn CliLauncher>,
    workspace_root: std::path::PathBuf,
    slots:          Mutex<Vec<Slot>>,
    events:         EventBus<PreWarmEvent>,
}

impl PreWarmPool {
    /// Build a pool from the service config.
    #[must_use]
    pub fn new(config: &AgentServiceConfig, launcher: Arc<dyn CliLauncher>) -> Arc<Self> {
        Arc::new(Self {
            pool_size:      config.prewarm_pool_size,
            max_age:        Duration::from_secs(config.max_session_age_secs),
            warmup_timeout: Duration::from_secs(config.warmup_timeout_secs),
            cleanup_every:  Duration::from_secs(config.cleanup_interval_secs),
            launcher:       launcher.clone(),
            workspace_root: config.workspace_root.clone(),
            slots:          Mutex::new(Vec::new()),
            events:         EventBus::default(),
        })
    }

    /// Subscribe to slot transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PreWarmEvent> {
        self.events.subscribe()
    }

    /// Start the maintenance loop; it runs until the pool is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let every = self.cleanup_every;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                pool.maintain().await;
            }
        })
    }

    /// One maintenance pass: prune, then top up.
    pub async fn maintain(self: &Arc<Self>) {
        let mut to_shutdown = Vec::new();
        {
            let mut slots = self.slots.lock();
            let now = Utc::now();
            slots.retain_mut(|slot| {
                let age = (now - slot.created_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                let keep = match slot.state {
                    SlotState::Failed | SlotState::Claimed => false,
                    SlotState::Ready | SlotState::Warming => age < self.max_age,
                };
                if !keep {
                    debug!(slot_id = %slot.id, state = ?slot.state, "pruning slot");
                    if let Some(transport) = slot.transport.take() {
                        to_shutdown.push(transport);
                    }
                }
                keep
            });
        }
        for transport in to_shutdown {
            let _ = transport.shutdown(Duration::from_secs(5)).await;
        }

        let deficit = {
            let slots = self.slots.lock();
            let live = slots
                .iter()
                .filter(|s| matches!(s.state, SlotState::Ready | SlotState::Warming))
                .count();
            self.pool_size.saturating_sub(live)
        };
        for _ in 0..deficit {
            self.start_warming();
        }
    }

    /// Begin warming one slot.
    fn start_warming(self: &Arc<Self>) {
        let slot_id = format!("warm_{}", uuid::Uuid::new_v4().simple());
        {
            let mut slots = self.slots.lock();
            slots.push(Slot {
                id:                  slot_id.clone(),
                state:               SlotState::Warming,
                created_at:          Utc::now(),
                transport:           None,
                upstream_session_id: None,
                error:               None,
            });
        }
        self.events.publish(PreWarmEvent {
            slot_id: slot_id.clone(),
            state:   SlotState::Warming,
            at:      Utc::now(),
            error:   None,
        });

        let pool = self.clone();
        tokio::spawn(async move {
            match pool.warm_one(&slot_id).await {
                Ok(()) => {}
                Err(err) => {
                    warn!(slot_id = %slot_id, error = %err, "warm-up failed");
                    pool.transition(&slot_id, SlotState::Failed, None, None, Some(err.to_string()));
                }
            }
        });
    }

    async fn warm_one(self: &Arc<Self>, slot_id: &str) -> Result<()> {
        let spec = LaunchSpec {
            working_dir: self.workspace_root.clone(),
            ..LaunchSpec::default()
        };
        let transport = self.launcher.launch(&spec).await?;
        let mut events = transport.events();

        let handshake = tokio::time::timeout(self.warmup_timeout, async {
            loop {
                match events.recv().await {
                    Ok(envelope) if envelope.is_handshake() => {
                        let correlator = match envelope {
                            CliEnvelope::System { session_id, .. } => session_id,
                            _ => None,
                        };
                        return Ok(correlator);
                    }
                    Ok(CliEnvelope::Error { message }) => {
                        return Err(devmesh_error::DevmeshError::upstream(message));
                    }
                    Ok(_) => {}
                    Err(_) => {
                        return Err(devmesh_error::DevmeshError::upstream(
                            "warm-up stream closed",
                        ));
                    }
                }
            }
        })
        .await;

        match handshake {
            Ok(Ok(correlator)) => {
                info!(slot_id, "slot ready");
                self.transition(slot_id, SlotState::Ready, Some(transport), correlator, None);
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = transport.shutdown(Duration::from_secs(1)).await;
                Err(err)
            }
            Err(_) => {
                let _ = transport.shutdown(Duration::from_secs(1)).await;
                Err(devmesh_error::DevmeshError::upstream(format!(
                    "warm-up handshake timed out after {:?}",
                    self.warmup_timeout
                )))
            }
        }
    }

    fn transition(
        &self,
        slot_id: &str,
        state: SlotState,
        transport: Option<Arc<dyn CliTransport>>,
        upstream_session_id: Option<String>,
        error: Option<String>,
    ) {
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.iter_mut().find(|s| s.id == slot_id) {
                slot.state = state;
                if transport.is_some() {
                    slot.transport = transport;
                }
                if upstream_session_id.is_some() {
                    slot.upstream_session_id = upstream_session_id;
                }
                slot.error = error.clone();
            }
        }
        self.events.publish(PreWarmEvent {
            slot_id: slot_id.to_string(),
            state,
            at: Utc::now(),
            error,
        });
    }

    /// Atomically claim the oldest READY slot.
    ///
    /// Returns the transport and its upstream correlator, or a
    /// non-blocking "not available" outcome.
    pub fn claim(&self) -> std::result::Result<(Arc<dyn CliTransport>, Option<String>), ClaimOutcome> {
        let claimed = {
            let mut slots = self.slots.lock();
            let oldest_ready = slots
                .iter_mut()
                .filter(|s| s.state == SlotState::Ready)
                .min_by_key(|s| s.created_at);
            match oldest_ready {
                Some(slot) => {
                    slot.state = SlotState::Claimed;
                    Some((
                        slot.id.clone(),
                        slot.transport.take(),
                        slot.upstream_session_id.clone(),
                    ))
                }
                None => {
                    let warming = slots.iter().any(|s| s.state == SlotState::Warming);
                    return Err(ClaimOutcome {
                        success: false,
                        status:  if warming { "WARMING" } else { "NONE" }.to_string(),
                    });
                }
            }
        };

        let (slot_id, transport, correlator) = claimed.expect("claimed above");
        self.events.publish(PreWarmEvent {
            slot_id,
            state: SlotState::Claimed,
            at: Utc::now(),
            error: None,
        });
        match transport {
            Some(transport) => Ok((transport, correlator)),
            // A READY slot always holds its transport; treat the
            // impossible case as unavailable rather than panicking.
            None => Err(ClaimOutcome {
                success: false,
                status:  "NONE".to_string(),
            }),
        }
    }

    /// Current slot counts and per-slot ages.
    #[must_use]
    pub fn metrics(&self) -> Value {
        let slots = self.slots.lock();
        let now = Utc::now();
        let count = |state: SlotState| slots.iter().filter(|s| s.state == state).count();
        let per_slot: Vec<Value> = slots
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "state": s.state,
                    "ageSecs": (now - s.created_at).num_seconds().max(0),
                    "error": s.error,
                })
            })
            .collect();
        json!({
            "poolSize": self.pool_size,
            "total": slots.len(),
            "ready": count(SlotState::Ready),
            "warming": count(SlotState::Warming),
            "claimed": count(SlotState::Claimed),
            "failed": count(SlotState::Failed),
            "slots": per_slot,
        })
    }

    /// Wait until `ready` reaches `target` or `timeout` elapses.
    /// Test and start-up helper.
    pub async fn wait_ready(&self, target: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let ready = {
                let slots = self.slots.lock();
                slots.iter().filter(|s| s.state == SlotState::Ready).count()
            };
            if ready >= target {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::testing::FakeLauncher;

    fn pool_config(pool_size: usize) -> AgentServiceConfig {
        AgentServiceConfig {
            prewarm_pool_size: pool_size,
            cleanup_interval_secs: 1,
            warmup_timeout_secs: 1,
            ..AgentServiceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pool_fills_to_size() {
        let launcher = FakeLauncher::new();
        let pool = PreWarmPool::new(&pool_config(2), launcher);
        pool.maintain().await;

        assert!(pool.wait_ready(2, Duration::from_secs(2)).await);
        let metrics = pool.metrics();
        assert_eq!(metrics["ready"], json!(2));
        assert_eq!(metrics["warming"], json!(0));
    }

    #[tokio::test]
    async fn test_claim_drains_and_reports() {
        let launcher = FakeLauncher::new();
        let pool = PreWarmPool::new(&pool_config(2), launcher);
        pool.maintain().await;
        assert!(pool.wait_ready(2, Duration::from_secs(2)).await);

        let first = pool.claim();
        let second = pool.claim();
        assert!(first.is_ok());
        assert!(second.is_ok());

        // Third claim: nothing ready, nothing warming yet.
        let third = pool.claim().unwrap_err();
        assert!(!third.success);
        assert!(third.status == "NONE" || third.status == "WARMING");

        // Maintenance replaces the claimed slots.
        pool.maintain().await;
        assert!(pool.wait_ready(2, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_distinct_transports_per_claim() {
        let launcher = FakeLauncher::new();
        let pool = PreWarmPool::new(&pool_config(2), launcher);
        pool.maintain().await;
        assert!(pool.wait_ready(2, Duration::from_secs(2)).await);

        let (t1, c1) = pool.claim().unwrap();
        let (t2, c2) = pool.claim().unwrap();
        assert!(!Arc::ptr_eq(&t1, &t2));
        assert_ne!(c1, c2);
    }

    #[tokio::test]
    async fn test_warmup_timeout_fails_slot() {
        let launcher = FakeLauncher::without_handshake();
        let mut config = pool_config(1);
        config.warmup_timeout_secs = 1;
        let pool = PreWarmPool::new(&config, launcher);
        pool.maintain().await;

        // Wait past the warm-up timeout.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let metrics = pool.metrics();
        assert_eq!(metrics["ready"], json!(0));
        assert_eq!(metrics["failed"], json!(1));

        // The next pass removes the failed slot and starts a fresh one.
        pool.maintain().await;
        let metrics = pool.metrics();
        assert_eq!(metrics["failed"], json!(0));
        assert_eq!(metrics["warming"].as_u64().unwrap() + metrics["ready"].as_u64().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transitions_published() {
        let launcher = FakeLauncher::new();
        let pool = PreWarmPool::new(&pool_config(1), launcher);
        let mut events = pool.subscribe();
        pool.maintain().await;
        assert!(pool.wait_ready(1, Duration::from_secs(2)).await);

        let first = events.recv().await.unwrap();
        assert_eq!(first.state, SlotState::Warming);
        let second = events.recv().await.unwrap();
        assert_eq!(second.state, SlotState::Ready);
    }

    #[tokio::test]
    async fn test_ready_plus_warming_never_exceeds_pool_size() {
        let launcher = FakeLauncher::new();
        let pool = PreWarmPool::new(&pool_config(3), launcher);
        for _ in 0..4 {
            pool.maintain().await;
        }
        assert!(pool.wait_ready(3, Duration::from_secs(2)).await);
        let metrics = pool.metrics();
        let live = metrics["ready"].as_u64().unwrap() + metrics["warming"].as_u64().unwrap();
        assert!(live <= 3);
    }
}
