//! In-memory fake transport for tests.
//!
//! The fake handshakes immediately on launch and answers every prompt
//! with a scripted reply: a couple of stream chunks followed by a
//! `result` envelope carrying a fresh upstream correlator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devmesh_error::{DevmeshError, Result};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::envelope::{CliEnvelope, UsageEnvelope};
use super::transport::{CliLauncher, CliTransport, LaunchSpec};

/// A scripted reply to one prompt.
#[derive(Debug, Clone)]
pub struct FakeReply {
    /// Stream chunks emitted before the result.
    pub chunks: Vec<String>,
    /// The result payload.
    pub result: String,
    /// Reported usage.
    pub usage: UsageEnvelope,
    /// Delay before the result envelope.
    pub delay: Duration,
}

impl Default for FakeReply {
    fn default() -> Self {
        Self {
            chunks: vec!["thinking".to_string()],
            result: "done".to_string(),
            usage:  UsageEnvelope {
                input_tokens:  12,
                output_tokens: 34,
            },
            delay:  Duration::from_millis(5),
        }
    }
}

/// In-memory transport; every prompt is answered from the reply queue
/// (or the default reply when the queue is empty).
pub struct FakeTransport {
    events:     broadcast::Sender<CliEnvelope>,
    replies:    Mutex<Vec<FakeReply>>,
    alive:      AtomicBool,
    /// Correlator counter so each interaction captures a distinct id.
    correlator: AtomicU64,
    /// Correlator prefix (distinguishes transports).
    prefix:     String,
    /// Prompts received, for assertions.
    prompts:    Mutex<Vec<String>>,
}

impl FakeTransport {
    /// Create a fake that has already handshaken.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            replies: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            correlator: AtomicU64::new(0),
            prefix: prefix.into(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Queue a scripted reply for the next prompt.
    pub fn push_reply(&self, reply: FakeReply) {
        self.replies.lock().push(reply);
    }

    /// Prompts received so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Emit the handshake marker, as the real CLI does right after
    /// start-up.
    pub fn emit_handshake(&self) {
        let id = format!("{}-hs", self.prefix);
        let _ = self.events.send(CliEnvelope::System {
            subtype:    Some("init".to_string()),
            session_id: Some(id),
        });
    }

    /// Simulate a child crash: mark dead and emit a protocol error.
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.events.send(CliEnvelope::Error {
            message: "agent CLI crashed".to_string(),
        });
    }
}

#[async_trait]
impl CliTransport for FakeTransport {
    async fn send_line(&self, line: String) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(DevmeshError::upstream("transport is closed"));
        }
        let prompt = serde_json::from_str::<serde_json::Value>(&line)
            .ok()
            .and_then(|v| v.get("prompt").and_then(|p| p.as_str()).map(ToString::to_string))
            .unwrap_or(line);
        self.prompts.lock().push(prompt);

        let reply = {
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                FakeReply::default()
            } else {
                replies.remove(0)
            }
        };
        let correlator = format!(
            "{}-{}",
            self.prefix,
            self.correlator.fetch_add(1, Ordering::SeqCst)
        );
        let events = self.events.clone();

        tokio::spawn(async move {
            for chunk in reply.chunks {
                let _ = events.send(CliEnvelope::Stream { content: chunk });
            }
            tokio::time::sleep(reply.delay).await;
            let _ = events.send(CliEnvelope::Result {
                result:     reply.result,
                session_id: Some(correlator),
                usage:      Some(reply.usage),
            });
        });
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<CliEnvelope> {
        self.events.subscribe()
    }

    async fn shutdown(&self, _grace: Duration) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Launcher handing out [`FakeTransport`]s and remembering them for
/// assertions.
#[derive(Default)]
pub struct FakeLauncher {
    launched:       Mutex<Vec<Arc<FakeTransport>>>,
    handshake_auto: AtomicBool,
}

impl FakeLauncher {
    /// A launcher whose transports handshake immediately.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let launcher = Self {
            launched:       Mutex::new(Vec::new()),
            handshake_auto: AtomicBool::new(true),
        };
        Arc::new(launcher)
    }

    /// A launcher whose transports never handshake (for warm-up
    /// timeout tests).
    #[must_use]
    pub fn without_handshake() -> Arc<Self> {
        let launcher = Self {
            launched:       Mutex::new(Vec::new()),
            handshake_auto: AtomicBool::new(false),
        };
        Arc::new(launcher)
    }

    /// Transports launched so far.
    #[must_use]
    pub fn launched(&self) -> Vec<Arc<FakeTransport>> {
        self.launched.lock().clone()
    }
}

#[async_trait]
impl CliLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn CliTransport>> {
        let prefix = format!("fake{}", self.launched.lock().len());
        let transport = FakeTransport::new(prefix);
        if let Some(resume) = &spec.resume {
            // A resumed transport continues the correlator lineage.
            transport.prompts.lock().push(format!("<resume:{resume}>"));
        }
        self.launched.lock().push(transport.clone());
        if self.handshake_auto.load(Ordering::SeqCst) {
            let t = transport.clone();
            tokio::spawn(async move {
                // Give the caller a beat to subscribe before the
                // handshake fires.
                tokio::time::sleep(Duration::from_millis(2)).await;
                t.emit_handshake();
            });
        }
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_replies_to_prompt() {
        let transport = FakeTransport::new("t");
        let mut events = transport.events();
        transport
            .send_line(r#"{"type":"prompt","prompt":"hi"}"#.to_string())
            .await
            .unwrap();

        let mut saw_result = false;
        while let Ok(envelope) = events.recv().await {
            if let CliEnvelope::Result { session_id, .. } = envelope {
                assert_eq!(session_id.as_deref(), Some("t-0"));
                saw_result = true;
                break;
            }
        }
        assert!(saw_result);
        assert_eq!(transport.prompts(), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_crash_rejects_sends() {
        let transport = FakeTransport::new("t");
        transport.crash();
        assert!(!transport.is_alive());
        assert!(transport.send_line("x".to_string()).await.is_err());
    }
}
