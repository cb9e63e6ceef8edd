//! Session lifecycle and command execution.
//!
//! One [`SessionManager`] owns every live session: its child-process
//! transport, its append-only history, its output broadcast channel,
//! and its FIFO command lock. Command execution flows through the
//! global [`CommandDispatcher`] so the concurrency cap and rate limit
//! hold across sessions, while the per-session lock guarantees at most
//! one PROCESSING interaction per session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use devmesh_error::{DevmeshError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cli::envelope::{CliCommand, CliEnvelope};
use crate::cli::transport::{CliLauncher, CliTransport, LaunchSpec};
use crate::config::AgentServiceConfig;
use crate::dispatcher::CommandDispatcher;
use crate::output::{CommandOutput, OutputType};
use crate::tokens;
use crate::types::{AgentSession, Interaction, SessionStatus, SessionTemplate, TemplateVariable};

/// Ceiling on a single command's wall-clock time.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Output broadcast capacity per session.
const OUTPUT_CAPACITY: usize = 512;

/// Receipt returned by `executeCommand` / `continueSession`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteReceipt {
    /// The session the command was accepted for.
    pub session_id: String,
    /// Whether the command was accepted.
    pub success: bool,
    /// Acceptance time.
    pub started_at: chrono::DateTime<Utc>,
    /// Advisory duration estimate.
    pub estimated_duration_ms: u64,
    /// Flags the session runs with.
    pub flags: Vec<String>,
}

/// A time-bounded share code for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareGrant {
    /// Opaque share code.
    pub code: String,
    /// Shared session.
    pub session_id: String,
    /// Expiry time.
    pub expires_at: chrono::DateTime<Utc>,
}

/// Per-id outcome of a batch session operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOpResult {
    /// Target session id.
    pub session_id: String,
    /// Whether the operation succeeded for this id.
    pub success: bool,
    /// Error detail on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Operation payload (export blob, analysis) when produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Options for command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Target session; a new session is created when absent.
    pub session_id: Option<String>,
    /// Working directory for a newly created session.
    pub working_dir: Option<String>,
    /// Model override for a newly created session.
    pub model: Option<String>,
    /// CLI flags for a newly created session.
    pub flags: Vec<String>,
    /// Display name for a newly created session.
    pub name: Option<String>,
}

/// Owns all agent sessions.
pub struct SessionManager {
    config:        AgentServiceConfig,
    launcher:      Arc<dyn CliLauncher>,
    dispatcher:    CommandDispatcher,
    sessions:      DashMap<String, Arc<RwLock<AgentSession>>>,
    transports:    DashMap<String, Arc<dyn CliTransport>>,
    outputs:       DashMap<String, broadcast::Sender<CommandOutput>>,
    command_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    templates:     DashMap<String, SessionTemplate>,
    shares:        DashMap<String, ShareGrant>,
}

impl SessionManager {
    /// Create a manager with its dispatcher sized from the config.
    #[must_use]
    pub fn new(config: AgentServiceConfig, launcher: Arc<dyn CliLauncher>) -> Arc<Self> {
        let dispatcher = CommandDispatcher::new(
            config.max_concurrent_commands,
            config.max_commands_per_second,
        );
        Arc::new(Self {
            config,
            launcher,
            dispatcher,
            sessions: DashMap::new(),
            transports: DashMap::new(),
            outputs: DashMap::new(),
            command_locks: DashMap::new(),
            templates: DashMap::new(),
            shares: DashMap::new(),
        })
    }

    /// The global dispatcher (shared with the batch dispatcher).
    #[must_use]
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Create a fresh session without launching its child yet; the
    /// child starts on the first command.
    pub fn create_session(&self, options: &ExecuteOptions) -> String {
        let id = format!("sess_{}", uuid::Uuid::new_v4().simple());
        let working_dir = options
            .working_dir
            .clone()
            .unwrap_or_else(|| self.config.workspace_root.display().to_string());
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());

        let mut session = AgentSession::new(id.clone(), working_dir, model);
        session.metadata.flags = options.flags.clone();
        session.name = options.name.clone();

        self.register(session);
        info!(session_id = %id, "session created");
        id
    }

    /// Adopt a pre-warmed transport into a new session.
    pub fn adopt_prewarmed(
        &self,
        transport: Arc<dyn CliTransport>,
        upstream_session_id: Option<String>,
        name: Option<String>,
    ) -> String {
        let id = format!("sess_{}", uuid::Uuid::new_v4().simple());
        let mut session = AgentSession::new(
            id.clone(),
            self.config.workspace_root.display().to_string(),
            self.config.default_model.clone(),
        );
        session.metadata.upstream_session_id = upstream_session_id;
        session.name = name;

        self.register(session);
        self.transports.insert(id.clone(), transport);
        info!(session_id = %id, "pre-warmed session claimed");
        id
    }

    fn register(&self, session: AgentSession) {
        let id = session.id.clone();
        let (sender, _) = broadcast::channel(OUTPUT_CAPACITY);
        self.outputs.insert(id.clone(), sender);
        self.command_locks
            .insert(id.clone(), Arc::new(tokio::sync::Mutex::new(())));
        self.sessions.insert(id, Arc::new(RwLock::new(session)));
    }

    /// Snapshot a session.
    #[must_use]
    pub fn session(&self, id: &str) -> Option<AgentSession> {
        self.sessions.get(id).map(|entry| entry.read().clone())
    }

    /// Snapshot every session.
    #[must_use]
    pub fn sessions(&self) -> Vec<AgentSession> {
        let mut all: Vec<AgentSession> = self
            .sessions
            .iter()
            .map(|entry| entry.read().clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    fn live_session(&self, id: &str) -> Result<Arc<RwLock<AgentSession>>> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| DevmeshError::session_not_found(id))?;
        if entry.read().status.is_terminal() {
            return Err(DevmeshError::session_not_found(id));
        }
        Ok(entry.clone())
    }

    /// Subscribe to a session's output stream. Subscribers established
    /// after a command's final frame see only later commands.
    pub fn subscribe_output(&self, id: &str) -> Result<broadcast::Receiver<CommandOutput>> {
        self.sessions
            .get(id)
            .ok_or_else(|| DevmeshError::session_not_found(id))?;
        let sender = self
            .outputs
            .get(id)
            .ok_or_else(|| DevmeshError::session_not_found(id))?;
        Ok(sender.subscribe())
    }

    fn publish(&self, frame: CommandOutput) {
        if let Some(sender) = self.outputs.get(&frame.session_id) {
            let _ = sender.send(frame);
        }
    }

    // ========================================================================
    // Command execution
    // ========================================================================

    /// Accept a command: resolve or create the session, estimate, and
    /// execute in the background. Output arrives on the session's
    /// stream.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND` when a provided session id is unknown or
    /// terminated.
    pub fn execute_command(
        self: &Arc<Self>,
        prompt: String,
        options: ExecuteOptions,
    ) -> Result<ExecuteReceipt> {
        let (session_id, continuation) = match &options.session_id {
            Some(id) => {
                self.live_session(id)?;
                (id.clone(), true)
            }
            None => (self.create_session(&options), false),
        };

        let receipt = ExecuteReceipt {
            session_id:            session_id.clone(),
            success:               true,
            started_at:            Utc::now(),
            estimated_duration_ms: tokens::estimate_duration_ms(&prompt, continuation),
            flags:                 self
                .session(&session_id)
                .map(|s| s.metadata.flags)
                .unwrap_or_default(),
        };

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.run_command(&session_id, &prompt).await {
                warn!(session_id = %session_id, error = %err, "command failed");
            }
        });

        Ok(receipt)
    }

    /// Continue an existing session, optionally prepending context.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND` for unknown or terminated sessions.
    pub fn continue_session(
        self: &Arc<Self>,
        session_id: &str,
        prompt: String,
        additional_context: Option<String>,
    ) -> Result<ExecuteReceipt> {
        self.live_session(session_id)?;
        let full_prompt = match additional_context {
            Some(context) if !context.is_empty() => format!("{context}\n\n{prompt}"),
            _ => prompt,
        };
        self.execute_command(
            full_prompt,
            ExecuteOptions {
                session_id: Some(session_id.to_string()),
                ..ExecuteOptions::default()
            },
        )
    }

    /// Execute one command to completion. This is the awaitable core
    /// used by the background task and by the batch dispatcher.
    ///
    /// # Errors
    ///
    /// Propagates transport failures; the session is moved to ERROR
    /// and a terminal frame is published before returning.
    pub async fn run_command(&self, session_id: &str, prompt: &str) -> Result<Interaction> {
        let session = self.live_session(session_id)?;

        // FIFO per session: later commands queue here.
        let lock = self
            .command_locks
            .get(session_id)
            .map(|l| l.clone())
            .ok_or_else(|| DevmeshError::session_not_found(session_id))?;
        let _serial = lock.lock().await;

        // Global limits.
        let _permit = self.dispatcher.acquire().await;

        let started = Instant::now();
        {
            let mut s = session.write();
            if s.status.is_terminal() {
                return Err(DevmeshError::session_not_found(session_id));
            }
            s.status = SessionStatus::Processing;
            s.last_activity = Utc::now();
            s.history.push(Interaction {
                timestamp: Utc::now(),
                prompt: prompt.to_string(),
                response: None,
                execution_time_ms: 0,
                success: false,
                upstream_session_id: None,
            });
        }
        self.publish(CommandOutput::frame(
            session_id,
            OutputType::System,
            "command accepted",
        ));

        let outcome = self.drive_transport(session_id, &session, prompt, started).await;

        match outcome {
            Ok(interaction) => Ok(interaction),
            Err(err) => {
                {
                    let mut s = session.write();
                    // A kill that raced the command keeps TERMINATED.
                    if !s.status.is_terminal() {
                        s.status = SessionStatus::Error;
                    }
                    s.last_activity = Utc::now();
                    if let Some(last) = s.history.last_mut() {
                        last.response = Some(err.to_string());
                        last.execution_time_ms = started.elapsed().as_millis() as u64;
                        last.success = false;
                    }
                }
                self.publish(CommandOutput::final_frame(
                    session_id,
                    format!("error: {err}"),
                    None,
                ));
                Err(err)
            }
        }
    }

    async fn drive_transport(
        &self,
        session_id: &str,
        session: &Arc<RwLock<AgentSession>>,
        prompt: &str,
        started: Instant,
    ) -> Result<Interaction> {
        let transport = self.ensure_transport(session_id, session).await?;
        let mut events = transport.events();

        let line = CliCommand::Prompt {
            prompt: prompt.to_string(),
            resume: None,
        }
        .to_line()
        .map_err(|e| DevmeshError::internal(format!("encode prompt: {e}")))?;
        transport.send_line(line).await?;

        let deadline = tokio::time::Instant::now() + COMMAND_TIMEOUT;
        let mut response_text = String::new();

        loop {
            let envelope = tokio::select! {
                env = events.recv() => env,
                () = tokio::time::sleep_until(deadline) => {
                    return Err(DevmeshError::upstream("command timed out"));
                }
            };

            match envelope {
                Ok(CliEnvelope::Stream { content }) => {
                    response_text.push_str(&content);
                    let streaming_to_subscribers = self
                        .outputs
                        .get(session_id)
                        .is_some_and(|s| s.receiver_count() > 0);
                    if streaming_to_subscribers {
                        let mut s = session.write();
                        if s.status == SessionStatus::Processing {
                            s.status = SessionStatus::Active;
                        }
                    }
                    self.publish(CommandOutput::frame(
                        session_id,
                        OutputType::Stdout,
                        content,
                    ));
                }
                Ok(CliEnvelope::Progress { message }) => {
                    self.publish(CommandOutput::frame(
                        session_id,
                        OutputType::Progress,
                        message,
                    ));
                }
                Ok(CliEnvelope::System { .. }) => {
                    // Handshake or lifecycle notice mid-command; informational.
                }
                Ok(CliEnvelope::Error { message }) => {
                    return Err(DevmeshError::upstream(message));
                }
                Ok(CliEnvelope::Result {
                    result,
                    session_id: correlator,
                    usage,
                }) => {
                    let execution_time_ms = started.elapsed().as_millis() as u64;
                    let (input_tokens, output_tokens) = match usage {
                        Some(u) => (u.input_tokens, u.output_tokens),
                        None => (
                            tokens::rough_token_estimate(prompt),
                            tokens::rough_token_estimate(&result),
                        ),
                    };

                    let interaction = {
                        let mut s = session.write();
                        s.status = SessionStatus::Idle;
                        s.last_activity = Utc::now();
                        s.metadata.upstream_session_id = correlator.clone();
                        s.metadata.token_usage = tokens::accumulate(
                            s.metadata.token_usage,
                            &s.metadata.model,
                            input_tokens,
                            output_tokens,
                        );
                        let last = s.history.last_mut().expect("interaction pushed above");
                        last.response = Some(result.clone());
                        last.execution_time_ms = execution_time_ms;
                        last.success = true;
                        last.upstream_session_id = correlator;
                        last.clone()
                    };

                    self.publish(CommandOutput::final_frame(
                        session_id,
                        result,
                        Some(output_tokens),
                    ));
                    return Ok(interaction);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(session_id, missed, "output reader lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(DevmeshError::upstream("agent CLI stream closed"));
                }
            }
        }
    }

    async fn ensure_transport(
        &self,
        session_id: &str,
        session: &Arc<RwLock<AgentSession>>,
    ) -> Result<Arc<dyn CliTransport>> {
        if let Some(existing) = self.transports.get(session_id) {
            if existing.is_alive() {
                return Ok(existing.clone());
            }
        }

        let spec = {
            let s = session.read();
            LaunchSpec {
                working_dir: PathBuf::from(&s.working_dir),
                resume:      s.metadata.upstream_session_id.clone(),
                model:       Some(s.metadata.model.clone()),
                flags:       s.metadata.flags.clone(),
            }
        };
        let transport = self.launcher.launch(&spec).await?;
        self.transports.insert(session_id.to_string(), transport.clone());
        Ok(transport)
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Kill a session. Idempotent: unknown ids succeed.
    pub async fn kill_session(&self, session_id: &str) -> bool {
        let Some(entry) = self.sessions.get(session_id).map(|e| e.clone()) else {
            return true;
        };

        let was_processing = {
            let mut s = entry.write();
            let was = matches!(s.status, SessionStatus::Processing | SessionStatus::Active);
            s.status = SessionStatus::Terminated;
            s.last_activity = Utc::now();
            was
        };

        if let Some((_, transport)) = self.transports.remove(session_id) {
            if let Err(err) = transport.shutdown(self.config.kill_grace()).await {
                warn!(session_id, error = %err, "transport shutdown failed");
            }
        }

        if was_processing {
            self.publish(CommandOutput::final_frame(
                session_id,
                "session killed",
                None,
            ));
        }
        info!(session_id, "session terminated");
        true
    }

    /// Fork a session at `message_index` (negative or past-tail values
    /// clamp to the last interaction).
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND` for unknown sessions; `BAD_USER_INPUT` when
    /// the parent has no history to fork from.
    pub fn fork_session(
        &self,
        session_id: &str,
        message_index: Option<i64>,
        name: Option<String>,
        include_history: bool,
    ) -> Result<AgentSession> {
        let parent = self
            .session(session_id)
            .ok_or_else(|| DevmeshError::session_not_found(session_id))?;

        if parent.history.is_empty() {
            return Err(DevmeshError::bad_user_input(
                "cannot fork a session with no history",
            ));
        }

        let last = parent.history.len() - 1;
        let index = match message_index {
            None => last,
            Some(i) if i < 0 => last,
            Some(i) => (i as usize).min(last),
        };

        let fork_id = format!("sess_{}", uuid::Uuid::new_v4().simple());
        let mut fork = AgentSession::new(
            fork_id.clone(),
            parent.working_dir.clone(),
            parent.metadata.model.clone(),
        );
        fork.metadata.flags = parent.metadata.flags.clone();
        fork.metadata.project_context = parent.metadata.project_context.clone();
        // Resuming the fork continues from the interaction at the fork
        // point, not the parent's latest.
        fork.metadata.upstream_session_id =
            parent.history[index].upstream_session_id.clone();
        fork.parent_session_id = Some(parent.id.clone());
        fork.fork_point = Some(index);
        fork.name = name;
        if include_history {
            fork.history = parent.history[..=index].to_vec();
        }

        let snapshot = fork.clone();
        self.register(fork);
        info!(parent = %session_id, fork = %snapshot.id, index, "session forked");
        Ok(snapshot)
    }

    /// Archive a session: snapshot to the archive directory, terminate
    /// the child, and drop it from the live registry.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND` for unknown sessions; I/O errors from the
    /// archive write.
    pub async fn archive_session(&self, session_id: &str) -> Result<PathBuf> {
        let session = self
            .session(session_id)
            .ok_or_else(|| DevmeshError::session_not_found(session_id))?;

        std::fs::create_dir_all(&self.config.archive_dir)?;
        let path = self.config.archive_dir.join(format!(
            "{}-{}.json",
            session.id,
            Utc::now().timestamp()
        ));
        let blob = serde_json::to_string_pretty(&session)
            .map_err(|e| DevmeshError::internal(format!("serialize session: {e}")))?;
        std::fs::write(&path, blob)?;

        self.kill_session(session_id).await;
        self.sessions.remove(session_id);
        self.outputs.remove(session_id);
        self.command_locks.remove(session_id);

        info!(session_id, path = %path.display(), "session archived");
        Ok(path)
    }

    /// Issue a time-bounded share code for a session.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND` for unknown sessions.
    pub fn share_session(&self, session_id: &str, ttl: Duration) -> Result<ShareGrant> {
        self.session(session_id)
            .ok_or_else(|| DevmeshError::session_not_found(session_id))?;

        let code = share_code();
        let grant = ShareGrant {
            code:       code.clone(),
            session_id: session_id.to_string(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
        };
        self.shares.insert(code, grant.clone());
        Ok(grant)
    }

    /// Redeem a share code for its session, if still valid.
    #[must_use]
    pub fn redeem_share(&self, code: &str) -> Option<AgentSession> {
        let grant = self.shares.get(code)?;
        if grant.expires_at < Utc::now() {
            return None;
        }
        self.session(&grant.session_id)
    }

    /// Apply one operation to many sessions, continue-on-error.
    pub async fn batch_operation(
        &self,
        session_ids: &[String],
        op: &str,
        params: Option<&Value>,
    ) -> Vec<BatchOpResult> {
        let mut results = Vec::with_capacity(session_ids.len());
        for id in session_ids {
            let outcome = self.apply_batch_op(id, op, params).await;
            results.push(match outcome {
                Ok(payload) => BatchOpResult {
                    session_id: id.clone(),
                    success:    true,
                    error:      None,
                    payload,
                },
                Err(err) => BatchOpResult {
                    session_id: id.clone(),
                    success:    false,
                    error:      Some(err.to_string()),
                    payload:    None,
                },
            });
        }
        results
    }

    async fn apply_batch_op(
        &self,
        session_id: &str,
        op: &str,
        params: Option<&Value>,
    ) -> Result<Option<Value>> {
        match op {
            "ARCHIVE" => {
                let path = self.archive_session(session_id).await?;
                Ok(Some(json!({"archivedTo": path.display().to_string()})))
            }
            "DELETE" => {
                self.session(session_id)
                    .ok_or_else(|| DevmeshError::session_not_found(session_id))?;
                self.kill_session(session_id).await;
                self.sessions.remove(session_id);
                self.outputs.remove(session_id);
                self.command_locks.remove(session_id);
                Ok(None)
            }
            "EXPORT" => {
                let session = self
                    .session(session_id)
                    .ok_or_else(|| DevmeshError::session_not_found(session_id))?;
                Ok(Some(serde_json::to_value(&session).map_err(|e| {
                    DevmeshError::internal(format!("serialize session: {e}"))
                })?))
            }
            "TAG" => {
                let tag = params
                    .and_then(|p| p.get("tag"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| DevmeshError::bad_user_input("TAG requires params.tag"))?;
                let entry = self
                    .sessions
                    .get(session_id)
                    .ok_or_else(|| DevmeshError::session_not_found(session_id))?;
                entry.write().metadata.flags.push(tag.to_string());
                Ok(None)
            }
            "ANALYZE" => {
                let session = self
                    .session(session_id)
                    .ok_or_else(|| DevmeshError::session_not_found(session_id))?;
                let successes = session.history.iter().filter(|i| i.success).count();
                Ok(Some(json!({
                    "interactions": session.history.len(),
                    "successfulInteractions": successes,
                    "inputTokens": session.metadata.token_usage.input_tokens,
                    "outputTokens": session.metadata.token_usage.output_tokens,
                    "estimatedCostUsd": session.metadata.token_usage.estimated_cost_usd,
                })))
            }
            other => Err(DevmeshError::bad_user_input(format!(
                "unknown batch operation '{other}'"
            ))),
        }
    }

    // ========================================================================
    // Templates
    // ========================================================================

    /// Snapshot a session into a reusable template.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND` for unknown sessions.
    pub fn create_template(
        &self,
        session_id: &str,
        name: String,
        tags: Vec<String>,
        variables: Vec<TemplateVariable>,
        initial_context: String,
        include_history: bool,
    ) -> Result<SessionTemplate> {
        let session = self
            .session(session_id)
            .ok_or_else(|| DevmeshError::session_not_found(session_id))?;

        let template = SessionTemplate {
            id: format!("tmpl_{}", uuid::Uuid::new_v4().simple()),
            name,
            tags,
            variables,
            initial_context,
            default_flags: session.metadata.flags.clone(),
            default_model: session.metadata.model.clone(),
            history: if include_history {
                session.history.clone()
            } else {
                Vec::new()
            },
            usage_count: 0,
            last_used_at: None,
            created_at: Utc::now(),
        };
        self.templates.insert(template.id.clone(), template.clone());
        Ok(template)
    }

    /// Instantiate a session from a template.
    ///
    /// # Errors
    ///
    /// `BAD_USER_INPUT` for unknown templates.
    pub fn create_from_template(
        &self,
        template_id: &str,
        name: Option<String>,
    ) -> Result<AgentSession> {
        let mut template = self
            .templates
            .get_mut(template_id)
            .ok_or_else(|| DevmeshError::not_found("SessionTemplate", template_id))?;

        let id = format!("sess_{}", uuid::Uuid::new_v4().simple());
        let mut session = AgentSession::new(
            id,
            self.config.workspace_root.display().to_string(),
            template.default_model.clone(),
        );
        session.metadata.flags = template.default_flags.clone();
        session.metadata.project_context = Some(template.initial_context.clone());
        session.history = template.history.clone();
        session.name = name.or_else(|| Some(template.name.clone()));

        template.usage_count += 1;
        template.last_used_at = Some(Utc::now());

        let snapshot = session.clone();
        self.register(session);
        Ok(snapshot)
    }

    /// All templates, most recently created first.
    #[must_use]
    pub fn templates(&self) -> Vec<SessionTemplate> {
        let mut all: Vec<SessionTemplate> =
            self.templates.iter().map(|t| t.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    // ========================================================================
    // Handoff and statistics
    // ========================================================================

    /// Write a human-readable handoff document for a session.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND` for unknown sessions; I/O errors from the
    /// write.
    pub fn create_handoff(&self, session_id: &str) -> Result<PathBuf> {
        let session = self
            .session(session_id)
            .ok_or_else(|| DevmeshError::session_not_found(session_id))?;

        let dir = self.config.handoff_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "handoff-{}-{}.md",
            session.id,
            Utc::now().format("%Y-%m-%dT%H-%M-%S")
        ));

        let mut doc = String::new();
        doc.push_str(&format!("# Session handoff: {}\n\n", session.id));
        if let Some(name) = &session.name {
            doc.push_str(&format!("**Name:** {name}\n\n"));
        }
        doc.push_str(&format!("- Status: {:?}\n", session.status));
        doc.push_str(&format!("- Working directory: {}\n", session.working_dir));
        doc.push_str(&format!("- Model: {}\n", session.metadata.model));
        doc.push_str(&format!(
            "- Tokens: {} in / {} out (~${:.4})\n",
            session.metadata.token_usage.input_tokens,
            session.metadata.token_usage.output_tokens,
            session.metadata.token_usage.estimated_cost_usd
        ));
        if let Some(context) = &session.metadata.project_context {
            doc.push_str(&format!("\n## Context\n\n{context}\n"));
        }
        doc.push_str(&format!("\n## History ({} interactions)\n\n", session.history.len()));
        for (idx, interaction) in session.history.iter().enumerate() {
            doc.push_str(&format!(
                "### {} - {}\n\n**Prompt:**\n\n{}\n\n",
                idx + 1,
                interaction.timestamp.to_rfc3339(),
                interaction.prompt
            ));
            if let Some(response) = &interaction.response {
                doc.push_str(&format!("**Response:**\n\n{response}\n\n"));
            }
        }

        std::fs::write(&path, doc)?;
        info!(session_id, path = %path.display(), "handoff written");
        Ok(path)
    }

    /// Aggregate counts over the live registry.
    #[must_use]
    pub fn statistics(&self) -> Value {
        let sessions = self.sessions();
        let mut by_status = serde_json::Map::new();
        let mut usage_in = 0_u64;
        let mut usage_out = 0_u64;
        let mut cost = 0.0_f64;
        for session in &sessions {
            let key = format!("{:?}", session.status).to_uppercase();
            let count = by_status.get(&key).and_then(Value::as_u64).unwrap_or(0);
            by_status.insert(key, json!(count + 1));
            usage_in += session.metadata.token_usage.input_tokens;
            usage_out += session.metadata.token_usage.output_tokens;
            cost += session.metadata.token_usage.estimated_cost_usd;
        }
        json!({
            "totalSessions": sessions.len(),
            "byStatus": by_status,
            "inputTokens": usage_in,
            "outputTokens": usage_out,
            "estimatedCostUsd": cost,
        })
    }
}

fn share_code() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghjkmnpqrstuvwxyz23456789";
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::testing::{FakeLauncher, FakeReply};

    fn manager_with(launcher: Arc<FakeLauncher>) -> Arc<SessionManager> {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentServiceConfig {
            workspace_root: tmp.path().to_path_buf(),
            archive_dir: tmp.path().join("archives"),
            ..AgentServiceConfig::default()
        };
        // The tempdir outlives the test through the leaked path.
        std::mem::forget(tmp);
        SessionManager::new(config, launcher)
    }

    #[tokio::test]
    async fn test_run_command_completes_interaction() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher.clone());
        let id = manager.create_session(&ExecuteOptions::default());

        let interaction = manager.run_command(&id, "hello").await.unwrap();
        assert!(interaction.success);
        assert_eq!(interaction.response.as_deref(), Some("done"));
        assert!(interaction.upstream_session_id.is_some());

        let session = manager.session(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.history.len(), 1);
        assert!(session.metadata.token_usage.output_tokens > 0);
    }

    #[tokio::test]
    async fn test_exactly_one_final_frame() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher);
        let id = manager.create_session(&ExecuteOptions::default());
        let mut output = manager.subscribe_output(&id).unwrap();

        manager.run_command(&id, "hello").await.unwrap();

        let mut finals = 0;
        while let Ok(frame) = output.try_recv() {
            if frame.is_final {
                finals += 1;
                assert_eq!(frame.output_type, OutputType::Final);
            }
        }
        assert_eq!(finals, 1);
    }

    #[tokio::test]
    async fn test_execute_command_unknown_session() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher);
        let err = manager
            .execute_command(
                "hi".to_string(),
                ExecuteOptions {
                    session_id: Some("missing".to_string()),
                    ..ExecuteOptions::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_kill_is_idempotent_and_terminal() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher);
        let id = manager.create_session(&ExecuteOptions::default());

        assert!(manager.kill_session(&id).await);
        assert!(manager.kill_session(&id).await);
        assert!(manager.kill_session("never-existed").await);

        assert_eq!(
            manager.session(&id).unwrap().status,
            SessionStatus::Terminated
        );
        // Terminated sessions reject new commands.
        let err = manager.run_command(&id, "more").await.unwrap_err();
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_fork_takes_prefix_and_correlator() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher.clone());
        let id = manager.create_session(&ExecuteOptions::default());

        for prompt in ["one", "two", "three"] {
            manager.run_command(&id, prompt).await.unwrap();
        }
        let parent = manager.session(&id).unwrap();
        assert_eq!(parent.history.len(), 3);

        let fork = manager
            .fork_session(&id, Some(1), Some("fork".to_string()), true)
            .unwrap();
        assert_eq!(fork.history.len(), 2);
        assert_eq!(fork.parent_session_id.as_deref(), Some(id.as_str()));
        assert_eq!(fork.fork_point, Some(1));
        assert_eq!(
            fork.metadata.upstream_session_id,
            parent.history[1].upstream_session_id
        );

        // Continuing the fork does not touch the parent's history.
        manager.run_command(&fork.id, "four").await.unwrap();
        assert_eq!(manager.session(&fork.id).unwrap().history.len(), 3);
        assert_eq!(manager.session(&id).unwrap().history.len(), 3);
    }

    #[tokio::test]
    async fn test_fork_clamps_out_of_range_index() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher);
        let id = manager.create_session(&ExecuteOptions::default());
        manager.run_command(&id, "only").await.unwrap();

        let negative = manager.fork_session(&id, Some(-1), None, true).unwrap();
        assert_eq!(negative.fork_point, Some(0));

        let past_tail = manager.fork_session(&id, Some(99), None, true).unwrap();
        assert_eq!(past_tail.fork_point, Some(0));
    }

    #[tokio::test]
    async fn test_per_session_commands_are_serial() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher.clone());
        let id = manager.create_session(&ExecuteOptions::default());

        // Queue a slow reply then a fast one; FIFO order must hold.
        manager.run_command(&id, "warm-up").await.unwrap();
        let transport = launcher.launched()[0].clone();
        transport.push_reply(FakeReply {
            delay: Duration::from_millis(50),
            result: "first".to_string(),
            ..FakeReply::default()
        });
        transport.push_reply(FakeReply {
            delay: Duration::from_millis(1),
            result: "second".to_string(),
            ..FakeReply::default()
        });

        let m1 = manager.clone();
        let id1 = id.clone();
        let a = tokio::spawn(async move { m1.run_command(&id1, "a").await.unwrap() });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let m2 = manager.clone();
        let id2 = id.clone();
        let b = tokio::spawn(async move { m2.run_command(&id2, "b").await.unwrap() });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.response.as_deref(), Some("first"));
        assert_eq!(b.response.as_deref(), Some("second"));

        let session = manager.session(&id).unwrap();
        assert_eq!(session.history[1].prompt, "a");
        assert_eq!(session.history[2].prompt, "b");
    }

    #[tokio::test]
    async fn test_crash_moves_session_to_error() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher.clone());
        let id = manager.create_session(&ExecuteOptions::default());
        manager.run_command(&id, "warm-up").await.unwrap();

        let transport = launcher.launched()[0].clone();
        // A reply that would arrive long after the crash below.
        transport.push_reply(FakeReply {
            delay: Duration::from_secs(5),
            ..FakeReply::default()
        });
        let mut output = manager.subscribe_output(&id).unwrap();

        let m = manager.clone();
        let id2 = id.clone();
        let task = tokio::spawn(async move { m.run_command(&id2, "boom").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.crash();

        assert!(task.await.unwrap().is_err());
        assert_eq!(
            manager.session(&id).unwrap().status,
            SessionStatus::Error
        );

        // The open subscription received a terminal frame.
        let mut saw_final = false;
        while let Ok(frame) = output.try_recv() {
            saw_final |= frame.is_final;
        }
        assert!(saw_final);
    }

    #[tokio::test]
    async fn test_archive_removes_from_registry() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher);
        let id = manager.create_session(&ExecuteOptions::default());
        manager.run_command(&id, "hello").await.unwrap();

        let path = manager.archive_session(&id).await.unwrap();
        assert!(path.exists());
        assert!(manager.session(&id).is_none());

        let blob = std::fs::read_to_string(path).unwrap();
        assert!(blob.contains("hello"));
    }

    #[tokio::test]
    async fn test_share_and_redeem() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher);
        let id = manager.create_session(&ExecuteOptions::default());

        let grant = manager
            .share_session(&id, Duration::from_secs(3600))
            .unwrap();
        assert_eq!(grant.session_id, id);
        assert!(manager.redeem_share(&grant.code).is_some());
        assert!(manager.redeem_share("bogus").is_none());
    }

    #[tokio::test]
    async fn test_batch_operation_continues_on_error() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher);
        let id = manager.create_session(&ExecuteOptions::default());

        let results = manager
            .batch_operation(
                &[id.clone(), "missing".to_string()],
                "ANALYZE",
                None,
            )
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);
    }

    #[tokio::test]
    async fn test_template_roundtrip() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher);
        let id = manager.create_session(&ExecuteOptions {
            flags: vec!["--verbose".to_string()],
            ..ExecuteOptions::default()
        });
        manager.run_command(&id, "seed").await.unwrap();

        let template = manager
            .create_template(
                &id,
                "review".to_string(),
                vec!["code".to_string()],
                vec![],
                "You review Rust code.".to_string(),
                true,
            )
            .unwrap();
        assert_eq!(template.default_flags, vec!["--verbose".to_string()]);
        assert_eq!(template.history.len(), 1);

        let session = manager.create_from_template(&template.id, None).unwrap();
        assert_eq!(
            session.metadata.project_context.as_deref(),
            Some("You review Rust code.")
        );
        assert_eq!(manager.templates()[0].usage_count, 1);
    }

    #[tokio::test]
    async fn test_handoff_document_written() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher);
        let id = manager.create_session(&ExecuteOptions::default());
        manager.run_command(&id, "document me").await.unwrap();

        let path = manager.create_handoff(&id).unwrap();
        assert!(path.exists());
        let doc = std::fs::read_to_string(path).unwrap();
        assert!(doc.contains("Session handoff"));
        assert!(doc.contains("document me"));
    }

    #[tokio::test]
    async fn test_statistics_counts_by_status() {
        let launcher = FakeLauncher::new();
        let manager = manager_with(launcher);
        let a = manager.create_session(&ExecuteOptions::default());
        let _b = manager.create_session(&ExecuteOptions::default());
        manager.kill_session(&a).await;

        let stats = manager.statistics();
        assert_eq!(stats["totalSessions"], json!(2));
        assert_eq!(stats["byStatus"]["TERMINATED"], json!(1));
        assert_eq!(stats["byStatus"]["IDLE"], json!(1));
    }
}
