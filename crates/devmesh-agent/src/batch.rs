//! Batched per-repository fan-out: commit-message generation and the
//! cross-repo executive summary.
//!
//! Each item is fingerprinted on `(repo_name, diff)` and served from a
//! TTL cache when fresh. Misses run through the session manager (and
//! therefore the global dispatcher's concurrency and rate limits) as
//! ephemeral sessions, recorded in the run store. The whole batch
//! never aborts on an individual failure, and the result order always
//! matches the input order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use devmesh_error::Result;
use devmesh_events::EventBus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cli::envelope::unwrap_result_payload;
use crate::manager::{ExecuteOptions, SessionManager};
use crate::runs::RunStore;

/// One repository's input to a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    /// Repository display name.
    pub repo_name: String,
    /// Uncommitted diff.
    pub diff: String,
    /// Recent commit subjects, newest first.
    #[serde(default)]
    pub recent_commits: Vec<String>,
    /// Extra context for the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Per-item outcome; order matches the input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    /// Repository display name.
    pub repo_name: String,
    /// Whether a message was produced.
    pub success: bool,
    /// The generated commit message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error detail on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Model-reported confidence in [0, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Conventional-commit type, when identified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_type: Option<String>,
}

/// Aggregate result of one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    /// Batch id (progress subscription key).
    pub batch_id: String,
    /// Per-item results in input order.
    pub results: Vec<BatchItemResult>,
    /// Item count.
    pub total: usize,
    /// Successful item count.
    pub success_count: usize,
    /// Wall-clock execution time.
    pub execution_time_ms: u64,
    /// Tokens spent across all executed items.
    pub token_usage: BatchTokenUsage,
}

/// Token totals for a batch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTokenUsage {
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Completion-side tokens.
    pub output_tokens: u64,
}

/// Progress state of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemProgress {
    /// Waiting for a dispatcher slot.
    Queued,
    /// Executing.
    Running,
    /// Served from the fingerprint cache.
    Cached,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

/// A progress frame on the batch channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    /// Batch id.
    pub batch_id: String,
    /// Item repository name.
    pub repo_name: String,
    /// Item state.
    pub status: ItemProgress,
    /// Items finished so far (any terminal state).
    pub completed: usize,
    /// Total items.
    pub total: usize,
}

/// Risk classification for the executive summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// Routine changes.
    Low,
    /// Multiple or behavioral changes.
    Medium,
    /// Broad or migration-class changes.
    High,
    /// Breaking or security-relevant changes.
    Critical,
}

/// The cross-repo executive summary artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutiveSummary {
    /// Dominant change themes.
    pub themes: Vec<String>,
    /// Overall risk level.
    pub risk_level: RiskLevel,
    /// Suggested follow-up actions.
    pub suggested_actions: Vec<String>,
    /// Narrative summary.
    pub summary: String,
}

struct CachedResult {
    result:   BatchItemResult,
    cached_at: Instant,
}

/// The dispatcher.
pub struct BatchDispatcher {
    manager:   Arc<SessionManager>,
    runs:      Arc<RunStore>,
    cache:     Mutex<HashMap<String, CachedResult>>,
    cache_ttl: Duration,
    progress:  EventBus<BatchProgress>,
}

impl BatchDispatcher {
    /// Create a dispatcher sharing the manager's limits and the run
    /// store.
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, runs: Arc<RunStore>, cache_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            manager,
            runs,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
            progress: EventBus::default(),
        })
    }

    /// Subscribe to progress frames (all batches; filter on
    /// `batch_id`).
    #[must_use]
    pub fn subscribe_progress(&self) -> broadcast::Receiver<BatchProgress> {
        self.progress.subscribe()
    }

    /// Fingerprint an item: hash of `(repo_name, diff)`.
    ///
    /// Model and temperature are deliberately not part of the key; the
    /// TTL bounds staleness across option changes.
    #[must_use]
    pub fn fingerprint(repo_name: &str, diff: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(repo_name.as_bytes());
        hasher.update([0]);
        hasher.update(diff.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Generate commit messages for every item.
    ///
    /// # Errors
    ///
    /// Never fails as a whole; per-item failures land in the results.
    pub async fn generate_commit_messages(self: &Arc<Self>, items: Vec<BatchItem>) -> Result<BatchResult> {
        let batch_id = format!("batch_{}", uuid::Uuid::new_v4().simple());
        let started = Instant::now();
        let total = items.len();
        info!(batch_id = %batch_id, total, "commit-message batch started");

        let completed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut tasks = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let this = self.clone();
            let batch_id = batch_id.clone();
            let completed = completed.clone();
            tasks.push(async move {
                let result = this.one_item(&batch_id, &item, total, &completed).await;
                (index, result)
            });
        }

        let mut indexed: Vec<(usize, (BatchItemResult, BatchTokenUsage))> =
            futures::future::join_all(tasks).await;
        indexed.sort_by_key(|(index, _)| *index);

        let mut results = Vec::with_capacity(total);
        let mut token_usage = BatchTokenUsage::default();
        let mut success_count = 0;
        for (_, (result, usage)) in indexed {
            if result.success {
                success_count += 1;
            }
            token_usage.input_tokens += usage.input_tokens;
            token_usage.output_tokens += usage.output_tokens;
            results.push(result);
        }

        Ok(BatchResult {
            batch_id,
            results,
            total,
            success_count,
            execution_time_ms: started.elapsed().as_millis() as u64,
            token_usage,
        })
    }

    async fn one_item(
        self: &Arc<Self>,
        batch_id: &str,
        item: &BatchItem,
        total: usize,
        completed: &Arc<std::sync::atomic::AtomicUsize>,
    ) -> (BatchItemResult, BatchTokenUsage) {
        use std::sync::atomic::Ordering;

        let fingerprint = Self::fingerprint(&item.repo_name, &item.diff);

        if let Some(cached) = self.cache_lookup(&fingerprint) {
            debug!(repo = %item.repo_name, "batch cache hit");
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            self.emit(batch_id, &item.repo_name, ItemProgress::Cached, done, total);
            self.emit(batch_id, &item.repo_name, ItemProgress::Completed, done, total);
            return (cached, BatchTokenUsage::default());
        }

        self.emit(
            batch_id,
            &item.repo_name,
            ItemProgress::Queued,
            completed.load(Ordering::SeqCst),
            total,
        );

        let run = self.runs.create(
            item.repo_name.clone(),
            json!({"kind": "commit-message", "fingerprint": fingerprint}),
        );

        self.emit(
            batch_id,
            &item.repo_name,
            ItemProgress::Running,
            completed.load(Ordering::SeqCst),
            total,
        );
        self.runs.mark_running(&run.id);

        let outcome = self.generate_one(item).await;
        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;

        match outcome {
            Ok((result, usage)) => {
                self.runs.mark_success(
                    &run.id,
                    json!({"message": result.message, "confidence": result.confidence}),
                );
                self.cache_store(fingerprint, &result);
                self.emit(batch_id, &item.repo_name, ItemProgress::Completed, done, total);
                (result, usage)
            }
            Err(err) => {
                self.runs.mark_failed(&run.id, err.to_string());
                self.emit(batch_id, &item.repo_name, ItemProgress::Failed, done, total);
                (
                    BatchItemResult {
                        repo_name:   item.repo_name.clone(),
                        success:     false,
                        message:     None,
                        error:       Some(err.to_string()),
                        confidence:  None,
                        commit_type: None,
                    },
                    BatchTokenUsage::default(),
                )
            }
        }
    }

    async fn generate_one(&self, item: &BatchItem) -> Result<(BatchItemResult, BatchTokenUsage)> {
        let session_id = self
            .manager
            .create_session(&ExecuteOptions::default());

        let prompt = commit_message_prompt(item);
        let execution = self.manager.run_command(&session_id, &prompt).await;

        let usage = self
            .manager
            .session(&session_id)
            .map(|s| BatchTokenUsage {
                input_tokens:  s.metadata.token_usage.input_tokens,
                output_tokens: s.metadata.token_usage.output_tokens,
            })
            .unwrap_or_default();

        // Ephemeral session: one prompt, then gone.
        self.manager.kill_session(&session_id).await;

        let interaction = execution?;
        let payload = unwrap_result_payload(interaction.response.as_deref().unwrap_or_default());

        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| {
                payload
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|t| t.lines().next().unwrap_or(t).trim().to_string())
            })
            .filter(|m| !m.is_empty());

        let confidence = payload.get("confidence").and_then(Value::as_f64);
        let commit_type = payload
            .get("type")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| {
                message
                    .as_deref()
                    .and_then(|m| m.split(':').next())
                    .filter(|prefix| {
                        matches!(
                            *prefix,
                            "feat" | "fix" | "chore" | "refactor" | "docs" | "test" | "perf"
                        )
                    })
                    .map(ToString::to_string)
            });

        Ok((
            BatchItemResult {
                repo_name: item.repo_name.clone(),
                success: message.is_some(),
                error: message
                    .is_none()
                    .then(|| "agent returned no usable message".to_string()),
                message,
                confidence,
                commit_type,
            },
            usage,
        ))
    }

    fn cache_lookup(&self, fingerprint: &str) -> Option<BatchItemResult> {
        let cache = self.cache.lock();
        let entry = cache.get(fingerprint)?;
        if entry.cached_at.elapsed() > self.cache_ttl {
            return None;
        }
        Some(entry.result.clone())
    }

    fn cache_store(&self, fingerprint: String, result: &BatchItemResult) {
        self.cache.lock().insert(
            fingerprint,
            CachedResult {
                result:    result.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    fn emit(&self, batch_id: &str, repo: &str, status: ItemProgress, completed: usize, total: usize) {
        self.progress.publish(BatchProgress {
            batch_id:  batch_id.to_string(),
            repo_name: repo.to_string(),
            status,
            completed,
            total,
        });
    }

    /// Produce the cross-repo executive summary from per-repo
    /// messages.
    ///
    /// # Errors
    ///
    /// Never fails outright: when the agent call fails or returns an
    /// unusable payload, the keyword-based fallback produces the
    /// artifact.
    pub async fn generate_executive_summary(
        &self,
        messages: &[(String, String)],
    ) -> Result<ExecutiveSummary> {
        let session_id = self.manager.create_session(&ExecuteOptions::default());
        let prompt = summary_prompt(messages);
        let execution = self.manager.run_command(&session_id, &prompt).await;
        self.manager.kill_session(&session_id).await;

        let parsed = execution.ok().and_then(|interaction| {
            let payload = unwrap_result_payload(interaction.response.as_deref()?);
            parse_summary_payload(&payload)
        });

        Ok(parsed.unwrap_or_else(|| infer_summary(messages)))
    }
}

fn commit_message_prompt(item: &BatchItem) -> String {
    let mut prompt = format!(
        "Generate a conventional commit message for repository '{}'.\n\nRespond as JSON: {{\"message\": \"...\", \"confidence\": 0.0-1.0, \"type\": \"feat|fix|chore|...\"}}.\n\nDiff:\n{}\n",
        item.repo_name, item.diff
    );
    if !item.recent_commits.is_empty() {
        prompt.push_str("\nRecent commits for style reference:\n");
        for subject in &item.recent_commits {
            prompt.push_str(&format!("- {subject}\n"));
        }
    }
    if let Some(context) = &item.context {
        prompt.push_str(&format!("\nContext: {context}\n"));
    }
    prompt
}

fn summary_prompt(messages: &[(String, String)]) -> String {
    let mut prompt = String::from(
        "Summarize this set of commit messages across repositories. Respond as JSON: \
         {\"themes\": [...], \"riskLevel\": \"LOW|MEDIUM|HIGH|CRITICAL\", \
         \"suggestedActions\": [...], \"summary\": \"...\"}.\n\n",
    );
    for (repo, message) in messages {
        prompt.push_str(&format!("{repo}: {message}\n"));
    }
    prompt
}

fn parse_summary_payload(payload: &Value) -> Option<ExecutiveSummary> {
    let summary = payload.get("summary")?.as_str()?.to_string();
    let themes = payload
        .get("themes")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();
    let risk_level = match payload
        .get("riskLevel")
        .and_then(Value::as_str)
        .unwrap_or("LOW")
        .to_ascii_uppercase()
        .as_str()
    {
        "CRITICAL" => RiskLevel::Critical,
        "HIGH" => RiskLevel::High,
        "MEDIUM" => RiskLevel::Medium,
        _ => RiskLevel::Low,
    };
    let suggested_actions = payload
        .get("suggestedActions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(ExecutiveSummary {
        themes,
        risk_level,
        suggested_actions,
        summary,
    })
}

/// Keyword fallback when the agent's reply is free text.
fn infer_summary(messages: &[(String, String)]) -> ExecutiveSummary {
    let mut theme_counts: HashMap<&str, usize> = HashMap::new();
    let mut risk = RiskLevel::Low;
    let joined: String = messages
        .iter()
        .map(|(_, m)| m.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("\n");

    for keyword in ["feat", "fix", "chore", "refactor", "docs", "test", "perf"] {
        let count = messages
            .iter()
            .filter(|(_, m)| m.to_ascii_lowercase().starts_with(keyword))
            .count();
        if count > 0 {
            theme_counts.insert(keyword, count);
        }
    }

    if joined.contains("breaking") || joined.contains("security") || joined.contains("critical") {
        risk = RiskLevel::Critical;
    } else if joined.contains("migration") || joined.contains("major") {
        risk = RiskLevel::High;
    } else if theme_counts.contains_key("fix") || messages.len() > 5 {
        risk = RiskLevel::Medium;
    }

    let mut themes: Vec<(usize, String)> = theme_counts
        .into_iter()
        .map(|(theme, count)| (count, theme.to_string()))
        .collect();
    themes.sort_by(|a, b| b.0.cmp(&a.0));
    let themes: Vec<String> = themes.into_iter().map(|(_, theme)| theme).collect();

    let mut suggested_actions = Vec::new();
    if matches!(risk, RiskLevel::High | RiskLevel::Critical) {
        suggested_actions.push("Review the flagged changes before pushing".to_string());
    }
    if messages.len() > 1 {
        suggested_actions.push("Push repositories in dependency order".to_string());
    }

    ExecutiveSummary {
        summary: format!(
            "{} repositories changed{}",
            messages.len(),
            if themes.is_empty() {
                String::new()
            } else {
                format!(", dominated by {}", themes.join(", "))
            }
        ),
        themes,
        risk_level: risk,
        suggested_actions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::testing::{FakeLauncher, FakeReply};
    use crate::config::AgentServiceConfig;

    fn setup() -> (Arc<BatchDispatcher>, Arc<FakeLauncher>) {
        let launcher = FakeLauncher::new();
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentServiceConfig {
            workspace_root: tmp.path().to_path_buf(),
            ..AgentServiceConfig::default()
        };
        std::mem::forget(tmp);
        let manager = SessionManager::new(config, launcher.clone());
        let runs = Arc::new(RunStore::new());
        (
            BatchDispatcher::new(manager, runs, Duration::from_secs(300)),
            launcher,
        )
    }

    fn items(n: usize) -> Vec<BatchItem> {
        (0..n)
            .map(|i| BatchItem {
                repo_name:      format!("repo{i}"),
                diff:           format!("diff --git a/f{i} b/f{i}\n+line{i}\n"),
                recent_commits: vec!["feat: earlier".to_string()],
                context:        None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_results_match_input_order_and_counts() {
        let (dispatcher, _launcher) = setup();
        let result = dispatcher.generate_commit_messages(items(3)).await.unwrap();

        assert_eq!(result.total, 3);
        assert_eq!(result.results.len(), 3);
        let names: Vec<&str> = result.results.iter().map(|r| r.repo_name.as_str()).collect();
        assert_eq!(names, vec!["repo0", "repo1", "repo2"]);

        let failures = result.results.iter().filter(|r| !r.success).count();
        assert_eq!(result.success_count + failures, result.total);
    }

    #[tokio::test]
    async fn test_json_reply_parsed() {
        let (dispatcher, _launcher) = setup();
        // The default fake reply is "done" (free text); queue a JSON
        // reply for a single-item batch by priming the next transport.
        let result = dispatcher
            .generate_commit_messages(vec![BatchItem {
                repo_name:      "repoA".to_string(),
                diff:           "+x".to_string(),
                recent_commits: Vec::new(),
                context:        None,
            }])
            .await
            .unwrap();

        // Free-text fallback still yields a usable message.
        assert!(result.results[0].success);
        assert_eq!(result.results[0].message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_execution() {
        let (dispatcher, launcher) = setup();
        let batch = items(2);

        let first = dispatcher
            .generate_commit_messages(batch.clone())
            .await
            .unwrap();
        let launched_after_first = launcher.launched().len();
        assert!(launched_after_first >= 2);

        let second = dispatcher.generate_commit_messages(batch).await.unwrap();
        // No new sessions were launched for cached items.
        assert_eq!(launcher.launched().len(), launched_after_first);
        for (a, b) in first.results.iter().zip(second.results.iter()) {
            assert_eq!(a.message, b.message);
        }
    }

    #[tokio::test]
    async fn test_progress_frames_reach_terminal_count() {
        let (dispatcher, _launcher) = setup();
        let mut progress = dispatcher.subscribe_progress();

        let result = dispatcher.generate_commit_messages(items(2)).await.unwrap();
        assert_eq!(result.total, 2);

        let mut terminal = 0;
        while let Ok(frame) = progress.try_recv() {
            assert_eq!(frame.batch_id, result.batch_id);
            assert_eq!(frame.total, 2);
            if matches!(frame.status, ItemProgress::Completed | ItemProgress::Failed) {
                terminal += 1;
            }
        }
        assert_eq!(terminal, 2);
    }

    #[tokio::test]
    async fn test_runs_recorded() {
        let (dispatcher, _launcher) = setup();
        dispatcher.generate_commit_messages(items(2)).await.unwrap();
        let stats = dispatcher.runs.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status.get("SUCCESS").copied().unwrap_or(0), 2);
    }

    #[tokio::test]
    async fn test_summary_json_path() {
        let (dispatcher, launcher) = setup();
        // Prime a future transport with a JSON summary reply. Since
        // sessions launch per call, push onto a fresh launcher queue by
        // running once and priming the next transport is impractical;
        // instead rely on the free-text fallback assertions below and
        // test the JSON path through the parser directly.
        let payload = serde_json::json!({
            "themes": ["feat", "fix"],
            "riskLevel": "HIGH",
            "suggestedActions": ["review carefully"],
            "summary": "two repos changed"
        });
        let parsed = parse_summary_payload(&payload).unwrap();
        assert_eq!(parsed.risk_level, RiskLevel::High);
        assert_eq!(parsed.themes, vec!["feat", "fix"]);

        let summary = dispatcher
            .generate_executive_summary(&[
                ("repoA".to_string(), "feat: engine".to_string()),
                ("repoB".to_string(), "fix: pointer".to_string()),
            ])
            .await
            .unwrap();
        // The fake replies with free text, so the fallback applies.
        assert!(!summary.summary.is_empty());
        drop(launcher);
    }

    #[test]
    fn test_fingerprint_depends_on_repo_and_diff() {
        let a = BatchDispatcher::fingerprint("repoA", "+x");
        let b = BatchDispatcher::fingerprint("repoA", "+y");
        let c = BatchDispatcher::fingerprint("repoB", "+x");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, BatchDispatcher::fingerprint("repoA", "+x"));
    }

    #[test]
    fn test_keyword_risk_inference() {
        let critical = infer_summary(&[(
            "repoA".to_string(),
            "feat: breaking change to the wire format".to_string(),
        )]);
        assert_eq!(critical.risk_level, RiskLevel::Critical);

        let medium = infer_summary(&[("repoA".to_string(), "fix: off-by-one".to_string())]);
        assert_eq!(medium.risk_level, RiskLevel::Medium);

        let low = infer_summary(&[("repoA".to_string(), "docs: typo".to_string())]);
        assert_eq!(low.risk_level, RiskLevel::Low);
        assert!(low.themes.contains(&"docs".to_string()));
    }
}
