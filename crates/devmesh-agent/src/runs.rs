//! In-memory agent-run records.
//!
//! Writes to one run id are serialized behind the store lock; reads
//! return snapshots. Indexes by repository and status are maintained
//! alongside the primary map so filtered queries don't scan the world.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use devmesh_error::{DevmeshError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::types::{AgentRun, RunStatus};

/// Filter for run queries; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Match this repository.
    pub repository: Option<String>,
    /// Match this status.
    pub status: Option<RunStatus>,
    /// Runs started at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Runs started at or before this time.
    pub until: Option<DateTime<Utc>>,
}

/// Aggregates over the stored runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatistics {
    /// Total stored runs.
    pub total: usize,
    /// Counts per status name.
    pub by_status: HashMap<String, usize>,
    /// Counts per repository.
    pub by_repository: HashMap<String, usize>,
    /// Mean duration over successful runs (ms).
    pub average_duration_ms: Option<f64>,
    /// `SUCCESS / terminal` ratio.
    pub success_rate: f64,
}

#[derive(Default)]
struct Inner {
    runs:      HashMap<String, AgentRun>,
    by_repo:   HashMap<String, HashSet<String>>,
    by_status: HashMap<&'static str, HashSet<String>>,
}

/// The store.
#[derive(Default)]
pub struct RunStore {
    inner: RwLock<Inner>,
}

fn status_key(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Queued => "QUEUED",
        RunStatus::Running => "RUNNING",
        RunStatus::Success => "SUCCESS",
        RunStatus::Failed => "FAILED",
        RunStatus::Cancelled => "CANCELLED",
        RunStatus::Retrying => "RETRYING",
    }
}

impl RunStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new QUEUED run and return it.
    pub fn create(&self, repository: impl Into<String>, input: Value) -> AgentRun {
        let run = AgentRun {
            typename:      AgentRun::TYPENAME,
            id:            format!("run_{}", uuid::Uuid::new_v4().simple()),
            repository:    repository.into(),
            status:        RunStatus::Queued,
            started_at:    Utc::now(),
            completed_at:  None,
            duration_ms:   None,
            input,
            output:        None,
            error:         None,
            retry_count:   0,
            parent_run_id: None,
        };
        self.insert(run.clone());
        run
    }

    fn insert(&self, run: AgentRun) {
        let mut inner = self.inner.write();
        inner
            .by_repo
            .entry(run.repository.clone())
            .or_default()
            .insert(run.id.clone());
        inner
            .by_status
            .entry(status_key(run.status))
            .or_default()
            .insert(run.id.clone());
        inner.runs.insert(run.id.clone(), run);
    }

    fn update_status(inner: &mut Inner, id: &str, to: RunStatus) {
        if let Some(run) = inner.runs.get_mut(id) {
            let from_key = status_key(run.status);
            let to_key = status_key(to);
            run.status = to;
            if let Some(set) = inner.by_status.get_mut(from_key) {
                set.remove(id);
            }
            inner.by_status.entry(to_key).or_default().insert(id.to_string());
        }
    }

    /// Fetch one run.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<AgentRun> {
        self.inner.read().runs.get(id).cloned()
    }

    /// Query runs matching a filter, newest first.
    #[must_use]
    pub fn query(&self, filter: &RunFilter) -> Vec<AgentRun> {
        let inner = self.inner.read();

        // Narrow by the most selective index available.
        let candidate_ids: Vec<String> = if let Some(repo) = &filter.repository {
            inner
                .by_repo
                .get(repo)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        } else if let Some(status) = filter.status {
            inner
                .by_status
                .get(status_key(status))
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            inner.runs.keys().cloned().collect()
        };

        let mut matched: Vec<AgentRun> = candidate_ids
            .iter()
            .filter_map(|id| inner.runs.get(id))
            .filter(|run| {
                filter
                    .status
                    .is_none_or(|wanted| run.status == wanted)
                    && filter
                        .repository
                        .as_ref()
                        .is_none_or(|repo| &run.repository == repo)
                    && filter.since.is_none_or(|t| run.started_at >= t)
                    && filter.until.is_none_or(|t| run.started_at <= t)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matched
    }

    /// Move a QUEUED run to RUNNING.
    pub fn mark_running(&self, id: &str) {
        let mut inner = self.inner.write();
        Self::update_status(&mut inner, id, RunStatus::Running);
    }

    /// Complete a run successfully.
    pub fn mark_success(&self, id: &str, output: Value) {
        self.finish(id, RunStatus::Success, Some(output), None);
    }

    /// Complete a run with an error.
    pub fn mark_failed(&self, id: &str, error: impl Into<String>) {
        self.finish(id, RunStatus::Failed, None, Some(error.into()));
    }

    fn finish(&self, id: &str, status: RunStatus, output: Option<Value>, error: Option<String>) {
        let mut inner = self.inner.write();
        Self::update_status(&mut inner, id, status);
        if let Some(run) = inner.runs.get_mut(id) {
            let completed = Utc::now();
            run.completed_at = Some(completed);
            run.duration_ms = Some(
                (completed - run.started_at)
                    .num_milliseconds()
                    .max(0) as u64,
            );
            run.output = output;
            run.error = error;
        }
    }

    /// Cancel a RUNNING or QUEUED run; a no-op in terminal states.
    ///
    /// # Errors
    ///
    /// `BAD_USER_INPUT` for unknown run ids.
    pub fn cancel(&self, id: &str) -> Result<AgentRun> {
        let mut inner = self.inner.write();
        let status = inner
            .runs
            .get(id)
            .map(|run| run.status)
            .ok_or_else(|| DevmeshError::not_found("AgentRun", id))?;

        if matches!(status, RunStatus::Running | RunStatus::Queued) {
            Self::update_status(&mut inner, id, RunStatus::Cancelled);
            if let Some(run) = inner.runs.get_mut(id) {
                let completed = Utc::now();
                run.completed_at = Some(completed);
                run.duration_ms = Some(
                    (completed - run.started_at)
                        .num_milliseconds()
                        .max(0) as u64,
                );
            }
        }
        Ok(inner.runs.get(id).cloned().expect("checked above"))
    }

    /// Retry a FAILED or CANCELLED run: a new QUEUED run with
    /// `parent_run_id` pointing at the source and `retry_count + 1`.
    /// The source run moves to RETRYING.
    ///
    /// # Errors
    ///
    /// `BAD_USER_INPUT` when the source is unknown or not retryable.
    pub fn retry(&self, id: &str) -> Result<AgentRun> {
        let source = self
            .get(id)
            .ok_or_else(|| DevmeshError::not_found("AgentRun", id))?;

        if !source.status.is_retryable() {
            return Err(DevmeshError::bad_user_input_at(
                format!(
                    "run {id} has status {:?} and cannot be retried",
                    source.status
                ),
                "retryAgentRun.id",
            ));
        }

        let retry = AgentRun {
            typename:      AgentRun::TYPENAME,
            id:            format!("run_{}", uuid::Uuid::new_v4().simple()),
            repository:    source.repository.clone(),
            status:        RunStatus::Queued,
            started_at:    Utc::now(),
            completed_at:  None,
            duration_ms:   None,
            input:         source.input.clone(),
            output:        None,
            error:         None,
            retry_count:   source.retry_count + 1,
            parent_run_id: Some(source.id.clone()),
        };
        self.insert(retry.clone());

        {
            let mut inner = self.inner.write();
            Self::update_status(&mut inner, id, RunStatus::Retrying);
        }
        info!(source = %id, retry = %retry.id, "run retried");
        Ok(retry)
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn statistics(&self) -> RunStatistics {
        let inner = self.inner.read();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut by_repository: HashMap<String, usize> = HashMap::new();
        let mut success_durations = Vec::new();
        let mut terminal = 0_usize;
        let mut successes = 0_usize;

        for run in inner.runs.values() {
            *by_status.entry(status_key(run.status).to_string()).or_default() += 1;
            *by_repository.entry(run.repository.clone()).or_default() += 1;
            if run.status.is_terminal() {
                terminal += 1;
            }
            if run.status == RunStatus::Success {
                successes += 1;
                if let Some(ms) = run.duration_ms {
                    success_durations.push(ms as f64);
                }
            }
        }

        let average_duration_ms = if success_durations.is_empty() {
            None
        } else {
            Some(success_durations.iter().sum::<f64>() / success_durations.len() as f64)
        };
        let success_rate = if terminal == 0 {
            0.0
        } else {
            successes as f64 / terminal as f64
        };

        RunStatistics {
            total: inner.runs.len(),
            by_status,
            by_repository,
            average_duration_ms,
            success_rate,
        }
    }

    /// Delete runs older than the cutoff; returns how many were
    /// removed.
    pub fn delete_older_than(&self, cutoff_days: i64) -> usize {
        let cutoff = Utc::now() - Duration::days(cutoff_days);
        let mut inner = self.inner.write();
        let doomed: Vec<String> = inner
            .runs
            .values()
            .filter(|run| run.started_at < cutoff)
            .map(|run| run.id.clone())
            .collect();

        for id in &doomed {
            if let Some(run) = inner.runs.remove(id) {
                if let Some(set) = inner.by_repo.get_mut(&run.repository) {
                    set.remove(id);
                }
                if let Some(set) = inner.by_status.get_mut(status_key(run.status)) {
                    set.remove(id);
                }
            }
        }
        info!(removed = doomed.len(), cutoff_days, "old runs deleted");
        doomed.len()
    }
}
