//! In-memory quality state.

use std::collections::HashMap;

use chrono::{DateTime, Duration, DurationRound, Utc};
use dashmap::DashMap;
use devmesh_error::{DevmeshError, Result};
use devmesh_events::EventBus;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::info;

/// Violation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational.
    Info,
    /// Should be fixed.
    Warning,
    /// Must be fixed.
    Error,
}

/// One rule violation bound to a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    /// Stable id derived from (path, rule, line, column, message).
    pub id: String,
    /// Rule identifier (e.g. `no-unused-vars`).
    pub rule: String,
    /// Severity.
    pub severity: Severity,
    /// 1-indexed line.
    pub line: u32,
    /// 1-indexed column.
    pub column: u32,
    /// Analyzer message.
    pub message: String,
    /// Analyzer tool name.
    pub tool: String,
}

impl Violation {
    /// Derive the stable id for a violation's identity tuple.
    #[must_use]
    pub fn derive_id(path: &str, rule: &str, line: u32, column: u32, message: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [path, rule, &line.to_string(), &column.to_string(), message] {
            hasher.update(part.as_bytes());
            hasher.update([0]);
        }
        hex::encode(&hasher.finalize()[..12])
    }
}

/// A tracked file and its current violation set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityFile {
    /// GraphQL typename, carried for entity resolution.
    #[serde(rename = "__typename")]
    pub typename: &'static str,
    /// File path. Entity key.
    pub path: String,
    /// Current violations.
    pub violations: Vec<Violation>,
    /// Last time the file was processed.
    pub last_processed: DateTime<Utc>,
    /// Total times the file has been processed.
    pub process_count: u64,
}

impl QualityFile {
    /// Typename constant used in federation representations.
    pub const TYPENAME: &'static str = "QualityFile";
}

/// An analyzer session: one sweep over a set of files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySession {
    /// Session id.
    pub id: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Files processed so far.
    pub files_processed: u64,
    /// Violations recorded so far.
    pub violations_found: u64,
    /// Originating tool.
    pub tool: String,
}

/// One time bucket of violation counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetric {
    /// Bucket start.
    pub bucket: DateTime<Utc>,
    /// Violations recorded in the bucket, by severity.
    pub errors: u64,
    /// Warning-severity count.
    pub warnings: u64,
    /// Info-severity count.
    pub infos: u64,
    /// Files processed in the bucket.
    pub files_processed: u64,
}

/// Event published when a file's results are recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QualityEvent {
    /// File path.
    pub path: String,
    /// Violation count after recording.
    pub violations: usize,
    /// Session the recording belonged to.
    pub session_id: String,
    /// Recording time.
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct BucketCounters {
    errors:          u64,
    warnings:        u64,
    infos:           u64,
    files_processed: u64,
}

/// The store.
pub struct QualityStore {
    files:    DashMap<String, QualityFile>,
    sessions: DashMap<String, QualitySession>,
    buckets:  parking_lot::Mutex<HashMap<i64, BucketCounters>>,
    events:   EventBus<QualityEvent>,
}

impl Default for QualityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            files:    DashMap::new(),
            sessions: DashMap::new(),
            buckets:  parking_lot::Mutex::new(HashMap::new()),
            events:   EventBus::default(),
        }
    }

    /// Subscribe to recording events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QualityEvent> {
        self.events.subscribe()
    }

    /// Begin an analyzer session.
    pub fn begin_session(&self, tool: impl Into<String>) -> QualitySession {
        let session = QualitySession {
            id:               format!("qs_{}", uuid::Uuid::new_v4().simple()),
            started_at:       Utc::now(),
            completed_at:     None,
            files_processed:  0,
            violations_found: 0,
            tool:             tool.into(),
        };
        self.sessions.insert(session.id.clone(), session.clone());
        info!(session_id = %session.id, tool = %session.tool, "quality session started");
        session
    }

    /// Record one file's current violations, replacing its previous
    /// state. Ids are derived, so identical findings reproduce
    /// identical ids.
    ///
    /// # Errors
    ///
    /// `BAD_USER_INPUT` for unknown sessions.
    pub fn record_file(
        &self,
        session_id: &str,
        path: &str,
        raw: Vec<RawViolation>,
    ) -> Result<QualityFile> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| DevmeshError::not_found("QualitySession", session_id))?;

        let violations: Vec<Violation> = raw
            .into_iter()
            .map(|v| Violation {
                id: Violation::derive_id(path, &v.rule, v.line, v.column, &v.message),
                rule: v.rule,
                severity: v.severity,
                line: v.line,
                column: v.column,
                message: v.message,
                tool: v.tool,
            })
            .collect();

        session.files_processed += 1;
        session.violations_found += violations.len() as u64;

        {
            let mut buckets = self.buckets.lock();
            let bucket = bucket_key(Utc::now());
            let counters = buckets.entry(bucket).or_default();
            counters.files_processed += 1;
            for violation in &violations {
                match violation.severity {
                    Severity::Error => counters.errors += 1,
                    Severity::Warning => counters.warnings += 1,
                    Severity::Info => counters.infos += 1,
                }
            }
        }

        let file = self
            .files
            .entry(path.to_string())
            .and_modify(|file| {
                file.violations = violations.clone();
                file.last_processed = Utc::now();
                file.process_count += 1;
            })
            .or_insert_with(|| QualityFile {
                typename:       QualityFile::TYPENAME,
                path:           path.to_string(),
                violations:     violations.clone(),
                last_processed: Utc::now(),
                process_count:  1,
            })
            .clone();

        self.events.publish(QualityEvent {
            path:       path.to_string(),
            violations: file.violations.len(),
            session_id: session_id.to_string(),
            at:         Utc::now(),
        });
        Ok(file)
    }

    /// Complete a session.
    ///
    /// # Errors
    ///
    /// `BAD_USER_INPUT` for unknown sessions.
    pub fn complete_session(&self, session_id: &str) -> Result<QualitySession> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| DevmeshError::not_found("QualitySession", session_id))?;
        session.completed_at = Some(Utc::now());
        Ok(session.clone())
    }

    /// Fetch one file.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<QualityFile> {
        self.files.get(path).map(|f| f.clone())
    }

    /// Every tracked file, sorted by path.
    #[must_use]
    pub fn files(&self) -> Vec<QualityFile> {
        let mut all: Vec<QualityFile> = self.files.iter().map(|f| f.clone()).collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    /// Fetch one session.
    #[must_use]
    pub fn session(&self, id: &str) -> Option<QualitySession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Time-bucketed metrics at minute granularity since `since`,
    /// oldest first.
    #[must_use]
    pub fn metrics_since(&self, since: DateTime<Utc>) -> Vec<QualityMetric> {
        let buckets = self.buckets.lock();
        let floor = bucket_key(since);
        let mut metrics: Vec<QualityMetric> = buckets
            .iter()
            .filter(|(key, _)| **key >= floor)
            .map(|(key, counters)| QualityMetric {
                bucket:          DateTime::from_timestamp(*key, 0).unwrap_or_else(Utc::now),
                errors:          counters.errors,
                warnings:        counters.warnings,
                infos:           counters.infos,
                files_processed: counters.files_processed,
            })
            .collect();
        metrics.sort_by_key(|m| m.bucket);
        metrics
    }
}

/// Raw violation input from an analyzer, before id derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawViolation {
    /// Rule identifier.
    pub rule: String,
    /// Severity.
    pub severity: Severity,
    /// 1-indexed line.
    pub line: u32,
    /// 1-indexed column.
    pub column: u32,
    /// Analyzer message.
    pub message: String,
    /// Analyzer tool name.
    #[serde(default)]
    pub tool: String,
}

fn bucket_key(at: DateTime<Utc>) -> i64 {
    at.duration_trunc(Duration::minutes(1))
        .unwrap_or(at)
        .timestamp()
}
