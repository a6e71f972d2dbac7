//! Core domain model for the deal-flow analysis engine.
//!
//! Jobs, engine results and the derived completion view are shared by the
//! storage, engine, scheduling and web crates. Nothing in here performs I/O.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealflow-core";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn rank(self) -> i16 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        match rank {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(AnalysisError::ValidationFailure(format!(
                "unknown priority `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Queued and processing jobs count against dedup and tenant activity.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AnalysisError::ValidationFailure(format!("unknown job status `{s}`")))
    }
}

/// One scheduled unit of work: run `engine_name` for `subject_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub subject_id: String,
    pub tenant_id: String,
    pub engine_name: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_eligible_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Enqueue request handed to the job store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub subject_id: String,
    pub tenant_id: String,
    pub engine_name: String,
    pub priority: Priority,
    pub delay: std::time::Duration,
}

impl NewJob {
    pub fn new(
        subject_id: impl Into<String>,
        tenant_id: impl Into<String>,
        engine_name: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            tenant_id: tenant_id.into(),
            engine_name: engine_name.into(),
            priority: Priority::Normal,
            delay: std::time::Duration::ZERO,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Success,
    Failure,
    Partial,
}

impl EngineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Partial => "partial",
        }
    }

    pub fn produced_data(self) -> bool {
        matches!(self, Self::Success | Self::Partial)
    }
}

impl FromStr for EngineStatus {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "partial" => Ok(Self::Partial),
            other => Err(AnalysisError::ValidationFailure(format!(
                "unknown engine status `{other}`"
            ))),
        }
    }
}

/// Append-only record of one engine execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResult {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub engine_name: String,
    pub subject_id: String,
    pub tenant_id: String,
    pub status: EngineStatus,
    pub confidence: f64,
    pub data_completeness: f64,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    pub produced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionState {
    Pending,
    Completed,
    Timeout,
    Failed,
}

impl CompletionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
        }
    }

    /// Terminal states close the waterfall run and trigger integration.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl FromStr for CompletionState {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "timeout" => Ok(Self::Timeout),
            "failed" => Ok(Self::Failed),
            other => Err(AnalysisError::ValidationFailure(format!(
                "unknown completion state `{other}`"
            ))),
        }
    }
}

/// Derived completion view for one subject. Always recomputed, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub subject_id: String,
    pub engines_processed: BTreeSet<String>,
    pub engines_failed: BTreeSet<String>,
    pub engines_pending: BTreeSet<String>,
    pub completeness_score: f64,
    pub completion_status: CompletionState,
    pub run_started_at: Option<DateTime<Utc>>,
    pub evaluated_at: DateTime<Utc>,
}

/// One waterfall run per subject, opened on first dispatch and closed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterfallRun {
    pub subject_id: String,
    pub tenant_id: String,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub outcome: Option<CompletionState>,
    pub completeness_score: Option<f64>,
    pub integration_succeeded: Option<bool>,
    pub data_points_created: Option<i64>,
}

impl WaterfallRun {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "subject_id", rename_all = "lowercase")]
pub enum BlockScope {
    Global,
    Subject(String),
}

impl BlockScope {
    pub fn subject_id(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::Subject(id) => Some(id),
        }
    }
}

impl fmt::Display for BlockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Subject(id) => write!(f, "subject:{id}"),
        }
    }
}

/// Table-driven block on one subject or on the whole scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchEntry {
    pub id: Uuid,
    pub scope: BlockScope,
    pub reason: String,
    /// `None` blocks permanently.
    pub blocked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl KillSwitchEntry {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.map_or(true, |until| until > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSource {
    Emergency,
    Blocklist,
    SubjectField,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub blocked: bool,
    pub reason: Option<String>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub source: Option<BlockSource>,
}

impl BlockStatus {
    pub fn clear() -> Self {
        Self {
            blocked: false,
            reason: None,
            blocked_until: None,
            source: None,
        }
    }

    pub fn blocked(
        source: BlockSource,
        reason: impl Into<String>,
        blocked_until: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
            blocked_until,
            source: Some(source),
        }
    }
}

/// Mutable per-subject configuration guarded by optimistic versioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectConfig {
    pub subject_id: String,
    pub tenant_id: String,
    pub settings: serde_json::Value,
    pub version: i64,
    pub blocked_until: Option<DateTime<Utc>>,
    pub block_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantActivity {
    pub queued: u64,
    pub processing: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub has_active_analysis: bool,
    pub queued_count: u64,
    pub processing_count: u64,
    pub can_safely_update: bool,
    pub recommendation: String,
}

/// Result shape shared by cron ticks and manual triggers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_items: usize,
    pub processing_time_ms: u64,
    pub system_disabled: bool,
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimSummary {
    pub reclaimed: usize,
    pub failed: usize,
}

impl ReclaimSummary {
    pub fn total(&self) -> usize {
        self.reclaimed + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepthRow {
    pub status: JobStatus,
    pub priority: Priority,
    pub count: u64,
}

/// Error taxonomy shared across the analysis pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("engine `{engine}` failed transiently: {message}")]
    TransientEngineFailure { engine: String, message: String },
    #[error("engine `{engine}` failed terminally after {attempts} attempt(s): {message}")]
    TerminalEngineFailure {
        engine: String,
        attempts: u32,
        message: String,
    },
    #[error("concurrent write detected on {0}")]
    WriteConflict(String),
    #[error("validation failed: {0}")]
    ValidationFailure(String),
    #[error("subject {subject_id} is blocked: {reason}")]
    SubjectBlocked {
        subject_id: String,
        reason: String,
        blocked_until: Option<DateTime<Utc>>,
    },
    #[error("analysis system is disabled")]
    SystemDisabled,
}

impl AnalysisError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientEngineFailure { .. } | Self::WriteConflict(_)
        )
    }
}

/// Source of wall-clock time, injectable so tests can move time forward.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Convert a configured std duration into a chrono delta, saturating on overflow.
pub fn to_time_delta(duration: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// `at - by`, clamped to the earliest representable instant.
pub fn instant_before(at: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    at.checked_sub_signed(to_time_delta(by))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `at + by`, clamped to the latest representable instant.
pub fn instant_after(at: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_time_delta(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
