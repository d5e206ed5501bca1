use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitSnapshot;

/// Identifier of one crawlable sub-catalog of the target site.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AreaCode(pub String);

impl AreaCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AreaCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AreaCode {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AreaCode {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One area in a session's ordered assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaAssignment {
    pub area_code: AreaCode,
    pub sequence_index: usize,
}

/// How aggressively a session paces itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlMode {
    /// No pacing delays; for local runs against fixtures.
    Testing,
    /// Half-length delays.
    Normal,
    /// Full human-like delays.
    #[default]
    Stealth,
}

impl CrawlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlMode::Testing => "testing",
            CrawlMode::Normal => "normal",
            CrawlMode::Stealth => "stealth",
        }
    }

    /// Multiplier applied to every pacing delay.
    pub fn pacing_scale(&self) -> f64 {
        match self {
            CrawlMode::Testing => 0.0,
            CrawlMode::Normal => 0.5,
            CrawlMode::Stealth => 1.0,
        }
    }
}

impl fmt::Display for CrawlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrawlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "testing" => Ok(CrawlMode::Testing),
            "normal" => Ok(CrawlMode::Normal),
            "stealth" => Ok(CrawlMode::Stealth),
            _ => Err(format!("Unknown crawl mode: {s}")),
        }
    }
}

/// Lifecycle status of a crawl session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Aborted,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    /// Completed and aborted sessions both count as successful runs for the scheduler.
    pub fn is_success(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Aborted)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "aborted" => Ok(SessionStatus::Aborted),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(format!("Unknown session status: {s}")),
        }
    }
}

/// Limits for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBudget {
    /// `None` means no artificial cap.
    pub max_items: Option<u64>,
    pub max_runtime_minutes: u64,
}

impl SessionBudget {
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_minutes * 60)
    }
}

/// Durable record of one crawl session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub session_ordinal: u32,
    pub date_seed: String,
    pub mode: CrawlMode,
    pub started_at: DateTime<Utc>,
    pub budget: SessionBudget,
    pub assigned_areas: Vec<AreaAssignment>,
    pub fingerprint_id: String,
    pub status: SessionStatus,
    pub areas_completed: u32,
    pub items_collected: u64,
    pub items_failed: u64,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub breaker: Option<CircuitSnapshot>,
    pub abort_reason: Option<String>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Builds a fresh running session. The assignment is fixed from here on.
    pub fn start(
        session_id: impl Into<String>,
        session_ordinal: u32,
        date_seed: impl Into<String>,
        mode: CrawlMode,
        budget: SessionBudget,
        assigned_areas: Vec<AreaAssignment>,
        fingerprint_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            session_ordinal,
            date_seed: date_seed.into(),
            mode,
            started_at: Utc::now(),
            budget,
            assigned_areas,
            fingerprint_id: fingerprint_id.into(),
            status: SessionStatus::Running,
            areas_completed: 0,
            items_collected: 0,
            items_failed: 0,
            last_checkpoint: None,
            breaker: None,
            abort_reason: None,
            error: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Calendar date the output artifacts are filed under.
    pub fn output_date(&self) -> NaiveDate {
        self.started_at.date_naive()
    }

    /// Moves the session into a terminal state.
    pub fn finish(&mut self, status: SessionStatus, reason: Option<String>) {
        self.status = status;
        match status {
            SessionStatus::Aborted => self.abort_reason = reason,
            SessionStatus::Failed => self.error = reason,
            _ => {}
        }
        self.finished_at = Some(Utc::now());
    }

    pub fn summary(&self) -> SessionSummary {
        let finished_at = self.finished_at.unwrap_or_else(Utc::now);
        let duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        SessionSummary {
            session_id: self.session_id.clone(),
            status: self.status,
            areas_completed: self.areas_completed,
            items_collected: self.items_collected,
            items_failed: self.items_failed,
            duration_ms,
            abort_reason: self.abort_reason.clone(),
            error: self.error.clone(),
            started_at: self.started_at,
            finished_at,
        }
    }
}

/// One successfully parsed listing detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub url: String,
    pub extracted_at: DateTime<Utc>,
    pub fields: BTreeMap<String, String>,
    pub source_area: AreaCode,
    pub session_id: String,
}

/// Terminal record written for every session, whatever its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub areas_completed: u32,
    pub items_collected: u64,
    pub items_failed: u64,
    pub duration_ms: u64,
    pub abort_reason: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Scheduler payload that starts one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub session_id: String,
    #[serde(default)]
    pub mode: CrawlMode,
    #[serde(default)]
    pub max_items: Option<u64>,
    #[serde(default)]
    pub max_runtime_minutes: Option<u64>,
    /// Overrides the configured site base URL.
    #[serde(default)]
    pub entry_point: Option<String>,
    /// Crawl exactly these areas, in this order, instead of the day's assignment.
    #[serde(default)]
    pub area_override: Option<Vec<AreaCode>>,
    #[serde(default)]
    pub session_ordinal: Option<u32>,
    /// Date used to seed the area partition; defaults to today (UTC).
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

impl InvocationRequest {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            mode: CrawlMode::default(),
            max_items: None,
            max_runtime_minutes: None,
            entry_point: None,
            area_override: None,
            session_ordinal: None,
            date: None,
        }
    }

    pub fn with_mode(mut self, mode: CrawlMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_items(mut self, max: u64) -> Self {
        self.max_items = Some(max);
        self
    }

    pub fn with_max_runtime_minutes(mut self, minutes: u64) -> Self {
        self.max_runtime_minutes = Some(minutes);
        self
    }

    pub fn with_areas(mut self, areas: Vec<AreaCode>) -> Self {
        self.area_override = Some(areas);
        self
    }

    pub fn with_ordinal(mut self, ordinal: u32) -> Self {
        self.session_ordinal = Some(ordinal);
        self
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }
}

/// Formats a date the way it seeds the area partition.
pub fn date_seed(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
