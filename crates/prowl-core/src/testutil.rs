//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::config::SiteConfig;
use crate::error::AppError;
use crate::fingerprint::FingerprintProfile;
use crate::models::{ListingRecord, Session, SessionSummary};
use crate::orchestrator::{SessionEvent, SessionReporter};
use crate::store::MemorySessionStore;
use crate::traits::{ListingParser, RecordSink, SessionStore, Transport};

pub const BASE_URL: &str = "https://realty.test";

/// Site layout the mocks are scripted against.
pub fn test_site() -> SiteConfig {
    SiteConfig {
        base_url: BASE_URL.to_string(),
        listing_path: "/{area}/list?page={page}".to_string(),
        max_pages_per_area: 5,
    }
}

/// Listing page body understood by [`MockParser`]; paths are made absolute.
pub fn listing_body(paths: &[&str]) -> String {
    paths
        .iter()
        .map(|p| format!("{BASE_URL}/{}\n", p.trim_start_matches('/')))
        .collect()
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

type Fallback = Arc<dyn Fn(&str) -> Result<String, AppError> + Send + Sync>;

/// Mock transport with per-URL response queues.
#[derive(Clone)]
pub struct MockTransport {
    /// Each fetch of a routed URL pops the first queued response.
    routes: Arc<Mutex<HashMap<String, Vec<Result<String, AppError>>>>>,
    /// Used for unrouted URLs and exhausted queues.
    fallback: Fallback,
    /// Every fetched URL, in order.
    pub calls: Arc<Mutex<Vec<String>>>,
    /// User agent presented on every fetch.
    pub user_agents: Arc<Mutex<Vec<String>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Transport that answers every URL with an empty listing page.
    pub fn new() -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
            fallback: Arc::new(|_| Ok("<html></html>".to_string())),
            calls: Arc::new(Mutex::new(Vec::new())),
            user_agents: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn route(self, url: &str, responses: Vec<Result<String, AppError>>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), responses);
        self
    }

    pub fn with_fallback(
        mut self,
        f: impl Fn(&str) -> Result<String, AppError> + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Arc::new(f);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Transport for MockTransport {
    async fn fetch(&self, url: &str, profile: &FingerprintProfile) -> Result<String, AppError> {
        self.calls.lock().unwrap().push(url.to_string());
        self.user_agents
            .lock()
            .unwrap()
            .push(profile.user_agent.clone());

        let queued = {
            let mut routes = self.routes.lock().unwrap();
            routes
                .get_mut(url)
                .filter(|q| !q.is_empty())
                .map(|q| q.remove(0))
        };
        match queued {
            Some(response) => response,
            None => (self.fallback)(url),
        }
    }
}

// ---------------------------------------------------------------------------
// MockParser
// ---------------------------------------------------------------------------

/// Line-based parser.
///
/// Listing pages: every line starting with `http` is a detail URL.
/// Detail pages: `key=value` lines; a body containing `BROKEN` fails to parse.
#[derive(Debug, Clone, Copy)]
pub struct MockParser;

impl ListingParser for MockParser {
    fn listing_urls(&self, html: &str, _page_url: &str) -> Result<Vec<String>, AppError> {
        Ok(html
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("http"))
            .map(str::to_string)
            .collect())
    }

    fn detail_fields(&self, html: &str, url: &str) -> Result<BTreeMap<String, String>, AppError> {
        if html.contains("BROKEN") {
            return Err(AppError::ParseError {
                url: url.to_string(),
                reason: "unexpected page structure".into(),
            });
        }
        let fields: BTreeMap<String, String> = html
            .lines()
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        if fields.is_empty() {
            return Err(AppError::ParseError {
                url: url.to_string(),
                reason: "no fields".into(),
            });
        }
        Ok(fields)
    }
}

// ---------------------------------------------------------------------------
// MockSessionStore
// ---------------------------------------------------------------------------

/// In-memory store that records every write and can be told to fail.
#[derive(Clone, Default)]
pub struct MockSessionStore {
    inner: MemorySessionStore,
    pub created: Arc<Mutex<Vec<Session>>>,
    pub checkpoints: Arc<Mutex<Vec<Session>>>,
    /// Fail the Nth checkpoint (0-indexed) and every one after it.
    fail_checkpoints_from: Arc<Mutex<Option<usize>>>,
    create_error: Arc<Mutex<Option<AppError>>>,
}

impl MockSessionStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Store that already holds `session`.
    pub async fn with_existing(session: &Session) -> Self {
        let store = Self::default();
        store.inner.create(session).await.unwrap();
        store
    }

    pub fn failing_checkpoints_from(n: usize) -> Self {
        let store = Self::default();
        *store.fail_checkpoints_from.lock().unwrap() = Some(n);
        store
    }

    pub fn with_create_error(error: AppError) -> Self {
        let store = Self::default();
        *store.create_error.lock().unwrap() = Some(error);
        store
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.lock().unwrap().len()
    }
}

impl SessionStore for MockSessionStore {
    async fn create(&self, session: &Session) -> Result<(), AppError> {
        let err = self.create_error.lock().unwrap().take();
        if let Some(e) = err {
            return Err(e);
        }
        self.inner.create(session).await?;
        self.created.lock().unwrap().push(session.clone());
        Ok(())
    }

    async fn checkpoint(&self, session: &Session) -> Result<(), AppError> {
        let attempt = self.checkpoints.lock().unwrap().len();
        let fail_from = *self.fail_checkpoints_from.lock().unwrap();
        if fail_from.is_some_and(|n| attempt >= n) {
            return Err(AppError::StoreError("connection refused".into()));
        }
        self.inner.checkpoint(session).await?;
        self.checkpoints.lock().unwrap().push(session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, AppError> {
        self.inner.get(session_id).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Session>, AppError> {
        self.inner.list_recent(limit).await
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        self.inner.purge_expired().await
    }
}

// ---------------------------------------------------------------------------
// MockSink
// ---------------------------------------------------------------------------

/// Sink that keeps everything in memory.
#[derive(Clone, Default)]
pub struct MockSink {
    pub records: Arc<Mutex<Vec<ListingRecord>>>,
    /// Number of `append` calls, including empty ones.
    pub appends: Arc<Mutex<usize>>,
    pub summaries: Arc<Mutex<Vec<SessionSummary>>>,
    append_error: Arc<Mutex<Option<AppError>>>,
}

impl MockSink {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_append_error(error: AppError) -> Self {
        let sink = Self::default();
        *sink.append_error.lock().unwrap() = Some(error);
        sink
    }

    pub fn records(&self) -> Vec<ListingRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.summaries.lock().unwrap().clone()
    }
}

impl RecordSink for MockSink {
    async fn append(&self, _session: &Session, records: &[ListingRecord]) -> Result<(), AppError> {
        let err = self.append_error.lock().unwrap().take();
        if let Some(e) = err {
            return Err(e);
        }
        *self.appends.lock().unwrap() += 1;
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    async fn finish(&self, _session: &Session, summary: &SessionSummary) -> Result<(), AppError> {
        self.summaries.lock().unwrap().push(summary.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records a short tag for every event.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, tag: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == tag).count()
    }
}

impl SessionReporter for MockReporter {
    fn report(&self, event: SessionEvent<'_>) {
        self.events.lock().unwrap().push(event.tag().to_string());
    }
}
