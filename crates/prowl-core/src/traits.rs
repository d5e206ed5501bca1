use std::collections::BTreeMap;
use std::future::Future;

use crate::error::AppError;
use crate::fingerprint::FingerprintProfile;
use crate::models::{ListingRecord, Session, SessionSummary};

/// Fetches one page while presenting the given browser identity.
pub trait Transport: Send + Sync + Clone {
    fn fetch(
        &self,
        url: &str,
        profile: &FingerprintProfile,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Turns fetched pages into listing URLs and detail fields.
pub trait ListingParser: Send + Sync + Clone {
    /// Absolute detail-page URLs linked from a listing page, in page order.
    fn listing_urls(&self, html: &str, page_url: &str) -> Result<Vec<String>, AppError>;

    /// Named fields of one detail page.
    fn detail_fields(&self, html: &str, url: &str) -> Result<BTreeMap<String, String>, AppError>;
}

/// Durable per-session state, keyed by session id.
pub trait SessionStore: Send + Sync + Clone {
    /// Insert a new session. Fails with `SessionConflict` if the id is taken.
    fn create(&self, session: &Session) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Overwrite progress of a running session.
    ///
    /// Rejected when the stored record is missing, already terminal, or has a
    /// different area assignment.
    fn checkpoint(&self, session: &Session) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<Option<Session>, AppError>> + Send;

    /// Most recently started sessions first.
    fn list_recent(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Session>, AppError>> + Send;

    /// Remove records past their retention window. Returns how many were removed.
    fn purge_expired(&self) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Append-only destination for a session's output.
pub trait RecordSink: Send + Sync + Clone {
    fn append(
        &self,
        session: &Session,
        records: &[ListingRecord],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Write the terminal summary that marks the session's output complete.
    fn finish(
        &self,
        session: &Session,
        summary: &SessionSummary,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A RecordSink that discards everything, for dry runs.
#[derive(Debug, Clone)]
pub struct NullSink;

impl RecordSink for NullSink {
    async fn append(&self, _session: &Session, _records: &[ListingRecord]) -> Result<(), AppError> {
        Ok(())
    }

    async fn finish(&self, _session: &Session, _summary: &SessionSummary) -> Result<(), AppError> {
        Ok(())
    }
}
