use std::path::{Path, PathBuf};

use prowl_core::error::AppError;
use prowl_core::models::{ListingRecord, Session, SessionSummary};
use prowl_core::traits::RecordSink;
use tokio::io::AsyncWriteExt;

const LISTINGS_FILE: &str = "listings.jsonl";
const SUMMARY_FILE: &str = "summary.json";

/// Writes session output under `<root>/<YYYY-MM-DD>/<session_id>/`.
///
/// Records are appended to `listings.jsonl`, one JSON object per line. The
/// summary lands in `summary.json` via a rename, so its presence means the
/// session's output is complete.
#[derive(Debug, Clone)]
pub struct NdjsonFileSink {
    root: PathBuf,
}

impl NdjsonFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one session's artifacts.
    pub fn session_dir(&self, session: &Session) -> PathBuf {
        self.root
            .join(session.output_date().format("%Y-%m-%d").to_string())
            .join(path_component(&session.session_id))
    }

    async fn ensure_dir(&self, session: &Session) -> Result<PathBuf, AppError> {
        let dir = self.session_dir(session);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::SinkError(format!("Failed to create {}: {e}", dir.display())))?;
        Ok(dir)
    }
}

/// Session ids come from the scheduler; keep them from escaping the root.
fn path_component(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}

impl RecordSink for NdjsonFileSink {
    async fn append(&self, session: &Session, records: &[ListingRecord]) -> Result<(), AppError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let path = self.ensure_dir(session).await?.join(LISTINGS_FILE);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AppError::SinkError(format!("Failed to open {}: {e}", path.display())))?;
        file.write_all(&buf)
            .await
            .map_err(|e| AppError::SinkError(format!("Failed to write {}: {e}", path.display())))?;
        file.flush()
            .await
            .map_err(|e| AppError::SinkError(format!("Failed to flush {}: {e}", path.display())))?;

        tracing::debug!(
            session_id = %session.session_id,
            count = records.len(),
            path = %path.display(),
            "Appended records"
        );
        Ok(())
    }

    async fn finish(&self, session: &Session, summary: &SessionSummary) -> Result<(), AppError> {
        let dir = self.ensure_dir(session).await?;
        let body = serde_json::to_vec_pretty(summary)?;

        let tmp = dir.join(format!("{SUMMARY_FILE}.tmp"));
        let path = dir.join(SUMMARY_FILE);
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| AppError::SinkError(format!("Failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AppError::SinkError(format!("Failed to finalize {}: {e}", path.display())))?;

        tracing::info!(
            session_id = %session.session_id,
            status = %summary.status,
            path = %path.display(),
            "Session summary written"
        );
        Ok(())
    }
}
