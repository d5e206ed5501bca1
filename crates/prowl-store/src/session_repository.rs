use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{PgPool, Pool, Postgres};

use prowl_core::error::AppError;
use prowl_core::models::Session;
use prowl_core::traits::SessionStore;

/// PostgreSQL-backed session state, one row per session id.
///
/// The full [`Session`] lives in `payload`; status, counters and the area
/// assignment are mirrored into columns so the write guards can be enforced
/// in SQL. Rows past `expires_at` are invisible and may be replaced.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: Pool<Postgres>,
    retention: TimeDelta,
}

impl PgSessionStore {
    pub fn new(pool: PgPool, retention: TimeDelta) -> Self {
        Self { pool, retention }
    }

    fn expires_at(&self, session: &Session) -> DateTime<Utc> {
        session.started_at + self.retention
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct SessionRow {
    payload: serde_json::Value,
}

impl TryFrom<SessionRow> for Session {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(row.payload)?)
    }
}

fn db_error(e: sqlx::Error) -> AppError {
    AppError::StoreError(e.to_string())
}

impl SessionStore for PgSessionStore {
    async fn create(&self, session: &Session) -> Result<(), AppError> {
        let payload = serde_json::to_value(session)?;
        let areas = serde_json::to_value(&session.assigned_areas)?;

        let result = sqlx::query(
            r#"
            INSERT INTO crawl_sessions (
                session_id, status, session_ordinal, date_seed, assigned_areas, payload,
                areas_completed, items_collected, started_at, updated_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), $10)
            ON CONFLICT (session_id) DO UPDATE SET
                status = EXCLUDED.status,
                session_ordinal = EXCLUDED.session_ordinal,
                date_seed = EXCLUDED.date_seed,
                assigned_areas = EXCLUDED.assigned_areas,
                payload = EXCLUDED.payload,
                areas_completed = EXCLUDED.areas_completed,
                items_collected = EXCLUDED.items_collected,
                started_at = EXCLUDED.started_at,
                updated_at = NOW(),
                expires_at = EXCLUDED.expires_at
            WHERE crawl_sessions.expires_at <= NOW()
            "#,
        )
        .bind(&session.session_id)
        .bind(session.status.as_str())
        .bind(session.session_ordinal as i32)
        .bind(&session.date_seed)
        .bind(&areas)
        .bind(&payload)
        .bind(session.areas_completed as i32)
        .bind(session.items_collected as i64)
        .bind(session.started_at)
        .bind(self.expires_at(session))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::SessionConflict(session.session_id.clone()));
        }
        Ok(())
    }

    async fn checkpoint(&self, session: &Session) -> Result<(), AppError> {
        let payload = serde_json::to_value(session)?;
        let areas = serde_json::to_value(&session.assigned_areas)?;

        let result = sqlx::query(
            r#"
            UPDATE crawl_sessions
            SET status = $2, payload = $3, areas_completed = $4, items_collected = $5,
                updated_at = NOW()
            WHERE session_id = $1
              AND status = 'running'
              AND assigned_areas = $6
              AND expires_at > NOW()
            "#,
        )
        .bind(&session.session_id)
        .bind(session.status.as_str())
        .bind(&payload)
        .bind(session.areas_completed as i32)
        .bind(session.items_collected as i64)
        .bind(&areas)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing matched: report which guard rejected the write.
        let reason = match self.get(&session.session_id).await? {
            None => "not found".to_string(),
            Some(stored) if stored.is_terminal() => format!("is already {}", stored.status),
            Some(_) => "area assignment cannot change".to_string(),
        };
        tracing::warn!(session_id = %session.session_id, reason = %reason, "Checkpoint rejected");
        Err(AppError::StoreError(format!(
            "Session {} {reason}",
            session.session_id
        )))
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, AppError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"SELECT payload FROM crawl_sessions WHERE session_id = $1 AND expires_at > NOW()"#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(Session::try_from).transpose()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Session>, AppError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT payload FROM crawl_sessions
            WHERE expires_at > NOW()
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(Session::try_from).collect()
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query(r#"DELETE FROM crawl_sessions WHERE expires_at <= NOW()"#)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged, "Purged expired sessions");
        }
        Ok(purged)
    }
}
