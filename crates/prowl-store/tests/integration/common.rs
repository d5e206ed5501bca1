use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Schema statements from `migrations/`, executed one at a time.
const MIGRATIONS: &[&str] = &[
    // 001_crawl_sessions.sql
    r#"CREATE TABLE IF NOT EXISTS crawl_sessions (
        session_id VARCHAR(255) PRIMARY KEY,
        status VARCHAR(20) NOT NULL DEFAULT 'running',
        session_ordinal INTEGER NOT NULL,
        date_seed VARCHAR(32) NOT NULL,
        assigned_areas JSONB NOT NULL,
        payload JSONB NOT NULL,
        areas_completed INTEGER NOT NULL DEFAULT 0,
        items_collected BIGINT NOT NULL DEFAULT 0,
        started_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expires_at TIMESTAMPTZ NOT NULL,
        CONSTRAINT chk_crawl_sessions_status CHECK (
            status IN ('running', 'completed', 'aborted', 'failed')
        )
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_crawl_sessions_started ON crawl_sessions(started_at DESC)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_crawl_sessions_expires ON crawl_sessions(expires_at)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_crawl_sessions_day ON crawl_sessions(date_seed, session_ordinal)"#,
];

/// Spins up a PostgreSQL container and returns a connected pool.
///
/// The `ContainerAsync` must be kept in scope for the test duration;
/// dropping it stops the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "prowl_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/prowl_test");

    // The server restarts once after initdb, so the first connects may fail.
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    for migration in MIGRATIONS {
        sqlx::query(migration)
            .execute(&pool)
            .await
            .expect("Failed to run migration");
    }

    (pool, container)
}
