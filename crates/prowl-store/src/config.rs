use chrono::TimeDelta;
use prowl_core::AppError;

/// Default number of days a session record stays readable.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Configuration for the session database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub retention_days: u32,
}

impl DatabaseConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    /// - `PROWL_RETENTION_DAYS` (optional, defaults to 30)
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            AppError::ConfigError("DATABASE_URL not set. Required for the session store.".into())
        })?;

        let max_connections = positive_var("DATABASE_MAX_CONNECTIONS", 5)?;
        let retention_days = positive_var("PROWL_RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?;

        Ok(Self {
            url,
            max_connections,
            retention_days,
        })
    }

    pub fn retention(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.retention_days))
    }
}

fn positive_var(name: &str, default: u32) -> Result<u32, AppError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => parse_positive(name, &raw),
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<u32, AppError> {
    let parsed: u32 = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {name} '{raw}': must be a positive integer"))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(format!("{name} must be at least 1")));
    }
    Ok(parsed)
}
