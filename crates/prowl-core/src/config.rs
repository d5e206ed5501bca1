use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::extractor::RetryPolicy;
use crate::fingerprint::FingerprintProfile;
use crate::models::AreaCode;
use crate::pacing::PacingConfig;

/// Serde helpers for `Duration` fields stored as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Where and how listing pages are requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub base_url: String,
    /// Path appended to `base_url`; `{area}` and `{page}` are substituted.
    pub listing_path: String,
    /// Upper bound on pages walked per area.
    pub max_pages_per_area: u32,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.example-realty.jp".to_string(),
            listing_path: "/chintai/{area}/list/?page={page}".to_string(),
            max_pages_per_area: 50,
        }
    }
}

impl SiteConfig {
    pub fn listing_url(&self, area: &AreaCode, page: u32) -> String {
        let path = self
            .listing_path
            .replace("{area}", area.as_str())
            .replace("{page}", &page.to_string());
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Copy of this config pointed at another host.
    pub fn with_base_url(&self, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..self.clone()
        }
    }
}

/// CSS selectors used by the selector-driven listing parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Anchors on a listing page that link to detail pages.
    pub listing_link: String,
    /// Field name → selector whose text becomes the field value.
    pub fields: BTreeMap<String, String>,
    /// Fields that must be present for a detail page to count as parsed.
    pub required_fields: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        let fields = [
            ("title", "h1"),
            ("rent", ".property-rent"),
            ("address", ".property-address"),
            ("layout", ".property-layout"),
            ("area_sqm", ".property-area"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            listing_link: "a.property-link".to_string(),
            fields,
            required_fields: vec!["title".to_string()],
        }
    }
}

/// Static configuration read once when a session initializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub site: SiteConfig,
    /// Full area catalog partitioned across the day's sessions.
    pub areas: Vec<AreaCode>,
    pub sessions_per_day: u32,
    pub pacing: PacingConfig,
    pub breaker: CircuitBreakerConfig,
    /// How long an open breaker may stay open before the session aborts.
    #[serde(with = "duration_ms", rename = "breaker_cooldown_ms")]
    pub breaker_cooldown: Duration,
    pub retry: RetryPolicy,
    /// Empty means the built-in catalog.
    pub fingerprints: Vec<FingerprintProfile>,
    pub selectors: SelectorConfig,
    /// Runtime budget when the invocation does not set one.
    pub default_max_runtime_minutes: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            site: SiteConfig::default(),
            areas: Vec::new(),
            sessions_per_day: 8,
            pacing: PacingConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            breaker_cooldown: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            fingerprints: Vec::new(),
            selectors: SelectorConfig::default(),
            default_max_runtime_minutes: 14,
        }
    }
}

impl CrawlerConfig {
    /// Load and validate a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let config: CrawlerConfig = serde_json::from_str(&raw).map_err(|e| {
            AppError::ConfigError(format!("Invalid JSON in config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.sessions_per_day == 0 {
            return Err(AppError::ConfigError(
                "sessions_per_day must be at least 1".into(),
            ));
        }
        if self.site.max_pages_per_area == 0 {
            return Err(AppError::ConfigError(
                "site.max_pages_per_area must be at least 1".into(),
            ));
        }
        if !self.site.listing_path.contains("{page}") {
            return Err(AppError::ConfigError(
                "site.listing_path must contain a {page} placeholder".into(),
            ));
        }
        let b = &self.breaker;
        if !(0.0..=1.0).contains(&b.error_rate_threshold) {
            return Err(AppError::ConfigError(
                "breaker.error_rate_threshold must be within 0.0..=1.0".into(),
            ));
        }
        if b.window_size == 0 || b.min_samples > b.window_size {
            return Err(AppError::ConfigError(
                "breaker.min_samples must not exceed a non-zero breaker.window_size".into(),
            ));
        }
        if b.half_open_trials == 0 {
            return Err(AppError::ConfigError(
                "breaker.half_open_trials must be at least 1".into(),
            ));
        }
        if !b.blocked_backoff_multiplier.is_finite() || b.blocked_backoff_multiplier < 1.0 {
            return Err(AppError::ConfigError(
                "breaker.blocked_backoff_multiplier must be a finite value of at least 1.0".into(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(AppError::ConfigError(
                "retry.multiplier must be a finite value of at least 1.0".into(),
            ));
        }
        if b.recovery_timeout > self.breaker_cooldown {
            tracing::warn!(
                recovery_ms = b.recovery_timeout.as_millis() as u64,
                cooldown_ms = self.breaker_cooldown.as_millis() as u64,
                "Breaker recovery timeout exceeds cooldown; an opened breaker will always abort the session"
            );
        }
        self.pacing.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_url_substitutes_placeholders() {
        let site = SiteConfig {
            base_url: "https://realty.test/".into(),
            listing_path: "/list/{area}?page={page}".into(),
            max_pages_per_area: 3,
        };
        assert_eq!(
            site.listing_url(&AreaCode::from("13101"), 2),
            "https://realty.test/list/13101?page=2"
        );
        assert_eq!(
            site.with_base_url("http://127.0.0.1:9000")
                .listing_url(&AreaCode::from("x"), 1),
            "http://127.0.0.1:9000/list/x?page=1"
        );
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: CrawlerConfig = serde_json::from_str(
            r#"{
                "areas": ["13101", "13102"],
                "sessions_per_day": 4,
                "breaker": {"error_rate_threshold": 0.2, "latency_floor_ms": 90},
                "breaker_cooldown_ms": 120000
            }"#,
        )
        .unwrap();

        assert_eq!(config.areas.len(), 2);
        assert_eq!(config.sessions_per_day, 4);
        assert_eq!(config.breaker.error_rate_threshold, 0.2);
        assert_eq!(config.breaker.latency_floor, Duration::from_millis(90));
        assert_eq!(config.breaker.window_size, 20);
        assert_eq!(config.breaker_cooldown, Duration::from_secs(120));
        assert_eq!(config.default_max_runtime_minutes, 14);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = CrawlerConfig {
            sessions_per_day: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));

        let mut config = CrawlerConfig::default();
        config.breaker.min_samples = 100;
        assert!(config.validate().is_err());

        let mut config = CrawlerConfig::default();
        config.site.listing_path = "/list/{area}".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shrinking_or_non_finite_multipliers() {
        let mut config = CrawlerConfig::default();
        config.breaker.blocked_backoff_multiplier = -1.0;
        assert!(matches!(config.validate(), Err(AppError::ConfigError(ref m)) if m.contains("blocked_backoff_multiplier")));

        let mut config = CrawlerConfig::default();
        config.breaker.blocked_backoff_multiplier = f32::INFINITY;
        assert!(config.validate().is_err());

        for multiplier in [0.5, f64::NAN] {
            let mut config = CrawlerConfig::default();
            config.retry.multiplier = multiplier;
            assert!(matches!(config.validate(), Err(AppError::ConfigError(ref m)) if m.contains("retry.multiplier")));
        }

        let mut config = CrawlerConfig::default();
        config.breaker.blocked_backoff_multiplier = 1.0;
        config.retry.multiplier = 10.0;
        config.retry.max_retries = 40;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_reports_missing_file() {
        let err = CrawlerConfig::from_file(Path::new("/nonexistent/prowl.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
