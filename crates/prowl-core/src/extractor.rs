use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::duration_ms;
use crate::error::AppError;
use crate::fingerprint::FingerprintProfile;
use crate::models::{AreaCode, ListingRecord};
use crate::pacing::{BehavioralPacer, DelayKind};
use crate::traits::{ListingParser, Transport};

/// Retry policy for detail page fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "duration_ms", rename = "initial_backoff_ms")]
    pub initial_backoff: Duration,
    pub multiplier: f64,
    #[serde(with = "duration_ms", rename = "max_backoff_ms")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-indexed).
    ///
    /// - Attempt 1: `initial_backoff`
    /// - Attempt n: `initial_backoff * multiplier^(n-1)`, capped by `max_backoff`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Why a detail page produced no record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Definitive non-success answer (404 and friends). Not retried.
    Http(u16),
    /// 403/429. Not retried; the breaker has opened.
    Blocked(u16),
    /// The breaker refused the request before it was sent.
    CircuitOpen,
    /// Transient failures on every attempt.
    RetriesExhausted(String),
    /// Fetched but unparseable. Permanent for this item.
    Parse(String),
    /// Anything else that cannot succeed on retry.
    Permanent(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Http(status) => write!(f, "HTTP {status}"),
            FailureReason::Blocked(status) => write!(f, "blocked (HTTP {status})"),
            FailureReason::CircuitOpen => write!(f, "circuit open"),
            FailureReason::RetriesExhausted(last) => write!(f, "retries exhausted: {last}"),
            FailureReason::Parse(reason) => write!(f, "parse failed: {reason}"),
            FailureReason::Permanent(reason) => write!(f, "{reason}"),
        }
    }
}

/// Definitive per-item failure returned by [`DetailExtractor::extract`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionFailure {
    pub url: String,
    pub reason: FailureReason,
    pub attempts: u32,
}

impl fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.url, self.attempts, self.reason
        )
    }
}

/// Fetches and parses detail pages, reporting every attempt to the breaker.
#[derive(Clone)]
pub struct DetailExtractor<T: Transport, P: ListingParser> {
    transport: T,
    parser: P,
    breaker: CircuitBreaker,
    pacer: BehavioralPacer,
    retry: RetryPolicy,
}

impl<T: Transport, P: ListingParser> DetailExtractor<T, P> {
    pub fn new(
        transport: T,
        parser: P,
        breaker: CircuitBreaker,
        pacer: BehavioralPacer,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            parser,
            breaker,
            pacer,
            retry,
        }
    }

    async fn fetch_page(&self, url: &str, profile: &FingerprintProfile) -> Result<String, AppError> {
        let body = self.transport.fetch(url, profile).await?;
        if body.trim().is_empty() {
            return Err(AppError::MalformedPage {
                url: url.to_string(),
                reason: "empty body".into(),
            });
        }
        Ok(body)
    }

    /// Extract one listing. Transient failures are retried with backoff;
    /// everything else fails on the spot.
    pub async fn extract(
        &self,
        url: &str,
        area: &AreaCode,
        profile: &FingerprintProfile,
        session_id: &str,
    ) -> Result<ListingRecord, ExtractionFailure> {
        let fail = |reason, attempts| ExtractionFailure {
            url: url.to_string(),
            reason,
            attempts,
        };
        let max_attempts = self.retry.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self.breaker.call(|| self.fetch_page(url, profile)).await;

            let error = match result {
                Ok(body) => {
                    return match self.parser.detail_fields(&body, url) {
                        Ok(fields) => {
                            let record = ListingRecord {
                                url: url.to_string(),
                                extracted_at: Utc::now(),
                                fields,
                                source_area: area.clone(),
                                session_id: session_id.to_string(),
                            };
                            self.pacer.pause(DelayKind::ItemRead).await;
                            Ok(record)
                        }
                        Err(e) => {
                            tracing::warn!(%url, error = %e, "Detail page could not be parsed");
                            Err(fail(FailureReason::Parse(e.to_string()), attempt))
                        }
                    };
                }
                Err(CircuitBreakerError::Open { retry_after, .. }) => {
                    tracing::debug!(
                        %url,
                        retry_after_secs = retry_after.as_secs(),
                        "Skipping fetch, circuit open"
                    );
                    return Err(fail(FailureReason::CircuitOpen, attempt));
                }
                Err(CircuitBreakerError::Inner(e)) => e,
            };

            if let AppError::Blocked { status, .. } = error {
                return Err(fail(FailureReason::Blocked(status), attempt));
            }
            if !error.is_retryable() {
                let reason = match error {
                    AppError::HttpError { status, .. } => FailureReason::Http(status),
                    other => FailureReason::Permanent(other.to_string()),
                };
                return Err(fail(reason, attempt));
            }
            if attempt >= max_attempts {
                tracing::warn!(%url, attempts = attempt, error = %error, "Giving up on detail page");
                return Err(fail(
                    FailureReason::RetriesExhausted(error.to_string()),
                    attempt,
                ));
            }

            let delay = self.retry.delay_for_attempt(attempt);
            tracing::debug!(
                %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying detail page"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
