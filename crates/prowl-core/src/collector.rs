//! Paginated listing walk for one area.
//!
//! A [`PageCollector`] hands out [`AreaCursor`]s; each call to
//! [`PageCollector::next_batch`] fetches the cursor's next listing page and
//! yields the detail URLs not seen on earlier pages. The walk ends with a
//! [`StopReason`]. A cursor stopped by an open circuit keeps its page and
//! can be resumed once the breaker recovers.

use std::collections::HashSet;
use std::fmt;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::SiteConfig;
use crate::error::AppError;
use crate::fingerprint::FingerprintProfile;
use crate::models::AreaCode;
use crate::pacing::{BehavioralPacer, DelayKind};
use crate::traits::{ListingParser, Transport};

/// Why an area's page walk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A page produced no URLs that had not been seen already.
    Exhausted,
    /// The per-area page cap was reached.
    PageLimit,
    /// The site answered 403/429.
    Blocked(u16),
    /// The breaker refused the request. Resumable.
    CircuitOpen,
    /// Network or server failure on a listing page.
    FetchFailed(String),
    /// The listing page could not be parsed.
    ParseFailed(String),
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Exhausted => "exhausted",
            StopReason::PageLimit => "page_limit",
            StopReason::Blocked(_) => "blocked",
            StopReason::CircuitOpen => "circuit_open",
            StopReason::FetchFailed(_) => "fetch_failed",
            StopReason::ParseFailed(_) => "parse_failed",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Blocked(status) => write!(f, "blocked (HTTP {status})"),
            StopReason::FetchFailed(reason) | StopReason::ParseFailed(reason) => {
                write!(f, "{}: {reason}", self.as_str())
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Position of a page walk through one area.
#[derive(Debug, Clone)]
pub struct AreaCursor {
    area: AreaCode,
    next_page: u32,
    pages_fetched: u32,
    seen: HashSet<String>,
    stop: Option<StopReason>,
}

impl AreaCursor {
    /// Page number the next fetch will request.
    pub fn next_page(&self) -> u32 {
        self.next_page
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop.as_ref()
    }

    /// Clears a `CircuitOpen` stop so the walk continues at the same page.
    /// Returns false for any other stop reason.
    pub fn resume(&mut self) -> bool {
        if self.stop == Some(StopReason::CircuitOpen) {
            self.stop = None;
            true
        } else {
            false
        }
    }

    fn finish(&mut self, reason: StopReason) {
        tracing::debug!(
            area = %self.area,
            page = self.next_page,
            reason = %reason,
            "Area page walk stopped"
        );
        self.stop = Some(reason);
    }
}

/// Walks listing pages through the breaker, pacing between pages.
#[derive(Clone)]
pub struct PageCollector<T: Transport, P: ListingParser> {
    transport: T,
    parser: P,
    breaker: CircuitBreaker,
    pacer: BehavioralPacer,
    site: SiteConfig,
}

impl<T: Transport, P: ListingParser> PageCollector<T, P> {
    pub fn new(
        transport: T,
        parser: P,
        breaker: CircuitBreaker,
        pacer: BehavioralPacer,
        site: SiteConfig,
    ) -> Self {
        Self {
            transport,
            parser,
            breaker,
            pacer,
            site,
        }
    }

    pub fn cursor(&self, area: AreaCode, start_page: u32) -> AreaCursor {
        AreaCursor {
            area,
            next_page: start_page.max(1),
            pages_fetched: 0,
            seen: HashSet::new(),
            stop: None,
        }
    }

    /// Fetch the cursor's next page. `None` once the walk has stopped.
    pub async fn next_batch(
        &self,
        cursor: &mut AreaCursor,
        profile: &FingerprintProfile,
    ) -> Option<Vec<String>> {
        if cursor.stop.is_some() {
            return None;
        }
        if cursor.pages_fetched >= self.site.max_pages_per_area {
            cursor.finish(StopReason::PageLimit);
            return None;
        }
        if cursor.pages_fetched > 0 {
            self.pacer.pause(DelayKind::PageView).await;
        }

        let url = self.site.listing_url(&cursor.area, cursor.next_page);
        let result = self
            .breaker
            .call(|| async {
                let body = self.transport.fetch(&url, profile).await?;
                if body.trim().is_empty() {
                    return Err(AppError::MalformedPage {
                        url: url.clone(),
                        reason: "empty body".into(),
                    });
                }
                Ok(body)
            })
            .await;

        let body = match result {
            Ok(body) => body,
            Err(CircuitBreakerError::Open { .. }) => {
                cursor.finish(StopReason::CircuitOpen);
                return None;
            }
            Err(CircuitBreakerError::Inner(AppError::Blocked { status, .. })) => {
                tracing::warn!(
                    area = %cursor.area,
                    page = cursor.next_page,
                    status,
                    "Listing page blocked"
                );
                cursor.finish(StopReason::Blocked(status));
                return None;
            }
            Err(CircuitBreakerError::Inner(AppError::HttpError { status: 404, .. })) => {
                // Past the last page.
                cursor.finish(StopReason::Exhausted);
                return None;
            }
            Err(CircuitBreakerError::Inner(e)) => {
                tracing::warn!(
                    area = %cursor.area,
                    page = cursor.next_page,
                    error = %e,
                    "Listing page fetch failed"
                );
                cursor.finish(StopReason::FetchFailed(e.to_string()));
                return None;
            }
        };

        cursor.pages_fetched += 1;
        let urls = match self.parser.listing_urls(&body, &url) {
            Ok(urls) => urls,
            Err(e) => {
                tracing::warn!(
                    area = %cursor.area,
                    page = cursor.next_page,
                    error = %e,
                    "Listing page could not be parsed"
                );
                cursor.finish(StopReason::ParseFailed(e.to_string()));
                return None;
            }
        };

        let fresh: Vec<String> = urls
            .into_iter()
            .filter(|u| cursor.seen.insert(u.clone()))
            .collect();

        tracing::debug!(
            area = %cursor.area,
            page = cursor.next_page,
            new_urls = fresh.len(),
            "Listing page collected"
        );

        if fresh.is_empty() {
            cursor.finish(StopReason::Exhausted);
            return None;
        }
        cursor.next_page += 1;
        Some(fresh)
    }

    /// Drain the area from `start_page`, returning every URL and the stop reason.
    pub async fn collect_area(
        &self,
        area: AreaCode,
        start_page: u32,
        profile: &FingerprintProfile,
    ) -> (Vec<String>, StopReason) {
        let mut cursor = self.cursor(area, start_page);
        let mut urls = Vec::new();
        while let Some(batch) = self.next_batch(&mut cursor, profile).await {
            urls.extend(batch);
        }
        let reason = cursor.stop.unwrap_or(StopReason::Exhausted);
        (urls, reason)
    }
}
