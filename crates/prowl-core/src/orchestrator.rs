//! Drives one crawl session from invocation to terminal summary.
//!
//! ```text
//! Initializing -> RunningArea(i) -> Checkpointing -> { RunningArea(i+1) | Draining }
//!                                                          -> Completed | Aborted | Failed
//! ```
//!
//! Areas run strictly in assignment order and pages in ascending order.
//! Progress is flushed to the sink and checkpointed to the store after every
//! area, so a forced termination loses at most one area of work.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitState, DetectionRisk};
use crate::collector::{PageCollector, StopReason};
use crate::config::CrawlerConfig;
use crate::distributor;
use crate::error::AppError;
use crate::extractor::{DetailExtractor, ExtractionFailure, FailureReason};
use crate::fingerprint::{FingerprintCatalog, FingerprintProfile};
use crate::models::{
    AreaAssignment, AreaCode, InvocationRequest, ListingRecord, Session, SessionBudget,
    SessionStatus, SessionSummary, date_seed,
};
use crate::pacing::{BehavioralPacer, DelayKind};
use crate::traits::{ListingParser, RecordSink, SessionStore, Transport};

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SessionEvent<'a> {
    Started {
        session: &'a Session,
    },
    AreaStarted {
        session_id: &'a str,
        area: &'a AreaCode,
        index: usize,
        total: usize,
    },
    ItemFailed {
        session_id: &'a str,
        failure: &'a ExtractionFailure,
    },
    AreaFinished {
        session_id: &'a str,
        area: &'a AreaCode,
        reason: &'a StopReason,
        items: usize,
    },
    Slowdown {
        session_id: &'a str,
        risk: DetectionRisk,
        factor: f64,
    },
    WaitingForBreaker {
        session_id: &'a str,
        retry_after: Duration,
    },
    Checkpointed {
        session_id: &'a str,
        areas_completed: u32,
        items_collected: u64,
    },
    Finished {
        summary: &'a SessionSummary,
    },
}

impl SessionEvent<'_> {
    pub fn tag(&self) -> &'static str {
        match self {
            SessionEvent::Started { .. } => "started",
            SessionEvent::AreaStarted { .. } => "area_started",
            SessionEvent::ItemFailed { .. } => "item_failed",
            SessionEvent::AreaFinished { .. } => "area_finished",
            SessionEvent::Slowdown { .. } => "slowdown",
            SessionEvent::WaitingForBreaker { .. } => "waiting_for_breaker",
            SessionEvent::Checkpointed { .. } => "checkpointed",
            SessionEvent::Finished { .. } => "finished",
        }
    }
}

/// Trait for receiving session events (decoupled logging).
pub trait SessionReporter: Send + Sync {
    fn report(&self, event: SessionEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSessionReporter;

impl SessionReporter for TracingSessionReporter {
    fn report(&self, event: SessionEvent<'_>) {
        match event {
            SessionEvent::Started { session } => {
                tracing::info!(
                    session_id = %session.session_id,
                    ordinal = session.session_ordinal,
                    date = %session.date_seed,
                    mode = %session.mode,
                    areas = session.assigned_areas.len(),
                    fingerprint = %session.fingerprint_id,
                    "Session started"
                );
            }
            SessionEvent::AreaStarted {
                session_id,
                area,
                index,
                total,
            } => {
                tracing::info!(%session_id, %area, area_index = index + 1, total, "Crawling area");
            }
            SessionEvent::ItemFailed {
                session_id,
                failure,
            } => {
                tracing::warn!(
                    %session_id,
                    url = %failure.url,
                    reason = %failure.reason,
                    attempts = failure.attempts,
                    "Listing extraction failed"
                );
            }
            SessionEvent::AreaFinished {
                session_id,
                area,
                reason,
                items,
            } => {
                tracing::info!(%session_id, %area, %reason, items, "Area finished");
            }
            SessionEvent::Slowdown {
                session_id,
                risk,
                factor,
            } => {
                tracing::warn!(%session_id, ?risk, factor, "Adjusting pacing to detection risk");
            }
            SessionEvent::WaitingForBreaker {
                session_id,
                retry_after,
            } => {
                tracing::warn!(
                    %session_id,
                    retry_after_secs = retry_after.as_secs(),
                    "Circuit open, waiting for recovery"
                );
            }
            SessionEvent::Checkpointed {
                session_id,
                areas_completed,
                items_collected,
            } => {
                tracing::debug!(%session_id, areas_completed, items_collected, "Checkpoint saved");
            }
            SessionEvent::Finished { summary } => {
                tracing::info!(
                    session_id = %summary.session_id,
                    status = %summary.status,
                    areas_completed = summary.areas_completed,
                    items_collected = summary.items_collected,
                    items_failed = summary.items_failed,
                    duration_ms = summary.duration_ms,
                    abort_reason = ?summary.abort_reason,
                    error = ?summary.error,
                    "Session finished"
                );
            }
        }
    }
}

/// Why the session left the crawl loop early.
enum Halt {
    Abort(String),
    Fail(String),
}

/// Per-session collaborators, built fresh for every run.
struct SessionContext<T: Transport, P: ListingParser> {
    profile: FingerprintProfile,
    breaker: CircuitBreaker,
    pacer: BehavioralPacer,
    collector: PageCollector<T, P>,
    extractor: DetailExtractor<T, P>,
    deadline: Instant,
    cancel: CancellationToken,
    /// Start of the current stretch without a closed breaker. Survives
    /// open → half-open → open cycles.
    unhealthy_since: Option<Instant>,
}

impl<T: Transport, P: ListingParser> SessionContext<T, P> {
    fn unhealthy_for(&mut self) -> Duration {
        self.unhealthy_since.get_or_insert_with(Instant::now).elapsed()
    }

    fn note_recovery(&mut self) {
        if self.unhealthy_since.is_some() && self.breaker.state() == CircuitState::Closed {
            tracing::info!(
                circuit = %self.breaker.name(),
                "Breaker recovered, cooldown clock reset"
            );
            self.unhealthy_since = None;
        }
    }
}

/// Top-level driver for one crawl session.
pub struct SessionOrchestrator<T, P, S, K>
where
    T: Transport,
    P: ListingParser,
    S: SessionStore,
    K: RecordSink,
{
    transport: T,
    parser: P,
    store: S,
    sink: K,
    config: CrawlerConfig,
    catalog: FingerprintCatalog,
    pacer_seed: Option<u64>,
}

impl<T, P, S, K> SessionOrchestrator<T, P, S, K>
where
    T: Transport,
    P: ListingParser,
    S: SessionStore,
    K: RecordSink,
{
    pub fn new(
        transport: T,
        parser: P,
        store: S,
        sink: K,
        config: CrawlerConfig,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let catalog = FingerprintCatalog::from_config(&config.fingerprints)?;
        Ok(Self {
            transport,
            parser,
            store,
            sink,
            config,
            catalog,
            pacer_seed: None,
        })
    }

    /// Use a fixed pacing seed instead of OS entropy.
    pub fn with_pacer_seed(mut self, seed: u64) -> Self {
        self.pacer_seed = Some(seed);
        self
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// Run one session to a terminal state. Never returns an error: every
    /// outcome, including invalid input, is reported as a summary.
    pub async fn run<R: SessionReporter>(
        &self,
        request: &InvocationRequest,
        cancel_token: CancellationToken,
        reporter: &R,
    ) -> SessionSummary {
        let started = Instant::now();

        let mut session = match self.initialize(request) {
            Ok(session) => session,
            Err(e) => return self.reject(request, e, reporter).await,
        };

        if let Err(e) = self.store.create(&session).await {
            let conflict = matches!(e, AppError::SessionConflict(_));
            session.finish(SessionStatus::Failed, Some(e.to_string()));
            let summary = session.summary();
            // An existing session's artifacts are left untouched.
            if !conflict && let Err(e) = self.sink.finish(&session, &summary).await {
                tracing::error!(session_id = %session.session_id, error = %e, "Failed to write session summary");
            }
            reporter.report(SessionEvent::Finished { summary: &summary });
            return summary;
        }
        reporter.report(SessionEvent::Started { session: &session });

        let mut ctx = self.session_context(&session, request, cancel_token, started);
        let outcome = self.drive(&mut session, &mut ctx, reporter).await;
        self.finalize(session, outcome, &ctx.breaker, reporter).await
    }

    fn initialize(&self, request: &InvocationRequest) -> Result<Session, AppError> {
        if request.session_id.trim().is_empty() {
            return Err(AppError::ConfigError("session_id must not be empty".into()));
        }
        if let Some(entry) = &request.entry_point
            && !(entry.starts_with("http://") || entry.starts_with("https://"))
        {
            return Err(AppError::ConfigError(format!(
                "entry_point must be an http(s) URL, got '{entry}'"
            )));
        }

        let date = request.date.unwrap_or_else(|| Utc::now().date_naive());
        let seed = date_seed(date);
        let total = self.config.sessions_per_day;
        let ordinal =
            distributor::resolve_ordinal(request.session_ordinal, &request.session_id, total)?;

        let assigned_areas = match &request.area_override {
            Some(areas) => {
                let mut seen = HashSet::new();
                areas
                    .iter()
                    .filter(|a| seen.insert((*a).clone()))
                    .cloned()
                    .enumerate()
                    .map(|(sequence_index, area_code)| AreaAssignment {
                        area_code,
                        sequence_index,
                    })
                    .collect()
            }
            None => distributor::assign(&self.config.areas, ordinal, total, &seed)?,
        };

        let budget = SessionBudget {
            max_items: request.max_items,
            max_runtime_minutes: request
                .max_runtime_minutes
                .unwrap_or(self.config.default_max_runtime_minutes),
        };
        let fingerprint_id = self.catalog.select(&request.session_id).id.clone();

        Ok(Session::start(
            request.session_id.clone(),
            ordinal,
            seed,
            request.mode,
            budget,
            assigned_areas,
            fingerprint_id,
        ))
    }

    async fn reject<R: SessionReporter>(
        &self,
        request: &InvocationRequest,
        error: AppError,
        reporter: &R,
    ) -> SessionSummary {
        tracing::error!(session_id = %request.session_id, error = %error, "Invalid invocation");

        let date = request.date.unwrap_or_else(|| Utc::now().date_naive());
        let mut session = Session::start(
            request.session_id.clone(),
            request.session_ordinal.unwrap_or(0),
            date_seed(date),
            request.mode,
            SessionBudget {
                max_items: request.max_items,
                max_runtime_minutes: request.max_runtime_minutes.unwrap_or(0),
            },
            Vec::new(),
            String::new(),
        );
        session.finish(SessionStatus::Failed, Some(error.to_string()));
        let summary = session.summary();

        if !session.session_id.trim().is_empty()
            && let Err(e) = self.sink.finish(&session, &summary).await
        {
            tracing::error!(session_id = %session.session_id, error = %e, "Failed to write session summary");
        }
        reporter.report(SessionEvent::Finished { summary: &summary });
        summary
    }

    fn session_context(
        &self,
        session: &Session,
        request: &InvocationRequest,
        cancel: CancellationToken,
        started: Instant,
    ) -> SessionContext<T, P> {
        let profile = self.catalog.select(&session.session_id).clone();
        let breaker = CircuitBreaker::new(session.session_id.clone(), self.config.breaker.clone());
        let pacer = match self.pacer_seed {
            Some(seed) => BehavioralPacer::seeded(self.config.pacing.clone(), session.mode, seed),
            None => BehavioralPacer::from_entropy(self.config.pacing.clone(), session.mode),
        }
        .with_cancellation(cancel.clone());

        let site = match &request.entry_point {
            Some(base) => self.config.site.with_base_url(base.clone()),
            None => self.config.site.clone(),
        };

        SessionContext {
            collector: PageCollector::new(
                self.transport.clone(),
                self.parser.clone(),
                breaker.clone(),
                pacer.clone(),
                site,
            ),
            extractor: DetailExtractor::new(
                self.transport.clone(),
                self.parser.clone(),
                breaker.clone(),
                pacer.clone(),
                self.config.retry.clone(),
            ),
            profile,
            breaker,
            pacer,
            deadline: started + session.budget.max_runtime(),
            cancel,
            unhealthy_since: None,
        }
    }

    async fn drive<R: SessionReporter>(
        &self,
        session: &mut Session,
        ctx: &mut SessionContext<T, P>,
        reporter: &R,
    ) -> Result<(), Halt> {
        let areas: Vec<AreaCode> = session
            .assigned_areas
            .iter()
            .map(|a| a.area_code.clone())
            .collect();
        let total = areas.len();

        for (index, area) in areas.iter().enumerate() {
            if index > 0 {
                ctx.pacer.pause(DelayKind::AreaTransition).await;
            }
            self.check_budget(session, ctx)?;

            reporter.report(SessionEvent::AreaStarted {
                session_id: &session.session_id,
                area,
                index,
                total,
            });

            let mut records = Vec::new();
            let result = self
                .run_area(session, ctx, area, &mut records, reporter)
                .await;

            // Partial areas are flushed too; aborted sessions keep what they collected.
            if !records.is_empty() {
                self.sink
                    .append(session, &records)
                    .await
                    .map_err(|e| Halt::Fail(e.to_string()))?;
            }
            let reason = result?;

            session.areas_completed += 1;
            reporter.report(SessionEvent::AreaFinished {
                session_id: &session.session_id,
                area,
                reason: &reason,
                items: records.len(),
            });
            self.checkpoint(session, ctx, reporter).await?;
        }

        Ok(())
    }

    async fn run_area<R: SessionReporter>(
        &self,
        session: &mut Session,
        ctx: &mut SessionContext<T, P>,
        area: &AreaCode,
        records: &mut Vec<ListingRecord>,
        reporter: &R,
    ) -> Result<StopReason, Halt> {
        let mut cursor = ctx.collector.cursor(area.clone(), 1);

        loop {
            let Some(batch) = ctx.collector.next_batch(&mut cursor, &ctx.profile).await else {
                if cursor.stop_reason() == Some(&StopReason::CircuitOpen) {
                    self.wait_for_breaker(session, ctx, reporter).await?;
                    cursor.resume();
                    continue;
                }
                return Ok(cursor
                    .stop_reason()
                    .cloned()
                    .unwrap_or(StopReason::Exhausted));
            };

            ctx.note_recovery();

            for url in batch {
                // A URL refused by an open breaker gets one more attempt after the wait.
                let mut refused = false;
                loop {
                    let result = ctx
                        .extractor
                        .extract(&url, area, &ctx.profile, &session.session_id)
                        .await;
                    match result {
                        Ok(record) => {
                            session.items_collected += 1;
                            records.push(record);
                        }
                        Err(failure)
                            if failure.reason == FailureReason::CircuitOpen && !refused =>
                        {
                            refused = true;
                            self.wait_for_breaker(session, ctx, reporter).await?;
                            continue;
                        }
                        Err(failure) => {
                            session.items_failed += 1;
                            reporter.report(SessionEvent::ItemFailed {
                                session_id: &session.session_id,
                                failure: &failure,
                            });
                        }
                    }
                    break;
                }

                ctx.note_recovery();
                self.adjust_pacing(session, ctx, reporter);
                self.check_budget(session, ctx)?;
            }
        }
    }

    /// Block until the breaker admits trial requests, or abort if it will not
    /// within the cooldown or the runtime budget.
    ///
    /// The cooldown counts from the first wait since the breaker was last
    /// closed, so a breaker that keeps failing its half-open trials still
    /// runs it out.
    async fn wait_for_breaker<R: SessionReporter>(
        &self,
        session: &Session,
        ctx: &mut SessionContext<T, P>,
        reporter: &R,
    ) -> Result<(), Halt> {
        let cooldown = self.config.breaker_cooldown;

        while let Some(retry_after) = ctx.breaker.time_until_half_open() {
            if ctx.unhealthy_for() + retry_after > cooldown {
                return Err(Halt::Abort(format!(
                    "circuit breaker stayed open beyond the {}s cooldown",
                    cooldown.as_secs()
                )));
            }
            if Instant::now() + retry_after >= ctx.deadline {
                return Err(Halt::Abort(runtime_exhausted(session)));
            }

            reporter.report(SessionEvent::WaitingForBreaker {
                session_id: &session.session_id,
                retry_after,
            });
            tokio::select! {
                () = tokio::time::sleep(retry_after) => {}
                () = ctx.cancel.cancelled() => return Err(Halt::Abort(CANCELLED.into())),
            }
        }
        Ok(())
    }

    fn adjust_pacing<R: SessionReporter>(
        &self,
        session: &Session,
        ctx: &SessionContext<T, P>,
        reporter: &R,
    ) {
        let signal = ctx.breaker.detection_signal();
        let factor = signal.slowdown_factor();
        if (factor - ctx.pacer.slowdown()).abs() > f64::EPSILON {
            ctx.pacer.set_slowdown(factor);
            reporter.report(SessionEvent::Slowdown {
                session_id: &session.session_id,
                risk: signal.risk,
                factor,
            });
        }
    }

    fn check_budget(&self, session: &Session, ctx: &SessionContext<T, P>) -> Result<(), Halt> {
        if ctx.cancel.is_cancelled() {
            return Err(Halt::Abort(CANCELLED.into()));
        }
        if Instant::now() >= ctx.deadline {
            return Err(Halt::Abort(runtime_exhausted(session)));
        }
        if let Some(max) = session.budget.max_items
            && session.items_collected >= max
        {
            return Err(Halt::Abort(format!("item budget of {max} reached")));
        }
        Ok(())
    }

    async fn checkpoint<R: SessionReporter>(
        &self,
        session: &mut Session,
        ctx: &SessionContext<T, P>,
        reporter: &R,
    ) -> Result<(), Halt> {
        session.last_checkpoint = Some(Utc::now());
        session.breaker = Some(ctx.breaker.snapshot());
        self.store
            .checkpoint(session)
            .await
            .map_err(|e| Halt::Fail(e.to_string()))?;

        reporter.report(SessionEvent::Checkpointed {
            session_id: &session.session_id,
            areas_completed: session.areas_completed,
            items_collected: session.items_collected,
        });
        Ok(())
    }

    async fn finalize<R: SessionReporter>(
        &self,
        mut session: Session,
        outcome: Result<(), Halt>,
        breaker: &CircuitBreaker,
        reporter: &R,
    ) -> SessionSummary {
        let (status, reason) = match outcome {
            Ok(()) => (SessionStatus::Completed, None),
            Err(Halt::Abort(reason)) => (SessionStatus::Aborted, Some(reason)),
            Err(Halt::Fail(reason)) => (SessionStatus::Failed, Some(reason)),
        };
        session.last_checkpoint = Some(Utc::now());
        session.breaker = Some(breaker.snapshot());
        session.finish(status, reason);

        if let Err(e) = self.store.checkpoint(&session).await {
            tracing::error!(session_id = %session.session_id, error = %e, "Failed to persist terminal session state");
            if status != SessionStatus::Failed {
                session.finish(
                    SessionStatus::Failed,
                    Some(format!("final checkpoint failed: {e}")),
                );
            }
        }

        let mut summary = session.summary();
        if let Err(e) = self.sink.finish(&session, &summary).await {
            tracing::error!(session_id = %session.session_id, error = %e, "Failed to write session summary");
            if session.status != SessionStatus::Failed {
                session.finish(
                    SessionStatus::Failed,
                    Some(format!("summary write failed: {e}")),
                );
                summary = session.summary();
            }
        }

        reporter.report(SessionEvent::Finished { summary: &summary });
        summary
    }
}

const CANCELLED: &str = "cancelled by scheduler";

fn runtime_exhausted(session: &Session) -> String {
    format!(
        "runtime budget of {} minute(s) exhausted",
        session.budget.max_runtime_minutes
    )
}
