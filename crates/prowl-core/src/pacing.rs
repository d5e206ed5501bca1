//! Human-like pacing between requests.
//!
//! The [`BehavioralPacer`] draws randomized delays from per-kind
//! distributions: short glances at listing pages, long dwell times on
//! detail pages, and medium pauses when moving to the next area. The
//! random source is injectable so tests can reproduce exact sequences.
//!
//! # Example
//!
//! ```rust,no_run
//! use prowl_core::models::CrawlMode;
//! use prowl_core::pacing::{BehavioralPacer, DelayKind, PacingConfig};
//!
//! # async fn run() {
//! let pacer = BehavioralPacer::from_entropy(PacingConfig::default(), CrawlMode::Stealth);
//! let slept = pacer.pause(DelayKind::PageView).await;
//! println!("slept for {slept:?}");
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::CrawlMode;

/// What the simulated user is doing while the delay elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    PageView,
    ItemRead,
    AreaTransition,
}

impl fmt::Display for DelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayKind::PageView => write!(f, "page_view"),
            DelayKind::ItemRead => write!(f, "item_read"),
            DelayKind::AreaTransition => write!(f, "area_transition"),
        }
    }
}

/// Delay distribution for one [`DelayKind`].
///
/// The base delay is the mean of two uniform draws over `[min_ms, max_ms]`,
/// which peaks in the middle of the range. With probability `pause_chance`
/// an extra uniform `[0, pause_extra_ms]` is added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayDistribution {
    pub min_ms: u64,
    pub max_ms: u64,
    #[serde(default)]
    pub pause_chance: f64,
    #[serde(default)]
    pub pause_extra_ms: u64,
}

impl DelayDistribution {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms,
            pause_chance: 0.0,
            pause_extra_ms: 0,
        }
    }

    /// Occasionally add a longer pause on top of the base delay.
    pub fn with_pause(mut self, chance: f64, extra_ms: u64) -> Self {
        self.pause_chance = chance;
        self.pause_extra_ms = extra_ms;
        self
    }

    /// A distribution that always yields zero.
    pub fn zero() -> Self {
        Self::new(0, 0)
    }

    fn validate(&self, kind: &str) -> Result<(), AppError> {
        if self.min_ms > self.max_ms {
            return Err(AppError::ConfigError(format!(
                "pacing.{kind}: min_ms ({}) exceeds max_ms ({})",
                self.min_ms, self.max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.pause_chance) {
            return Err(AppError::ConfigError(format!(
                "pacing.{kind}: pause_chance must be within 0.0..=1.0"
            )));
        }
        Ok(())
    }

    /// Draws one delay in milliseconds.
    fn sample_ms<R: Rng>(&self, rng: &mut R) -> f64 {
        let span = (self.max_ms - self.min_ms) as f64;
        let centred = (rng.gen_range(0.0..=1.0) + rng.gen_range(0.0..=1.0)) / 2.0;
        let mut ms = self.min_ms as f64 + span * centred;

        if self.pause_chance > 0.0 && self.pause_extra_ms > 0 && rng.gen_bool(self.pause_chance)
        {
            ms += rng.gen_range(0..=self.pause_extra_ms) as f64;
        }
        ms
    }
}

/// Per-kind delay distributions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub page_view: DelayDistribution,
    pub item_read: DelayDistribution,
    pub area_transition: DelayDistribution,
}

impl PacingConfig {
    /// No delays at all.
    pub fn instant() -> Self {
        Self {
            page_view: DelayDistribution::zero(),
            item_read: DelayDistribution::zero(),
            area_transition: DelayDistribution::zero(),
        }
    }

    pub fn distribution(&self, kind: DelayKind) -> &DelayDistribution {
        match kind {
            DelayKind::PageView => &self.page_view,
            DelayKind::ItemRead => &self.item_read,
            DelayKind::AreaTransition => &self.area_transition,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.page_view.validate("page_view")?;
        self.item_read.validate("item_read")?;
        self.area_transition.validate("area_transition")
    }
}

impl Default for PacingConfig {
    /// Glance 2-6s, read 8-25s (1 in 10 reads lingers up to 40s more), 30-90s between areas.
    fn default() -> Self {
        Self {
            page_view: DelayDistribution::new(2_000, 6_000),
            item_read: DelayDistribution::new(8_000, 25_000).with_pause(0.1, 40_000),
            area_transition: DelayDistribution::new(30_000, 90_000),
        }
    }
}

struct PacerState {
    rng: StdRng,
    slowdown: f64,
}

/// Randomized delay source for one session. Clones share the generator.
#[derive(Clone)]
pub struct BehavioralPacer {
    config: PacingConfig,
    scale: f64,
    state: Arc<Mutex<PacerState>>,
    cancel: CancellationToken,
}

impl BehavioralPacer {
    /// Deterministic pacer for tests and replays.
    pub fn seeded(config: PacingConfig, mode: CrawlMode, seed: u64) -> Self {
        Self::with_rng(config, mode, StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy(config: PacingConfig, mode: CrawlMode) -> Self {
        Self::with_rng(config, mode, StdRng::from_entropy())
    }

    fn with_rng(config: PacingConfig, mode: CrawlMode, rng: StdRng) -> Self {
        Self {
            config,
            scale: mode.pacing_scale(),
            state: Arc::new(Mutex::new(PacerState { rng, slowdown: 1.0 })),
            cancel: CancellationToken::new(),
        }
    }

    /// Pauses return early once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PacerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stretch every subsequent delay by `factor` (values below 1.0 are clamped).
    pub fn set_slowdown(&self, factor: f64) {
        let factor = factor.max(1.0);
        let mut state = self.lock_state();
        if (state.slowdown - factor).abs() > f64::EPSILON {
            tracing::debug!(from = state.slowdown, to = factor, "Adjusting pacing slowdown");
            state.slowdown = factor;
        }
    }

    pub fn slowdown(&self) -> f64 {
        self.lock_state().slowdown
    }

    /// Draw the next delay for `kind`.
    pub fn next_delay(&self, kind: DelayKind) -> Duration {
        let mut state = self.lock_state();
        let ms = self.config.distribution(kind).sample_ms(&mut state.rng);
        let scaled = ms * self.scale * state.slowdown;
        Duration::from_micros((scaled * 1000.0).round() as u64)
    }

    /// Draw a delay for `kind` and sleep for it. Returns the slept duration.
    pub async fn pause(&self, kind: DelayKind) -> Duration {
        let delay = self.next_delay(kind);
        if !delay.is_zero() {
            tracing::debug!(kind = %kind, delay_ms = %delay.as_millis(), "Pacing");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => {
                    tracing::debug!(kind = %kind, "Pause interrupted by cancellation");
                }
            }
        }
        delay
    }
}
