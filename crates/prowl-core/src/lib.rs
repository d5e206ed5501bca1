pub mod circuit_breaker;
pub mod collector;
pub mod config;
pub mod distributor;
pub mod error;
pub mod extractor;
pub mod fingerprint;
pub mod models;
pub mod orchestrator;
pub mod pacing;
pub mod store;
pub mod traits;

#[cfg(test)]
pub mod testutil;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, DetectionRisk};
pub use config::CrawlerConfig;
pub use error::AppError;
pub use fingerprint::{FingerprintCatalog, FingerprintProfile};
pub use models::{
    AreaCode, CrawlMode, InvocationRequest, ListingRecord, Session, SessionStatus, SessionSummary,
};
pub use orchestrator::{SessionOrchestrator, SessionReporter, TracingSessionReporter};
pub use pacing::BehavioralPacer;
pub use store::MemorySessionStore;
pub use traits::{ListingParser, NullSink, RecordSink, SessionStore, Transport};
