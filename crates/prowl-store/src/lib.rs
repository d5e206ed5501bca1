pub mod config;
pub mod database;
pub mod session_repository;
pub mod sink;

pub use config::DatabaseConfig;
pub use database::Database;
pub use session_repository::PgSessionStore;
pub use sink::NdjsonFileSink;
