//! SQLite persistence.

pub mod orchestrator;
pub mod pool;

pub use orchestrator::SqliteOrchestratorRepository;
pub use pool::{DatabasePool, PoolSettings};
