// 采集流水线
pub mod gap_audit;
pub mod orchestrator;
pub mod rate_limiter;
pub mod scheduler;
pub mod series;
pub mod storage_writer;
pub mod validator;
pub mod worker_pool;

pub use gap_audit::{GapAuditor, SeriesGapReport};
pub use orchestrator::{IngestionOrchestrator, RunReport};
pub use rate_limiter::RateLimiter;
pub use scheduler::Scheduler;
pub use series::{Phase, SeriesState, SeriesSummary, SeriesTracker};
pub use storage_writer::{StorageWriter, WriteAck, WriteFailure};
pub use validator::{BarValidator, ValidationReport};
pub use worker_pool::{FetchJob, WorkerPool, WorkerPoolConfig};
