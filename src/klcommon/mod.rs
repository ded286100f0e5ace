// 导出共享模块
pub mod api;
pub mod binance;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod okx;

// 重新导出常用类型，方便使用
pub use api::{build_exchange_client, ExchangeClient, RequestGate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DatabaseConfig, ExchangeConfig, ExchangeKind, IngestConfig, LoggingConfig, RetryConfig};
pub use db::{BarStore, SqliteStore};
pub use error::{AppError, ErrorKind, Result};
pub use models::{
    Bar, FetchOutcome, FetchTask, GapRange, IngestionResult, Interval, RawBar, SeriesKey, TimeRange, Watermark,
    WatermarkStatus,
};
