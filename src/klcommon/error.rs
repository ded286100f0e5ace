use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    // --- 交易所适配层 ---
    #[error("Rate limit exceeded on {exchange}: {message}")]
    RateLimitExceeded {
        exchange: String,
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Transient network error: {0}")]
    TransientNetworkError(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    // --- 校验层 ---
    #[error("Malformed bar: {0}")]
    MalformedBarError(String),

    #[error("Invalid bar: {0}")]
    InvalidBarError(String),

    // --- 存储层 ---
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    // --- 基础设施 ---
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// 错误分类，重试策略只根据分类做分支
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimitExceeded,
    TransientNetworkError,
    SymbolNotFound,
    AuthenticationError,
    MalformedBarError,
    InvalidBarError,
    StorageUnavailable,
    ConstraintViolation,
    Configuration,
    Internal,
}

impl ErrorKind {
    /// 瞬时错误按指数退避重试，其余错误直接使序列降级
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimitExceeded | ErrorKind::TransientNetworkError | ErrorKind::StorageUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimitExceeded => "RateLimitExceeded",
            ErrorKind::TransientNetworkError => "TransientNetworkError",
            ErrorKind::SymbolNotFound => "SymbolNotFound",
            ErrorKind::AuthenticationError => "AuthenticationError",
            ErrorKind::MalformedBarError => "MalformedBarError",
            ErrorKind::InvalidBarError => "InvalidBarError",
            ErrorKind::StorageUnavailable => "StorageUnavailable",
            ErrorKind::ConstraintViolation => "ConstraintViolation",
            ErrorKind::Configuration => "Configuration",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            AppError::TransientNetworkError(_) => ErrorKind::TransientNetworkError,
            AppError::SymbolNotFound(_) => ErrorKind::SymbolNotFound,
            AppError::AuthenticationError(_) => ErrorKind::AuthenticationError,
            AppError::MalformedBarError(_) => ErrorKind::MalformedBarError,
            AppError::InvalidBarError(_) => ErrorKind::InvalidBarError,
            AppError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            AppError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,

            // 网络层错误和交易所返回的无法解析的响应都视为瞬时错误
            AppError::HttpError(_) | AppError::JsonError(_) => ErrorKind::TransientNetworkError,

            AppError::SqliteError(e) => {
                if is_constraint_violation(e) {
                    ErrorKind::ConstraintViolation
                } else {
                    ErrorKind::StorageUnavailable
                }
            }

            AppError::ConfigError(_) => ErrorKind::Configuration,
            AppError::IoError(_) | AppError::CsvError(_) | AppError::DataError(_) | AppError::ChannelError(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// 交易所建议的等待时间
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::RateLimitExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// 获取错误类型的简洁摘要，日志中用于错误聚合
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            AppError::RateLimitExceeded { .. } => "exchange_rate_limited",
            AppError::TransientNetworkError(_) => "market_data_connection_failed",
            AppError::SymbolNotFound(_) => "exchange_symbol_unknown",
            AppError::AuthenticationError(_) => "exchange_credentials_rejected",
            AppError::MalformedBarError(_) => "kline_timestamp_misaligned",
            AppError::InvalidBarError(_) => "kline_data_validation_failed",
            AppError::StorageUnavailable(_) => "kline_data_persistence_failed",
            AppError::ConstraintViolation(_) => "kline_storage_constraint_violated",
            AppError::HttpError(_) => "market_data_connection_failed",
            AppError::JsonError(_) => "kline_data_parsing_failed",
            AppError::SqliteError(_) => "kline_storage_operation_failed",
            AppError::IoError(_) => "kline_file_operation_failed",
            AppError::CsvError(_) => "kline_export_failed",
            AppError::ConfigError(_) => "kline_service_configuration_invalid",
            AppError::DataError(_) => "kline_data_corrupted",
            AppError::ChannelError(_) => "kline_processing_pipeline_failed",
        }
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let retryable = [
            AppError::RateLimitExceeded {
                exchange: "binance".into(),
                retry_after: None,
                message: "429".into(),
            },
            AppError::TransientNetworkError("reset".into()),
            AppError::StorageUnavailable("locked".into()),
        ];
        for e in &retryable {
            assert!(e.is_retryable(), "{} 应该可重试", e);
        }

        let fatal = [
            AppError::SymbolNotFound("FOO/BAR".into()),
            AppError::AuthenticationError("bad key".into()),
            AppError::ConstraintViolation("dup".into()),
            AppError::ConfigError("bad".into()),
        ];
        for e in &fatal {
            assert!(!e.is_retryable(), "{} 不应重试", e);
        }
    }

    #[test]
    fn test_sqlite_constraint_is_classified() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("NOT NULL constraint failed".into()),
        );
        assert_eq!(AppError::from(err).kind(), ErrorKind::ConstraintViolation);

        let busy = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None);
        assert_eq!(AppError::from(busy).kind(), ErrorKind::StorageUnavailable);
    }

    #[test]
    fn test_retry_after_hint() {
        let e = AppError::RateLimitExceeded {
            exchange: "okx".into(),
            retry_after: Some(Duration::from_secs(3)),
            message: "too many".into(),
        };
        assert_eq!(e.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(AppError::SymbolNotFound("x".into()).retry_after(), None);
    }
}
