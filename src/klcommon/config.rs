//! 采集服务配置模块

use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{Interval, RateLimitSpec, SeriesKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/KlineIngestConfig.toml";

/// 覆盖交易对列表的环境变量（逗号分隔）
pub const SYMBOLS_ENV: &str = "TRADING_SYMBOLS";

fn default_update_interval_secs() -> u64 {
    3600
}

fn default_max_bars_per_task() -> usize {
    1000
}

fn default_workers() -> usize {
    8
}

fn default_page_limit() -> usize {
    1000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    4
}

fn default_true() -> bool {
    true
}

/// 采集服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub ingest: IngestSettings,

    #[serde(default)]
    pub retry: RetryConfig,

    pub exchanges: Vec<ExchangeConfig>,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 采集范围与节奏
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    /// 交易对列表，格式为 BASE/QUOTE
    pub symbols: Vec<String>,

    /// K线周期，如 "1h"
    pub interval: String,

    /// 新序列需要回补的历史天数
    pub historical_days: i64,

    /// 增量更新间隔（秒）
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    /// 单个任务最多覆盖的K线数量
    #[serde(default = "default_max_bars_per_task")]
    pub max_bars_per_task: usize,

    /// 并发worker总数
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// 启动时是否向交易所核对交易对列表
    #[serde(default)]
    pub verify_symbols: bool,
}

/// 重试与退避
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 连续失败多少次后序列降级
    pub max_attempts: u32,

    /// 初始退避（毫秒）
    pub base_backoff_ms: u64,

    /// 退避上限（毫秒）
    pub max_backoff_ms: u64,
}

/// 交易所适配器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    BinanceSpot,
    BinanceUsdm,
    Okx,
}

/// 单个交易所配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// 交易所标识，写入存储的 exchange 字段
    pub name: String,

    pub kind: ExchangeKind,

    /// REST 端点，如 https://api.binance.com
    pub base_url: String,

    /// 限频窗口内允许的请求数
    pub requests_per_window: u32,

    /// 限频窗口长度（秒）
    pub window_secs: u64,

    /// 该交易所同时进行的请求上限
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// 单页K线数量上限
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,

    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// 代理地址，如 socks5://127.0.0.1:1080
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// 保存API Key的环境变量名
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,

    /// 单个事务写入的K线数量
    pub batch_size: usize,

    /// 是否启用WAL模式
    #[serde(default = "default_true")]
    pub enable_wal: bool,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,

    /// 日志文件目录，为空时不写文件
    pub log_dir: Option<String>,

    /// 是否输出JSON格式
    #[serde(default)]
    pub json: bool,

    /// 是否启用控制台输出
    #[serde(default = "default_true")]
    pub enable_console_output: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "data/klines.db".to_string(),
            pool_size: 4,
            batch_size: 500,
            enable_wal: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: Some("logs".to_string()),
            json: false,
            enable_console_output: true,
        }
    }
}

impl RetryConfig {
    /// 第 `attempt` 次失败后的等待时间：min(base * 2^(attempt-1), max)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.base_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

impl ExchangeConfig {
    pub fn rate_limit(&self) -> RateLimitSpec {
        RateLimitSpec {
            requests_per_window: self.requests_per_window,
            window: Duration::from_secs(self.window_secs),
        }
    }

    /// 从配置的环境变量中读取API Key
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
    }
}

impl IngestConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// 解析TOML并校验
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 按 `--config` > `CONFIG_PATH` > 默认路径 的顺序加载，并应用环境变量覆盖
    pub fn load(explicit_path: Option<&str>) -> Result<Self> {
        let path = explicit_path
            .map(|p| p.to_string())
            .or_else(|| std::env::var("CONFIG_PATH").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        if !Path::new(&path).exists() {
            return Err(AppError::ConfigError(format!("配置文件不存在: {}", path)));
        }

        let mut config = Self::from_file(&path)?;
        if let Ok(symbols) = std::env::var(SYMBOLS_ENV) {
            config.override_symbols(&symbols)?;
        }
        Ok(config)
    }

    /// 用逗号分隔的字符串覆盖交易对列表
    pub fn override_symbols(&mut self, symbols: &str) -> Result<()> {
        self.ingest.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self.validate()
    }

    /// 解析后的K线周期
    pub fn interval(&self) -> Result<Interval> {
        self.ingest.interval.parse()
    }

    /// 所有需要采集的序列
    pub fn series_keys(&self) -> Result<Vec<SeriesKey>> {
        let interval = self.interval()?;
        let mut keys = Vec::with_capacity(self.exchanges.len() * self.ingest.symbols.len());
        for exchange in &self.exchanges {
            for symbol in &self.ingest.symbols {
                keys.push(SeriesKey::new(exchange.name.clone(), symbol.clone(), interval));
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeConfig> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.ingest.update_interval_secs)
    }

    /// 验证配置的有效性，任何抓取开始前执行
    pub fn validate(&self) -> Result<()> {
        self.interval()?;

        if self.ingest.symbols.is_empty() {
            return Err(AppError::ConfigError("交易对列表不能为空".to_string()));
        }

        for symbol in &self.ingest.symbols {
            let valid = symbol
                .split_once('/')
                .map(|(base, quote)| !base.is_empty() && !quote.is_empty())
                .unwrap_or(false);
            if !valid {
                return Err(AppError::ConfigError(format!("交易对格式应为 BASE/QUOTE: {}", symbol)));
            }
        }

        if self.ingest.historical_days <= 0 {
            return Err(AppError::ConfigError(format!(
                "historical_days 必须大于0，当前为 {}",
                self.ingest.historical_days
            )));
        }

        if self.ingest.max_bars_per_task == 0 {
            return Err(AppError::ConfigError("max_bars_per_task 必须大于0".to_string()));
        }

        if self.ingest.workers == 0 {
            return Err(AppError::ConfigError("workers 必须大于0".to_string()));
        }

        if self.ingest.update_interval_secs == 0 {
            return Err(AppError::ConfigError("update_interval_secs 必须大于0".to_string()));
        }

        if self.retry.max_attempts == 0 {
            return Err(AppError::ConfigError("retry.max_attempts 必须大于0".to_string()));
        }

        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(AppError::ConfigError("retry.base_backoff_ms 不能大于 max_backoff_ms".to_string()));
        }

        if self.exchanges.is_empty() {
            return Err(AppError::ConfigError("至少需要配置一个交易所".to_string()));
        }

        let mut names = HashSet::new();
        for exchange in &self.exchanges {
            if exchange.name.trim().is_empty() {
                return Err(AppError::ConfigError("交易所名称不能为空".to_string()));
            }
            if !names.insert(exchange.name.as_str()) {
                return Err(AppError::ConfigError(format!("重复的交易所配置: {}", exchange.name)));
            }
            if exchange.requests_per_window == 0 || exchange.window_secs == 0 {
                return Err(AppError::ConfigError(format!("{}: 限频配置必须大于0", exchange.name)));
            }
            if exchange.max_concurrency == 0 {
                return Err(AppError::ConfigError(format!("{}: max_concurrency 必须大于0", exchange.name)));
            }
            if exchange.page_limit == 0 {
                return Err(AppError::ConfigError(format!("{}: page_limit 必须大于0", exchange.name)));
            }
            url::Url::parse(&exchange.base_url).map_err(|e| {
                AppError::ConfigError(format!("{}: 无效的 base_url {}: {}", exchange.name, exchange.base_url, e))
            })?;
        }

        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }

        if self.database.batch_size == 0 {
            return Err(AppError::ConfigError("批量写入大小必须大于0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[ingest]
symbols = ["BTC/USDT", "ETH/USDT"]
interval = "1h"
historical_days = 2

[retry]
max_attempts = 3
base_backoff_ms = 100
max_backoff_ms = 1000

[[exchanges]]
name = "binance"
kind = "binance_spot"
base_url = "https://api.binance.com"
requests_per_window = 1200
window_secs = 60

[[exchanges]]
name = "okx"
kind = "okx"
base_url = "https://www.okx.com"
requests_per_window = 20
window_secs = 2
page_limit = 100
"#;

    #[test]
    fn test_parse_sample() {
        let config = IngestConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.interval().unwrap(), Interval::H1);
        assert_eq!(config.ingest.max_bars_per_task, 1000);
        assert_eq!(config.exchanges[1].kind, ExchangeKind::Okx);
        assert_eq!(config.exchanges[1].page_limit, 100);
        assert_eq!(config.database.batch_size, 500);

        let keys = config.series_keys().unwrap();
        assert_eq!(keys.len(), 4);
        assert_eq!(keys[0].to_string(), "binance:BTC/USDT:1h");
    }

    #[test]
    fn test_rejects_unknown_interval() {
        let bad = SAMPLE.replace("interval = \"1h\"", "interval = \"7h\"");
        assert!(IngestConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn test_rejects_empty_symbols() {
        let bad = SAMPLE.replace(r#"symbols = ["BTC/USDT", "ETH/USDT"]"#, "symbols = []");
        let err = IngestConfig::from_toml_str(&bad).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn test_rejects_non_positive_days() {
        let zero = SAMPLE.replace("historical_days = 2", "historical_days = 0");
        assert!(IngestConfig::from_toml_str(&zero).is_err());
        let negative = SAMPLE.replace("historical_days = 2", "historical_days = -5");
        assert!(IngestConfig::from_toml_str(&negative).is_err());
    }

    #[test]
    fn test_rejects_duplicate_exchange_and_bad_url() {
        let dup = SAMPLE.replace("name = \"okx\"", "name = \"binance\"");
        assert!(IngestConfig::from_toml_str(&dup).is_err());
        let bad_url = SAMPLE.replace("https://www.okx.com", "not a url");
        assert!(IngestConfig::from_toml_str(&bad_url).is_err());
    }

    #[test]
    fn test_override_symbols() {
        let mut config = IngestConfig::from_toml_str(SAMPLE).unwrap();
        config.override_symbols(" ADA/USDT , SOL/USDT,").unwrap();
        assert_eq!(config.ingest.symbols, vec!["ADA/USDT", "SOL/USDT"]);
        assert!(config.override_symbols(" , ").is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryConfig {
            max_attempts: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(500));
        assert_eq!(retry.backoff(60), Duration::from_millis(500));
    }
}
