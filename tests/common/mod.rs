// 集成测试共用的模拟交易所与配置
#![allow(dead_code)]

use async_trait::async_trait;
use kline_ingest::klcommon::models::{GapRange, RateLimitSpec, SeriesKey, TimeRange, Watermark};
use kline_ingest::klcommon::{
    AppError, Bar, BarStore, ExchangeClient, IngestConfig, Interval, RequestGate, Result, SqliteStore,
};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const HOUR: i64 = 3_600_000;
/// 整点时间 2023-11-14 22:00:00 UTC
pub const NOW: i64 = 1_699_999_200_000;

#[derive(Debug, Clone, Copy)]
pub enum FailureMode {
    None,
    /// 每次都返回认证错误
    Auth,
    /// 前 N 次返回瞬时网络错误
    Transient(usize),
    /// 前 N 次返回限频错误
    RateLimited(usize),
}

/// 按请求区间生成完整K线的模拟交易所
pub struct MockExchangeClient {
    name: String,
    listed: Vec<String>,
    missing: HashSet<i64>,
    failure: FailureMode,
    calls: AtomicUsize,
    requests: Mutex<Vec<(String, i64, i64)>>,
    call_times: Mutex<Vec<Instant>>,
}

impl MockExchangeClient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            listed: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            missing: HashSet::new(),
            failure: FailureMode::None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            call_times: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failure(mut self, failure: FailureMode) -> Self {
        self.failure = failure;
        self
    }

    /// 这些开盘时间的K线不返回
    pub fn with_missing(mut self, open_times: &[i64]) -> Self {
        self.missing.extend(open_times.iter().copied());
        self
    }

    pub fn with_listed(mut self, symbols: &[&str]) -> Self {
        self.listed = symbols.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(String, i64, i64)> {
        self.requests.lock().unwrap().clone()
    }

    /// 相邻两次抓取之间的间隔
    pub fn call_gaps(&self) -> Vec<Duration> {
        let times = self.call_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn calls_for(&self, symbol: &str) -> usize {
        self.requests().iter().filter(|(s, _, _)| s == symbol).count()
    }

    fn bar(&self, symbol: &str, interval: Interval, open_time: i64) -> Bar {
        Bar {
            exchange: self.name.clone(),
            symbol: symbol.to_string(),
            interval,
            open_time,
            open: Decimal::new(1000, 1),
            high: Decimal::new(1100, 1),
            low: Decimal::new(900, 1),
            close: Decimal::new(1050, 1),
            volume: Decimal::new(25, 1),
        }
    }
}

#[async_trait]
impl ExchangeClient for MockExchangeClient {
    fn exchange_id(&self) -> &str {
        &self.name
    }

    async fn fetch_bars(
        &self,
        gate: &dyn RequestGate,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Bar>> {
        gate.admit_request(&self.name).await;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        self.requests
            .lock()
            .unwrap()
            .push((symbol.to_string(), start_ms, end_ms));

        match self.failure {
            FailureMode::Auth => {
                return Err(AppError::AuthenticationError(format!("{} 拒绝了API Key", self.name)));
            }
            FailureMode::Transient(n) if call < n => {
                return Err(AppError::TransientNetworkError("connection reset by peer".to_string()));
            }
            FailureMode::RateLimited(n) if call < n => {
                return Err(AppError::RateLimitExceeded {
                    exchange: self.name.clone(),
                    retry_after: Some(Duration::from_millis(5)),
                    message: "too many requests".to_string(),
                });
            }
            _ => {}
        }

        let step = interval.duration_ms();
        let mut bars = Vec::new();
        let mut open_time = interval.align(start_ms);
        if open_time < start_ms {
            open_time += step;
        }
        while open_time < end_ms {
            if !self.missing.contains(&open_time) {
                bars.push(self.bar(symbol, interval, open_time));
            }
            open_time += step;
        }
        Ok(bars)
    }

    async fn fetch_symbols(&self, gate: &dyn RequestGate) -> Result<Vec<String>> {
        gate.admit_request(&self.name).await;
        Ok(self.listed.clone())
    }

    fn rate_limit(&self) -> RateLimitSpec {
        RateLimitSpec {
            requests_per_window: 1000,
            window: Duration::from_secs(1),
        }
    }
}

/// 单交易所 "mock"、1h 周期、回补2天的配置
pub fn test_config(symbols: &[&str], verify_symbols: bool) -> IngestConfig {
    let symbols = symbols
        .iter()
        .map(|s| format!("\"{}\"", s))
        .collect::<Vec<_>>()
        .join(", ");
    let toml = format!(
        r#"
[ingest]
symbols = [{symbols}]
interval = "1h"
historical_days = 2
max_bars_per_task = 1000
workers = 4
verify_symbols = {verify_symbols}

[retry]
max_attempts = 3
base_backoff_ms = 1
max_backoff_ms = 10

[[exchanges]]
name = "mock"
kind = "binance_spot"
base_url = "http://127.0.0.1:9"
requests_per_window = 1000
window_secs = 1
max_concurrency = 2

[logging]
log_level = "warn"
enable_console_output = false
"#
    );
    IngestConfig::from_toml_str(&toml).unwrap()
}

/// 第 `fail_on` 次写入K线时失败一次，其余调用全部转交给 SQLite
pub struct FlakyStore {
    inner: SqliteStore,
    fail_on: usize,
    upserts: AtomicUsize,
}

impl FlakyStore {
    pub fn new(fail_on: usize) -> Self {
        Self {
            inner: SqliteStore::in_memory().unwrap(),
            fail_on,
            upserts: AtomicUsize::new(0),
        }
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BarStore for FlakyStore {
    async fn upsert_bars(&self, bars: Vec<Bar>) -> Result<usize> {
        let call = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(AppError::StorageUnavailable("database is locked".to_string()));
        }
        self.inner.upsert_bars(bars).await
    }

    async fn bars_in_range(&self, key: &SeriesKey, range: TimeRange) -> Result<Vec<Bar>> {
        self.inner.bars_in_range(key, range).await
    }

    async fn latest_open_time(&self, key: &SeriesKey) -> Result<Option<i64>> {
        self.inner.latest_open_time(key).await
    }

    async fn load_watermark(&self, key: &SeriesKey) -> Result<Option<Watermark>> {
        self.inner.load_watermark(key).await
    }

    async fn save_watermark(&self, key: &SeriesKey, watermark: Watermark) -> Result<()> {
        self.inner.save_watermark(key, watermark).await
    }

    async fn record_gaps(&self, key: &SeriesKey, gaps: Vec<GapRange>, detected_at: i64) -> Result<()> {
        self.inner.record_gaps(key, gaps, detected_at).await
    }

    async fn load_gaps(&self, key: &SeriesKey) -> Result<Vec<GapRange>> {
        self.inner.load_gaps(key).await
    }
}
