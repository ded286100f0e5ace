use crate::klcommon::binance::BinanceClient;
use crate::klcommon::config::{ExchangeConfig, ExchangeKind};
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{Bar, Interval, RateLimitSpec};
use crate::klcommon::okx::OkxClient;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 每次向交易所发出HTTP请求之前的放行点
///
/// 分页请求逐页经过这里，限频按实际请求数计算而不是按任务数。
#[async_trait]
pub trait RequestGate: Send + Sync {
    async fn admit_request(&self, exchange: &str);
}

/// 交易所适配器的统一能力
///
/// `fetch_bars` 返回 `[start, end)` 区间内按开盘时间排序的K线，
/// 分页由适配器内部完成，直到覆盖整个区间或到达交易所的历史起点。
/// 每一页请求发出前都要经过 `gate`。
/// 除了HTTP连接池以外，调用之间不保留任何状态。
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// 交易所标识，与配置中的 name 一致
    fn exchange_id(&self) -> &str;

    async fn fetch_bars(
        &self,
        gate: &dyn RequestGate,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Bar>>;

    /// 交易所当前上线的交易对，格式为 BASE/QUOTE
    async fn fetch_symbols(&self, gate: &dyn RequestGate) -> Result<Vec<String>>;

    fn rate_limit(&self) -> RateLimitSpec;
}

/// 根据配置创建对应的适配器
pub fn build_exchange_client(config: &ExchangeConfig) -> Result<Arc<dyn ExchangeClient>> {
    let client: Arc<dyn ExchangeClient> = match config.kind {
        ExchangeKind::BinanceSpot | ExchangeKind::BinanceUsdm => Arc::new(BinanceClient::new(config.clone())?),
        ExchangeKind::Okx => Arc::new(OkxClient::new(config.clone())?),
    };
    info!(
        target: "api",
        log_type = "module",
        exchange = %config.name,
        kind = ?config.kind,
        endpoint = %config.base_url,
        "🌐 交易所客户端初始化完成"
    );
    Ok(client)
}

/// 创建带超时与可选代理的HTTP客户端
pub(crate) fn create_http_client(config: &ExchangeConfig) -> Result<Client> {
    let builder = Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("kline_ingest/", env!("CARGO_PKG_VERSION")));

    let builder = match &config.proxy_url {
        Some(proxy_url) => match reqwest::Proxy::all(proxy_url) {
            Ok(proxy) => builder.proxy(proxy),
            Err(e) => {
                warn!(target: "api", log_type = "module", "设置代理失败，将尝试直接连接: {} - {}", proxy_url, e);
                builder
            }
        },
        None => builder,
    };

    builder
        .build()
        .map_err(|e| AppError::ConfigError(format!("创建HTTP客户端失败: {}", e)))
}

/// 把HTTP传输层错误转换为瞬时网络错误
pub(crate) fn transport_error(exchange: &str, url: &str, e: reqwest::Error) -> AppError {
    AppError::TransientNetworkError(format!("{} 请求失败: {} - {}", exchange, url, e))
}

/// 解析 Retry-After 头（秒）
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// 解析价格字段，交易所有时返回字符串有时返回数字
pub(crate) fn parse_decimal(value: &serde_json::Value, field: &str) -> Result<Decimal> {
    let parsed = match value {
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    };
    parsed.ok_or_else(|| AppError::TransientNetworkError(format!("无法解析字段 {}: {}", field, value)))
}

/// 解析时间戳字段（毫秒）
pub(crate) fn parse_timestamp(value: &serde_json::Value) -> Result<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| AppError::TransientNetworkError(format!("无法解析时间戳: {}", value)))
}

/// 截取响应文本用于日志
pub(crate) fn preview(text: &str) -> &str {
    let mut end = text.len().min(500);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// BASE/QUOTE 拆分
pub(crate) fn split_symbol(symbol: &str) -> Result<(&str, &str)> {
    symbol
        .split_once('/')
        .filter(|(base, quote)| !base.is_empty() && !quote.is_empty())
        .ok_or_else(|| AppError::SymbolNotFound(format!("交易对格式应为 BASE/QUOTE: {}", symbol)))
}
