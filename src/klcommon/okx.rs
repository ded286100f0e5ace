//! OKX K线适配器
//!
//! history-candles 接口按时间倒序返回数据，`after` 参数表示"早于该时间戳"，
//! 因此分页从区间末尾向前推进，最后统一按开盘时间升序排列。

use crate::klcommon::api::{
    create_http_client, parse_decimal, parse_retry_after, parse_timestamp, preview, split_symbol, transport_error,
    ExchangeClient, RequestGate,
};
use crate::klcommon::config::ExchangeConfig;
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{Bar, Interval, RateLimitSpec};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, instrument};

const CANDLES_PATH: &str = "/api/v5/market/history-candles";
const INSTRUMENTS_PATH: &str = "/api/v5/public/instruments";

/// OKX统一响应格式
#[derive(Debug, Deserialize)]
struct OkxEnvelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OkxInstrument {
    #[serde(default)]
    base_ccy: String,
    #[serde(default)]
    quote_ccy: String,
    #[serde(default)]
    state: String,
}

#[derive(Clone, Debug)]
pub struct OkxClient {
    config: ExchangeConfig,
    client: Client,
}

impl OkxClient {
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        let client = create_http_client(&config)?;
        Ok(Self { config, client })
    }

    fn page_limit(&self) -> usize {
        // history-candles 单页上限为100
        self.config.page_limit.min(100)
    }

    async fn get_envelope<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        symbol: &str,
    ) -> Result<Vec<T>> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error(&self.config.name, &url, e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(&self.config.name, &url, e))?;

        let envelope: Option<OkxEnvelope<T>> = serde_json::from_str(&text).ok();
        let (code, msg) = envelope
            .as_ref()
            .map(|e| (e.code.clone(), e.msg.clone()))
            .unwrap_or_else(|| (String::new(), preview(&text).to_string()));

        if status.is_success() && code == "0" {
            if let Some(envelope) = envelope {
                return Ok(envelope.data);
            }
        }

        let err = classify_okx_error(&self.config.name, symbol, status, &code, &msg, retry_after);
        error!(
            target: "api",
            log_type = "module",
            exchange = %self.config.name,
            symbol = %symbol,
            status = %status,
            code = %code,
            error.summary = err.get_error_type_summary(),
            error.details = %err,
            "OKX请求失败"
        );
        Err(err)
    }
}

#[async_trait]
impl ExchangeClient for OkxClient {
    fn exchange_id(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self, gate), fields(exchange = %self.config.name), err)]
    async fn fetch_bars(
        &self,
        gate: &dyn RequestGate,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Bar>> {
        let inst_id = to_okx_inst_id(symbol)?;
        let limit = self.page_limit();
        let mut cursor = end_ms;
        let mut bars = Vec::new();

        while cursor > start_ms {
            let query = [
                ("instId", inst_id.clone()),
                ("bar", okx_bar(interval).to_string()),
                ("after", cursor.to_string()),
                ("limit", limit.to_string()),
            ];
            gate.admit_request(&self.config.name).await;
            let rows: Vec<Vec<Value>> = self.get_envelope(CANDLES_PATH, &query, symbol).await?;
            let page_len = rows.len();

            let mut oldest = cursor;
            for row in &rows {
                let Some(bar) = parse_candle_row(row, &self.config.name, symbol, interval)? else {
                    continue;
                };
                oldest = oldest.min(bar.open_time);
                if bar.open_time >= start_ms && bar.open_time < end_ms {
                    bars.push(bar);
                }
            }

            debug!(target: "api", exchange = %self.config.name, symbol = %symbol, rows = page_len, cursor, "获取K线分页成功");

            // 空页或短页说明已到达历史起点
            if page_len == 0 || oldest >= cursor || page_len < limit {
                break;
            }
            cursor = oldest;
        }

        bars.sort_by_key(|b| b.open_time);
        Ok(bars)
    }

    #[instrument(skip(self, gate), fields(exchange = %self.config.name), err)]
    async fn fetch_symbols(&self, gate: &dyn RequestGate) -> Result<Vec<String>> {
        let query = [("instType", "SPOT".to_string())];
        gate.admit_request(&self.config.name).await;
        let instruments: Vec<OkxInstrument> = self.get_envelope(INSTRUMENTS_PATH, &query, "*").await?;
        Ok(instruments
            .into_iter()
            .filter(|i| i.state == "live" && !i.base_ccy.is_empty() && !i.quote_ccy.is_empty())
            .map(|i| format!("{}/{}", i.base_ccy, i.quote_ccy))
            .collect())
    }

    fn rate_limit(&self) -> RateLimitSpec {
        self.config.rate_limit()
    }
}

/// BTC/USDT -> BTC-USDT
pub fn to_okx_inst_id(symbol: &str) -> Result<String> {
    let (base, quote) = split_symbol(symbol)?;
    Ok(format!("{}-{}", base.to_uppercase(), quote.to_uppercase()))
}

/// OKX的bar参数。6小时及以上的周期默认按香港时间对齐，这里统一使用UTC版本
pub fn okx_bar(interval: Interval) -> &'static str {
    match interval {
        Interval::M1 => "1m",
        Interval::M3 => "3m",
        Interval::M5 => "5m",
        Interval::M15 => "15m",
        Interval::M30 => "30m",
        Interval::H1 => "1H",
        Interval::H2 => "2H",
        Interval::H4 => "4H",
        Interval::H6 => "6Hutc",
        Interval::H12 => "12Hutc",
        Interval::D1 => "1Dutc",
        Interval::W1 => "1Wutc",
    }
}

/// 解析 [ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]
///
/// confirm 为 "0" 的K线尚未收盘，返回 None
pub(crate) fn parse_candle_row(row: &[Value], exchange: &str, symbol: &str, interval: Interval) -> Result<Option<Bar>> {
    if row.len() < 6 {
        return Err(AppError::TransientNetworkError(format!("OKX K线字段数量不足: {}", row.len())));
    }

    if row.get(8).and_then(|v| v.as_str()) == Some("0") {
        return Ok(None);
    }

    Ok(Some(Bar {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        interval,
        open_time: parse_timestamp(&row[0])?,
        open: parse_decimal(&row[1], "open")?,
        high: parse_decimal(&row[2], "high")?,
        low: parse_decimal(&row[3], "low")?,
        close: parse_decimal(&row[4], "close")?,
        volume: parse_decimal(&row[5], "volume")?,
    }))
}

/// 按HTTP状态码与OKX业务码分类
pub(crate) fn classify_okx_error(
    exchange: &str,
    symbol: &str,
    status: StatusCode,
    code: &str,
    msg: &str,
    retry_after: Option<Duration>,
) -> AppError {
    if status == StatusCode::TOO_MANY_REQUESTS || code == "50011" {
        return AppError::RateLimitExceeded {
            exchange: exchange.to_string(),
            retry_after,
            message: format!("{} {} {}", status, code, msg),
        };
    }
    if status == StatusCode::UNAUTHORIZED || matches!(code, "50111" | "50112" | "50113") {
        return AppError::AuthenticationError(format!("{}: {} {}", exchange, code, msg));
    }
    if code == "51001" {
        return AppError::SymbolNotFound(format!("{}: {} ({})", exchange, symbol, msg));
    }
    AppError::TransientNetworkError(format!("{}: {} {} {}", exchange, status, code, msg))
}
