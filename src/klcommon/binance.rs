//! 币安K线适配器（现货与U本位合约）

use crate::klcommon::api::{
    create_http_client, parse_decimal, parse_retry_after, parse_timestamp, preview, split_symbol, transport_error,
    ExchangeClient, RequestGate,
};
use crate::klcommon::config::{ExchangeConfig, ExchangeKind};
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{Bar, Interval, RateLimitSpec};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

#[derive(Debug, Deserialize)]
struct BinanceErrorBody {
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceSymbolInfo {
    symbol: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    base_asset: String,
    #[serde(default)]
    quote_asset: String,
    #[serde(default)]
    contract_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeInfo {
    #[serde(default)]
    symbols: Vec<BinanceSymbolInfo>,
}

/// 币安API客户端
#[derive(Clone, Debug)]
pub struct BinanceClient {
    config: ExchangeConfig,
    client: Client,
    api_key: Option<String>,
}

impl BinanceClient {
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        let client = create_http_client(&config)?;
        let api_key = config.api_key();
        Ok(Self { config, client, api_key })
    }

    fn klines_path(&self) -> &'static str {
        match self.config.kind {
            ExchangeKind::BinanceUsdm => "/fapi/v1/klines",
            _ => "/api/v3/klines",
        }
    }

    fn exchange_info_path(&self) -> &'static str {
        match self.config.kind {
            ExchangeKind::BinanceUsdm => "/fapi/v1/exchangeInfo",
            _ => "/api/v3/exchangeInfo",
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.api_key {
            Some(key) => request.header("X-MBX-APIKEY", key),
            None => request,
        }
    }

    /// 获取单页K线，`end_inclusive` 对应币安的 endTime 参数（闭区间）
    async fn fetch_page(
        &self,
        market_symbol: &str,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_inclusive: i64,
    ) -> Result<Vec<Bar>> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), self.klines_path());
        let query = [
            ("symbol", market_symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("startTime", start_ms.to_string()),
            ("endTime", end_inclusive.to_string()),
            ("limit", self.config.page_limit.to_string()),
        ];

        let response = self
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| transport_error(&self.config.name, &url, e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(&self.config.name, &url, e))?;

        if !status.is_success() {
            let err = classify_binance_error(&self.config.name, symbol, status, &text, retry_after);
            error!(
                target: "api",
                log_type = "module",
                exchange = %self.config.name,
                symbol = %symbol,
                status = %status,
                response_text = %preview(&text),
                error.summary = err.get_error_type_summary(),
                error.details = %err,
                "K线请求失败"
            );
            return Err(err);
        }

        let rows: Vec<Vec<Value>> = serde_json::from_str(&text).map_err(|e| {
            AppError::TransientNetworkError(format!("解析币安K线响应失败: {}, 响应: {}", e, preview(&text)))
        })?;

        debug!(target: "api", exchange = %self.config.name, symbol = %symbol, rows = rows.len(), "获取K线分页成功");

        rows.iter()
            .map(|row| parse_kline_row(row, &self.config.name, symbol, interval))
            .collect()
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
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
        let market_symbol = to_binance_symbol(symbol)?;
        let step = interval.duration_ms();
        let mut cursor = start_ms;
        let mut bars = Vec::new();

        while cursor < end_ms {
            gate.admit_request(&self.config.name).await;
            let page = self
                .fetch_page(&market_symbol, symbol, interval, cursor, end_ms - 1)
                .await?;
            let page_len = page.len();
            let last_open = match page.last() {
                Some(bar) => bar.open_time,
                // 区间内没有数据，已到达历史起点之后的空白或区间末尾
                None => break,
            };

            bars.extend(page.into_iter().filter(|b| b.open_time >= start_ms && b.open_time < end_ms));

            if last_open + step <= cursor {
                warn!(target: "api", exchange = %self.config.name, symbol = %symbol, cursor, last_open, "分页游标未前进，停止分页");
                break;
            }
            cursor = last_open + step;

            if page_len < self.config.page_limit {
                break;
            }
        }

        Ok(bars)
    }

    #[instrument(skip(self, gate), fields(exchange = %self.config.name), err)]
    async fn fetch_symbols(&self, gate: &dyn RequestGate) -> Result<Vec<String>> {
        gate.admit_request(&self.config.name).await;
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), self.exchange_info_path());
        let response = self
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(&self.config.name, &url, e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(&self.config.name, &url, e))?;

        if !status.is_success() {
            return Err(classify_binance_error(&self.config.name, "*", status, &text, retry_after));
        }

        let info: BinanceExchangeInfo = serde_json::from_str(&text)?;
        let is_usdm = self.config.kind == ExchangeKind::BinanceUsdm;

        // 现货只要求状态为TRADING；U本位合约额外要求为永续合约
        let symbols = info
            .symbols
            .into_iter()
            .filter(|s| s.status == "TRADING")
            .filter(|s| !is_usdm || s.contract_type.as_deref() == Some("PERPETUAL"))
            .filter(|s| !s.base_asset.is_empty() && !s.quote_asset.is_empty())
            .map(|s| {
                debug!(target: "api", raw_symbol = %s.symbol, "交易对");
                format!("{}/{}", s.base_asset, s.quote_asset)
            })
            .collect();

        Ok(symbols)
    }

    fn rate_limit(&self) -> RateLimitSpec {
        self.config.rate_limit()
    }
}

/// BTC/USDT -> BTCUSDT
pub fn to_binance_symbol(symbol: &str) -> Result<String> {
    let (base, quote) = split_symbol(symbol)?;
    Ok(format!("{}{}", base.to_uppercase(), quote.to_uppercase()))
}

/// 解析币安K线数组：[openTime, open, high, low, close, volume, closeTime, ...]
pub(crate) fn parse_kline_row(row: &[Value], exchange: &str, symbol: &str, interval: Interval) -> Result<Bar> {
    if row.len() < 6 {
        return Err(AppError::TransientNetworkError(format!(
            "币安K线字段数量不足: {}",
            row.len()
        )));
    }

    Ok(Bar {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        interval,
        open_time: parse_timestamp(&row[0])?,
        open: parse_decimal(&row[1], "open")?,
        high: parse_decimal(&row[2], "high")?,
        low: parse_decimal(&row[3], "low")?,
        close: parse_decimal(&row[4], "close")?,
        volume: parse_decimal(&row[5], "volume")?,
    })
}

/// 按HTTP状态码与币安错误码分类
///
/// - 429/418：请求过多或IP已被封禁
/// - 403：触发WAF限制，按限频处理
/// - 401、-2014、-2015：API Key 无效
/// - -1121：交易对不存在
pub(crate) fn classify_binance_error(
    exchange: &str,
    symbol: &str,
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> AppError {
    let parsed: Option<BinanceErrorBody> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().map(|b| b.code);
    let msg = parsed
        .as_ref()
        .map(|b| b.msg.clone())
        .unwrap_or_else(|| preview(body).to_string());

    match (status, code) {
        (StatusCode::TOO_MANY_REQUESTS, _) | (StatusCode::IM_A_TEAPOT, _) | (StatusCode::FORBIDDEN, _) => {
            AppError::RateLimitExceeded {
                exchange: exchange.to_string(),
                retry_after,
                message: format!("{} {}", status, msg),
            }
        }
        (StatusCode::UNAUTHORIZED, _) | (_, Some(-2014)) | (_, Some(-2015)) => {
            AppError::AuthenticationError(format!("{}: {} {}", exchange, status, msg))
        }
        (_, Some(-1121)) => AppError::SymbolNotFound(format!("{}: {} ({})", exchange, symbol, msg)),
        _ => AppError::TransientNetworkError(format!("{}: {} {}", exchange, status, msg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_symbol_conversion() {
        assert_eq!(to_binance_symbol("BTC/USDT").unwrap(), "BTCUSDT");
        assert_eq!(to_binance_symbol("eth/usdt").unwrap(), "ETHUSDT");
        assert!(to_binance_symbol("BTCUSDT").is_err());
    }

    #[test]
    fn test_parse_kline_row() {
        let row = json!([
            1699999200000i64,
            "35000.10",
            "35100.00",
            "34950.00",
            "35050.55",
            "123.456",
            1700002799999i64,
            "4321000.0",
            1000,
            "60.0",
            "2100000.0",
            "0"
        ]);
        let row = row.as_array().unwrap();
        let bar = parse_kline_row(row, "binance", "BTC/USDT", Interval::H1).unwrap();
        assert_eq!(bar.open_time, 1_699_999_200_000);
        assert_eq!(bar.close.to_string(), "35050.55");
        assert_eq!(bar.volume.to_string(), "123.456");
        assert_eq!(bar.symbol, "BTC/USDT");
        assert!(bar.check_ohlc().is_ok());
    }

    #[test]
    fn test_parse_short_row_fails() {
        let row = json!([1699999200000i64, "1", "2"]);
        assert!(parse_kline_row(row.as_array().unwrap(), "binance", "BTC/USDT", Interval::H1).is_err());
    }

    #[test]
    fn test_classify_errors() {
        let limited = classify_binance_error(
            "binance",
            "BTC/USDT",
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"code":-1003,"msg":"Too many requests"}"#,
            Some(Duration::from_secs(5)),
        );
        assert_eq!(limited.kind(), ErrorKind::RateLimitExceeded);
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(5)));

        let waf = classify_binance_error("binance", "BTC/USDT", StatusCode::FORBIDDEN, "", None);
        assert_eq!(waf.kind(), ErrorKind::RateLimitExceeded);

        let missing = classify_binance_error(
            "binance",
            "FOO/BAR",
            StatusCode::BAD_REQUEST,
            r#"{"code":-1121,"msg":"Invalid symbol."}"#,
            None,
        );
        assert_eq!(missing.kind(), ErrorKind::SymbolNotFound);

        let auth = classify_binance_error(
            "binance",
            "BTC/USDT",
            StatusCode::BAD_REQUEST,
            r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#,
            None,
        );
        assert_eq!(auth.kind(), ErrorKind::AuthenticationError);

        let server = classify_binance_error("binance", "BTC/USDT", StatusCode::BAD_GATEWAY, "<html>", None);
        assert_eq!(server.kind(), ErrorKind::TransientNetworkError);
    }
}
