//! 已持久化数据的空洞审计
//!
//! 从存储读取历史窗口内的K线，重新做一次空洞检测。只读，不修复。

use crate::klcommon::clock::Clock;
use crate::klcommon::db::BarStore;
use crate::klcommon::error::Result;
use crate::klcommon::models::{format_timestamp, GapRange, SeriesKey, TimeRange};
use crate::kldata::validator::detect_gaps;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesGapReport {
    pub key: SeriesKey,
    pub range: TimeRange,
    pub stored_bars: usize,
    pub expected_bars: i64,
    pub first_open_time: Option<i64>,
    pub last_open_time: Option<i64>,
    pub gaps: Vec<GapRange>,
}

impl SeriesGapReport {
    pub fn missing_bars(&self) -> i64 {
        self.gaps.iter().map(|g| g.missing_count()).sum()
    }
}

/// CSV 中的一行
#[derive(Debug, Serialize)]
struct GapRecord<'a> {
    exchange: &'a str,
    symbol: &'a str,
    interval: &'a str,
    gap_start: i64,
    gap_end: i64,
    gap_start_utc: String,
    gap_end_utc: String,
    missing_periods: i64,
}

pub struct GapAuditor {
    store: Arc<dyn BarStore>,
    clock: Arc<dyn Clock>,
}

impl GapAuditor {
    pub fn new(store: Arc<dyn BarStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// 审计最近 `historical_days` 天（不含正在形成的K线）
    pub async fn audit_series(&self, key: &SeriesKey, historical_days: i64) -> Result<SeriesGapReport> {
        let now_ms = self.clock.now_ms();
        let range = TimeRange::new(
            key.interval.align(now_ms - historical_days * DAY_MS),
            key.interval.align(now_ms),
        );
        self.audit_range(key, range).await
    }

    pub async fn audit_range(&self, key: &SeriesKey, range: TimeRange) -> Result<SeriesGapReport> {
        let bars = self.store.bars_in_range(key, range).await?;
        let gaps = detect_gaps(&bars, key.interval, None);

        let report = SeriesGapReport {
            key: key.clone(),
            range,
            stored_bars: bars.len(),
            expected_bars: key.interval.bars_between(range.start, range.end),
            first_open_time: bars.first().map(|b| b.open_time),
            last_open_time: bars.last().map(|b| b.open_time),
            gaps,
        };

        info!(
            target: "gap_audit",
            series = %key,
            range = %range,
            stored = report.stored_bars,
            expected = report.expected_bars,
            gap_count = report.gaps.len(),
            missing = report.missing_bars(),
            "序列审计完成"
        );
        Ok(report)
    }

    pub async fn audit_all(&self, keys: &[SeriesKey], historical_days: i64) -> Result<Vec<SeriesGapReport>> {
        let mut reports = Vec::with_capacity(keys.len());
        for key in keys {
            reports.push(self.audit_series(key, historical_days).await?);
        }
        Ok(reports)
    }
}

/// 把所有空洞写成CSV，返回写入的行数
pub fn write_csv_report<P: AsRef<Path>>(reports: &[SeriesGapReport], path: P) -> Result<usize> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut rows = 0;
    for report in reports {
        for gap in &report.gaps {
            writer.serialize(GapRecord {
                exchange: &report.key.exchange,
                symbol: &report.key.symbol,
                interval: report.key.interval.as_str(),
                gap_start: gap.start,
                gap_end: gap.end,
                gap_start_utc: format_timestamp(gap.start),
                gap_end_utc: format_timestamp(gap.end),
                missing_periods: gap.missing_count(),
            })?;
            rows += 1;
        }
    }
    writer.flush()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::clock::ManualClock;
    use crate::klcommon::db::SqliteStore;
    use crate::klcommon::models::{Bar, Interval};
    use rust_decimal::Decimal;

    const HOUR: i64 = 3_600_000;
    const NOW: i64 = 1_699_999_200_000;

    fn bar(open_time: i64) -> Bar {
        Bar {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            interval: Interval::H1,
            open_time,
            open: Decimal::from(10),
            high: Decimal::from(11),
            low: Decimal::from(9),
            close: Decimal::from(10),
            volume: Decimal::from(5),
        }
    }

    #[tokio::test]
    async fn test_audit_reports_stored_gaps_and_csv() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let start = NOW - 24 * HOUR;
        let bars: Vec<Bar> = (0..24)
            .filter(|i| *i != 5 && *i != 6 && *i != 17)
            .map(|i| bar(start + i * HOUR))
            .collect();
        store.upsert_bars(bars).await.unwrap();

        let auditor = GapAuditor::new(store, Arc::new(ManualClock::new(NOW)));
        let key = SeriesKey::new("binance", "BTC/USDT", Interval::H1);
        let report = auditor.audit_series(&key, 1).await.unwrap();

        assert_eq!(report.expected_bars, 24);
        assert_eq!(report.stored_bars, 21);
        assert_eq!(report.gaps.len(), 2);
        assert_eq!(report.gaps[0].start, start + 5 * HOUR);
        assert_eq!(report.gaps[0].missing_count(), 2);
        assert_eq!(report.missing_bars(), 3);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaps.csv");
        let rows = write_csv_report(&[report], &path).unwrap();
        assert_eq!(rows, 2);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("exchange,symbol,interval,gap_start,gap_end"));
        assert_eq!(content.lines().count(), 3);
    }
}
