//! K线校验与规范化
//!
//! 处理顺序：剔除其他序列的K线 → 按开盘时间去重（保留抓取序号最大的）→ 剔除未对齐的K线
//! → 剔除违反OHLC约束的K线 → 检测空洞。空洞只报告，不填充。
//! 同样的输入总是得到同样的输出，对输出再次规范化结果不变。

use crate::klcommon::error::AppError;
use crate::klcommon::models::{Bar, GapRange, Interval, RawBar, SeriesKey, ValidationStats};
use std::collections::BTreeMap;
use tracing::warn;

/// 规范化结果，K线严格按开盘时间升序
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub bars: Vec<Bar>,
    pub gaps: Vec<GapRange>,
    pub stats: ValidationStats,
}

impl ValidationReport {
    pub fn has_gaps(&self) -> bool {
        !self.gaps.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BarValidator {
    key: SeriesKey,
    previous_open_time: Option<i64>,
}

impl BarValidator {
    pub fn new(key: SeriesKey) -> Self {
        Self {
            key,
            previous_open_time: None,
        }
    }

    /// 提供上一根已持久化K线的开盘时间，用于检测水位线与本批第一根K线之间的空洞
    pub fn with_previous(mut self, previous_open_time: Option<i64>) -> Self {
        self.previous_open_time = previous_open_time;
        self
    }

    pub fn normalize(&self, raw: Vec<RawBar>) -> ValidationReport {
        let mut stats = ValidationStats {
            received: raw.len(),
            ..ValidationStats::default()
        };

        let mut latest: BTreeMap<i64, RawBar> = BTreeMap::new();
        for item in raw {
            if !item.bar.belongs_to(&self.key) {
                stats.malformed += 1;
                let err = AppError::MalformedBarError(format!(
                    "{} 收到其他序列的K线 {}",
                    self.key,
                    item.bar.series_key()
                ));
                warn!(
                    target: "validator",
                    series = %self.key,
                    open_time = item.bar.open_time,
                    error.summary = err.get_error_type_summary(),
                    error.details = %err,
                    "丢弃K线"
                );
                continue;
            }

            match latest.get(&item.bar.open_time) {
                Some(existing) => {
                    stats.duplicates += 1;
                    if item.fetch_seq > existing.fetch_seq {
                        latest.insert(item.bar.open_time, item);
                    }
                }
                None => {
                    latest.insert(item.bar.open_time, item);
                }
            }
        }

        let interval = self.key.interval;
        let mut bars = Vec::with_capacity(latest.len());
        for (open_time, item) in latest {
            if !interval.is_aligned(open_time) {
                stats.malformed += 1;
                let err = AppError::MalformedBarError(format!("{} 开盘时间 {} 未对齐到 {}", self.key, open_time, interval));
                warn!(
                    target: "validator",
                    series = %self.key,
                    open_time,
                    error.summary = err.get_error_type_summary(),
                    error.details = %err,
                    "丢弃K线"
                );
                continue;
            }

            if let Err(reason) = item.bar.check_ohlc() {
                stats.invalid += 1;
                let err = AppError::InvalidBarError(format!("{} @ {}: {}", self.key, open_time, reason));
                warn!(
                    target: "validator",
                    series = %self.key,
                    open_time,
                    error.summary = err.get_error_type_summary(),
                    error.details = %err,
                    "丢弃K线"
                );
                continue;
            }

            bars.push(item.bar);
        }

        let gaps = detect_gaps(&bars, interval, self.previous_open_time);

        ValidationReport { bars, gaps, stats }
    }
}

/// 在升序K线中检测缺失区间。`previous_open_time` 之前（含）的K线不参与判断
pub fn detect_gaps(bars: &[Bar], interval: Interval, previous_open_time: Option<i64>) -> Vec<GapRange> {
    let step = interval.duration_ms();
    let mut gaps = Vec::new();
    let mut cursor = previous_open_time;

    for bar in bars {
        if let Some(prev) = cursor {
            if bar.open_time <= prev {
                continue;
            }
            let expected = prev + step;
            if bar.open_time > expected {
                gaps.push(GapRange {
                    start: expected,
                    end: bar.open_time,
                    interval,
                });
            }
        }
        cursor = Some(bar.open_time);
    }

    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    const HOUR: i64 = 3_600_000;
    const T: i64 = 1_699_999_200_000;

    fn key() -> SeriesKey {
        SeriesKey::new("binance", "BTC/USDT", Interval::H1)
    }

    fn raw(open_time: i64, close: i64, fetch_seq: u64) -> RawBar {
        RawBar {
            bar: Bar {
                exchange: "binance".into(),
                symbol: "BTC/USDT".into(),
                interval: Interval::H1,
                open_time,
                open: Decimal::from(100),
                high: Decimal::from(200),
                low: Decimal::from(50),
                close: Decimal::from(close),
                volume: Decimal::from(3),
            },
            fetch_seq,
        }
    }

    #[test]
    fn test_single_gap_detected() {
        let report = BarValidator::new(key()).normalize(vec![raw(T, 101, 0), raw(T + HOUR, 102, 1), raw(T + 3 * HOUR, 103, 2)]);
        assert_eq!(report.bars.len(), 3);
        assert_eq!(
            report.gaps,
            vec![GapRange {
                start: T + 2 * HOUR,
                end: T + 3 * HOUR,
                interval: Interval::H1
            }]
        );
        assert_eq!(report.gaps[0].missing_count(), 1);
    }

    #[test]
    fn test_dedup_keeps_latest_fetch() {
        let report = BarValidator::new(key()).normalize(vec![raw(T, 150, 7), raw(T, 120, 3), raw(T, 110, 5)]);
        assert_eq!(report.bars.len(), 1);
        assert_eq!(report.bars[0].close, Decimal::from(150));
        assert_eq!(report.stats.duplicates, 2);

        let report = BarValidator::new(key()).normalize(vec![raw(T, 120, 1), raw(T, 130, 2)]);
        assert_eq!(report.bars[0].close, Decimal::from(130));
    }

    #[test]
    fn test_discards_are_counted() {
        let mut bad_ohlc = raw(T + HOUR, 101, 1);
        bad_ohlc.bar.high = Decimal::from(60);
        let mut foreign = raw(T + 2 * HOUR, 101, 2);
        foreign.bar.exchange = "okx".into();
        let misaligned = raw(T + 3 * HOUR + 1, 101, 3);

        let report = BarValidator::new(key()).normalize(vec![raw(T, 101, 0), bad_ohlc, foreign, misaligned, raw(T + 4 * HOUR, 101, 4)]);
        assert_eq!(report.stats.received, 5);
        assert_eq!(report.stats.invalid, 1);
        assert_eq!(report.stats.malformed, 2);
        assert_eq!(report.bars.len(), 2);
        // 被丢弃的K线表现为空洞
        assert_eq!(report.gaps.len(), 1);
        assert_eq!(report.gaps[0].missing_count(), 3);
    }

    #[test]
    fn test_gap_after_previous_watermark() {
        let report = BarValidator::new(key())
            .with_previous(Some(T))
            .normalize(vec![raw(T + 3 * HOUR, 101, 0), raw(T + 4 * HOUR, 101, 1)]);
        assert_eq!(
            report.gaps,
            vec![GapRange {
                start: T + HOUR,
                end: T + 3 * HOUR,
                interval: Interval::H1
            }]
        );

        let contiguous = BarValidator::new(key())
            .with_previous(Some(T))
            .normalize(vec![raw(T, 101, 0), raw(T + HOUR, 101, 1)]);
        assert!(contiguous.gaps.is_empty());
    }

    #[test]
    fn test_unordered_input_is_sorted() {
        let report = BarValidator::new(key()).normalize(vec![raw(T + 2 * HOUR, 100, 0), raw(T, 100, 1), raw(T + HOUR, 100, 2)]);
        let times: Vec<i64> = report.bars.iter().map(|b| b.open_time).collect();
        assert_eq!(times, vec![T, T + HOUR, T + 2 * HOUR]);
        assert!(!report.has_gaps());
    }

    fn arb_raw() -> impl Strategy<Value = RawBar> {
        (0i64..40, prop::bool::weighted(0.1), 1i64..500, 1i64..500, 1i64..500, 1i64..500, -5i64..100, 0u64..1000).prop_map(
            |(slot, misaligned, o, h, l, c, v, seq)| {
                let mut item = raw(T + slot * HOUR + if misaligned { 1_000 } else { 0 }, c, seq);
                item.bar.open = Decimal::from(o);
                item.bar.high = Decimal::from(h);
                item.bar.low = Decimal::from(l);
                item.bar.volume = Decimal::from(v);
                item
            },
        )
    }

    proptest! {
        #[test]
        fn accepted_bars_satisfy_invariants(input in prop::collection::vec(arb_raw(), 0..80)) {
            let validator = BarValidator::new(key());
            let report = validator.normalize(input.clone());

            for bar in &report.bars {
                prop_assert!(bar.low <= bar.open.min(bar.close));
                prop_assert!(bar.high >= bar.open.max(bar.close));
                prop_assert!(bar.volume >= Decimal::ZERO);
                prop_assert!(Interval::H1.is_aligned(bar.open_time));
            }
            for pair in report.bars.windows(2) {
                prop_assert!(pair[0].open_time < pair[1].open_time);
            }
            prop_assert_eq!(
                report.stats.received,
                report.bars.len() + report.stats.duplicates + report.stats.discarded()
            );

            // 确定性与幂等性
            prop_assert_eq!(&validator.normalize(input), &report);
            let again: Vec<RawBar> = report
                .bars
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, bar)| RawBar { bar, fetch_seq: i as u64 })
                .collect();
            let second = validator.normalize(again);
            prop_assert_eq!(&second.bars, &report.bars);
            prop_assert_eq!(&second.gaps, &report.gaps);
        }
    }
}
