use crate::klcommon::error::{AppError, Result};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// 周K线的锚点：1970-01-05 00:00:00 UTC（周一）
const WEEK_ANCHOR_MS: i64 = 4 * DAY_MS;

/// K线周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    D1,
    W1,
}

impl Interval {
    pub const ALL: [Interval; 12] = [
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H12,
        Interval::D1,
        Interval::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::W1 => "1w",
        }
    }

    /// 周期长度（毫秒）
    pub fn duration_ms(&self) -> i64 {
        match self {
            Interval::M1 => MINUTE_MS,
            Interval::M3 => 3 * MINUTE_MS,
            Interval::M5 => 5 * MINUTE_MS,
            Interval::M15 => 15 * MINUTE_MS,
            Interval::M30 => 30 * MINUTE_MS,
            Interval::H1 => HOUR_MS,
            Interval::H2 => 2 * HOUR_MS,
            Interval::H4 => 4 * HOUR_MS,
            Interval::H6 => 6 * HOUR_MS,
            Interval::H12 => 12 * HOUR_MS,
            Interval::D1 => DAY_MS,
            Interval::W1 => 7 * DAY_MS,
        }
    }

    /// 对齐基准点。周K线从周一开始，其余周期以Unix纪元为基准
    pub fn anchor_ms(&self) -> i64 {
        match self {
            Interval::W1 => WEEK_ANCHOR_MS,
            _ => 0,
        }
    }

    /// 将时间戳向下对齐到周期边界
    pub fn align(&self, timestamp_ms: i64) -> i64 {
        let anchor = self.anchor_ms();
        let duration = self.duration_ms();
        anchor + (timestamp_ms - anchor).div_euclid(duration) * duration
    }

    pub fn is_aligned(&self, timestamp_ms: i64) -> bool {
        (timestamp_ms - self.anchor_ms()).rem_euclid(self.duration_ms()) == 0
    }

    /// `[start, end)` 内应有的K线数量
    pub fn bars_between(&self, start_ms: i64, end_ms: i64) -> i64 {
        if end_ms <= start_ms {
            return 0;
        }
        (end_ms - start_ms) / self.duration_ms()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s.trim())
            .ok_or_else(|| AppError::ConfigError(format!("不支持的K线周期: {}", s)))
    }
}

impl TryFrom<String> for Interval {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.as_str().to_string()
    }
}

/// 一条时间序列的标识：(交易所, 交易对, 周期)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub exchange: String,
    pub symbol: String,
    pub interval: Interval,
}

impl SeriesKey {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            interval,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.symbol, self.interval)
    }
}

/// OHLCV K线
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub exchange: String,
    pub symbol: String,
    pub interval: Interval,
    /// 开盘时间（UTC毫秒时间戳，已对齐到周期边界）
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.exchange.clone(), self.symbol.clone(), self.interval)
    }

    pub fn belongs_to(&self, key: &SeriesKey) -> bool {
        self.exchange == key.exchange && self.symbol == key.symbol && self.interval == key.interval
    }

    pub fn open_time_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.open_time).single()
    }

    /// 收盘时间，与币安 close_time 的约定一致（开盘时间 + 周期 - 1ms）
    pub fn close_time(&self) -> i64 {
        self.open_time + self.interval.duration_ms() - 1
    }

    /// 检查OHLC不变式，返回违规原因
    pub fn check_ohlc(&self) -> std::result::Result<(), String> {
        let zero = Decimal::ZERO;
        if self.open <= zero || self.high <= zero || self.low <= zero || self.close <= zero {
            return Err("价格必须为正数".to_string());
        }
        if self.high < self.low {
            return Err(format!("high {} < low {}", self.high, self.low));
        }
        if self.low > self.open.min(self.close) {
            return Err(format!("low {} 高于 open/close", self.low));
        }
        if self.high < self.open.max(self.close) {
            return Err(format!("high {} 低于 open/close", self.high));
        }
        if self.volume < zero {
            return Err(format!("成交量为负: {}", self.volume));
        }
        Ok(())
    }
}

/// 带抓取序号的原始K线，序号越大代表越晚从交易所获取
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBar {
    pub bar: Bar,
    pub fetch_seq: u64,
}

/// 水位线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatermarkStatus {
    Complete,
    HasGaps,
}

impl WatermarkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkStatus::Complete => "complete",
            WatermarkStatus::HasGaps => "has_gaps",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(WatermarkStatus::Complete),
            "has_gaps" => Some(WatermarkStatus::HasGaps),
            _ => None,
        }
    }
}

/// 每条序列最后一根成功持久化K线的时间戳
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub last_open_time: i64,
    pub status: WatermarkStatus,
    pub updated_at: i64,
}

impl Watermark {
    /// 推进水位线，只会向前移动；一旦出现过空洞状态就保持 HasGaps
    pub fn advanced(current: Option<Watermark>, last_open_time: i64, had_gaps: bool, now_ms: i64) -> Watermark {
        let gaps_before = current.map(|w| w.status == WatermarkStatus::HasGaps).unwrap_or(false);
        let status = if had_gaps || gaps_before {
            WatermarkStatus::HasGaps
        } else {
            WatermarkStatus::Complete
        };
        let last_open_time = current
            .map(|w| w.last_open_time.max(last_open_time))
            .unwrap_or(last_open_time);
        Watermark {
            last_open_time,
            status,
            updated_at: now_ms,
        }
    }
}

/// 半开时间区间 `[start, end)`，单位毫秒
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_timestamp(self.start), format_timestamp(self.end))
    }
}

/// 缺失K线的区间 `[start, end)`，start 为第一根缺失K线的开盘时间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRange {
    pub start: i64,
    pub end: i64,
    pub interval: Interval,
}

impl GapRange {
    pub fn missing_count(&self) -> i64 {
        self.interval.bars_between(self.start, self.end)
    }
}

impl fmt::Display for GapRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}) 缺失{}根",
            format_timestamp(self.start),
            format_timestamp(self.end),
            self.missing_count()
        )
    }
}

/// 任务类型，决定日志里的阶段标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Backfill,
    Incremental,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Backfill => "backfill",
            TaskKind::Incremental => "incremental",
        }
    }
}

/// 抓取任务。创建后不可变，重试时生成新的任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub task_id: u64,
    pub key: SeriesKey,
    pub range: TimeRange,
    pub kind: TaskKind,
    /// 调度优先级，数值越小越优先（取序列水位线，新序列取区间起点）
    pub priority: i64,
    /// 第几次尝试，从1开始
    pub attempt: u32,
}

impl FetchTask {
    pub fn expected_bars(&self) -> i64 {
        self.key.interval.bars_between(self.range.start, self.range.end)
    }
}

/// 校验阶段的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationStats {
    pub received: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub invalid: usize,
}

impl ValidationStats {
    pub fn discarded(&self) -> usize {
        self.malformed + self.invalid
    }
}

/// 单个抓取任务的结果
#[derive(Debug)]
pub enum FetchOutcome {
    Success {
        bars: Vec<Bar>,
        stats: ValidationStats,
    },
    Partial {
        bars: Vec<Bar>,
        gaps: Vec<GapRange>,
        stats: ValidationStats,
    },
    Failure(AppError),
}

#[derive(Debug)]
pub struct IngestionResult {
    pub task: FetchTask,
    pub outcome: FetchOutcome,
}

/// 交易所限频配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSpec {
    pub requests_per_window: u32,
    pub window: std::time::Duration,
}

/// 将毫秒时间戳转换为可读的日期时间格式
pub fn format_timestamp(timestamp_ms: i64) -> String {
    match Utc.timestamp_millis_opt(timestamp_ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => timestamp_ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: &str, high: &str, low: &str, close: &str, volume: &str) -> Bar {
        Bar {
            exchange: "binance".to_string(),
            symbol: "BTC/USDT".to_string(),
            interval: Interval::H1,
            open_time: 0,
            open: open.parse().unwrap(),
            high: high.parse().unwrap(),
            low: low.parse().unwrap(),
            close: close.parse().unwrap(),
            volume: volume.parse().unwrap(),
        }
    }

    #[test]
    fn test_interval_parse() {
        assert_eq!("1h".parse::<Interval>().unwrap(), Interval::H1);
        assert_eq!("1w".parse::<Interval>().unwrap(), Interval::W1);
        assert!("7m".parse::<Interval>().is_err());
        assert!("".parse::<Interval>().is_err());
    }

    #[test]
    fn test_align_hour() {
        let ts = 1_700_000_123_456;
        let aligned = Interval::H1.align(ts);
        assert_eq!(aligned, 1_699_999_200_000);
        assert!(Interval::H1.is_aligned(aligned));
        assert!(!Interval::H1.is_aligned(ts));
    }

    #[test]
    fn test_week_aligned_to_monday() {
        use chrono::Datelike;
        // 2023-11-15 是周三
        let ts = Utc.with_ymd_and_hms(2023, 11, 15, 13, 0, 0).unwrap().timestamp_millis();
        let aligned = Interval::W1.align(ts);
        let dt = Utc.timestamp_millis_opt(aligned).unwrap();
        assert_eq!(dt.weekday(), chrono::Weekday::Mon);
        assert_eq!(dt.day(), 13);
        assert!(Interval::W1.is_aligned(aligned));
    }

    #[test]
    fn test_bars_between() {
        let i = Interval::H1;
        assert_eq!(i.bars_between(0, 48 * 3_600_000), 48);
        assert_eq!(i.bars_between(10, 10), 0);
        assert_eq!(i.bars_between(10, 5), 0);
    }

    #[test]
    fn test_check_ohlc() {
        assert!(bar("100", "110", "95", "105", "10").check_ohlc().is_ok());
        assert!(bar("100", "100", "100", "100", "0").check_ohlc().is_ok());
        assert!(bar("100", "99", "95", "98", "1").check_ohlc().is_err());
        assert!(bar("100", "110", "101", "105", "1").check_ohlc().is_err());
        assert!(bar("100", "110", "95", "105", "-1").check_ohlc().is_err());
        assert!(bar("0", "110", "0", "105", "1").check_ohlc().is_err());
    }

    #[test]
    fn test_watermark_never_moves_back() {
        let first = Watermark::advanced(None, 1000, false, 1);
        let second = Watermark::advanced(Some(first), 500, false, 2);
        assert_eq!(second.last_open_time, 1000);
        assert_eq!(second.status, WatermarkStatus::Complete);

        let gapped = Watermark::advanced(Some(second), 2000, true, 3);
        let later = Watermark::advanced(Some(gapped), 3000, false, 4);
        assert_eq!(later.last_open_time, 3000);
        assert_eq!(later.status, WatermarkStatus::HasGaps);
    }

    #[test]
    fn test_series_key_display_and_order() {
        let a = SeriesKey::new("binance", "BTC/USDT", Interval::H1);
        let b = SeriesKey::new("okx", "ADA/USDT", Interval::H1);
        assert_eq!(a.to_string(), "binance:BTC/USDT:1h");
        assert!(a < b);
    }
}
