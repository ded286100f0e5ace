//! 抓取窗口规划与派发顺序
//!
//! 新序列回补 `[align(now - historical_days), align(now))`，已有序列从水位线的下一根K线
//! 增量到 `align(now)`。正在形成的K线不在区间内。所有区间按 `max_bars_per_task` 切块。

use crate::klcommon::models::{FetchTask, Interval, SeriesKey, TaskKind, TimeRange, Watermark};
use std::collections::{BTreeMap, VecDeque};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug)]
pub struct Scheduler {
    historical_days: i64,
    max_bars_per_task: usize,
    next_task_id: u64,
}

impl Scheduler {
    pub fn new(historical_days: i64, max_bars_per_task: usize) -> Self {
        Self {
            historical_days,
            max_bars_per_task: max_bars_per_task.max(1),
            next_task_id: 1,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    /// 新序列的回补区间
    pub fn backfill_range(&self, interval: Interval, now_ms: i64) -> TimeRange {
        let end = interval.align(now_ms);
        let start = interval.align(now_ms - self.historical_days * DAY_MS);
        TimeRange::new(start, end)
    }

    /// 已有序列的增量区间，没有新K线时返回 None
    pub fn incremental_range(&self, interval: Interval, watermark: &Watermark, now_ms: i64) -> Option<TimeRange> {
        let start = watermark.last_open_time + interval.duration_ms();
        let end = interval.align(now_ms);
        let range = TimeRange::new(start, end);
        (!range.is_empty()).then_some(range)
    }

    pub fn plan_backfill(&mut self, key: &SeriesKey, now_ms: i64) -> Vec<FetchTask> {
        let range = self.backfill_range(key.interval, now_ms);
        self.tasks_for(key, range, TaskKind::Backfill)
    }

    pub fn plan_incremental(&mut self, key: &SeriesKey, watermark: &Watermark, now_ms: i64) -> Vec<FetchTask> {
        match self.incremental_range(key.interval, watermark, now_ms) {
            Some(range) => self.tasks_for(key, range, TaskKind::Incremental),
            None => Vec::new(),
        }
    }

    fn tasks_for(&mut self, key: &SeriesKey, range: TimeRange, kind: TaskKind) -> Vec<FetchTask> {
        chunk_range(range, key.interval, self.max_bars_per_task)
            .into_iter()
            .map(|chunk| FetchTask {
                task_id: self.next_id(),
                key: key.clone(),
                range: chunk,
                kind,
                priority: chunk.start,
                attempt: 1,
            })
            .collect()
    }

    /// 为失败的任务生成重试任务：新的ID，尝试次数加一，区间起点裁剪到水位线之后
    pub fn retry(&mut self, task: &FetchTask, watermark: Option<&Watermark>) -> Option<FetchTask> {
        let step = task.key.interval.duration_ms();
        let start = match watermark {
            Some(w) => task.range.start.max(w.last_open_time + step),
            None => task.range.start,
        };
        let range = TimeRange::new(start, task.range.end);
        if range.is_empty() {
            return None;
        }
        Some(FetchTask {
            task_id: self.next_id(),
            key: task.key.clone(),
            range,
            kind: task.kind,
            priority: range.start,
            attempt: task.attempt + 1,
        })
    }
}

/// 把区间切成每块不超过 `max_bars` 根K线的连续子区间
pub fn chunk_range(range: TimeRange, interval: Interval, max_bars: usize) -> Vec<TimeRange> {
    let step = interval.duration_ms() * max_bars.max(1) as i64;
    let mut chunks = Vec::new();
    let mut start = range.start;
    while start < range.end {
        let end = (start + step).min(range.end);
        chunks.push(TimeRange::new(start, end));
        start = end;
    }
    chunks
}

/// 派发顺序：交易所之间轮询（按名称升序），同一交易所内水位线最旧的序列优先
pub fn order_for_dispatch(tasks: Vec<FetchTask>) -> Vec<FetchTask> {
    let mut by_exchange: BTreeMap<String, Vec<FetchTask>> = BTreeMap::new();
    for task in tasks {
        by_exchange.entry(task.key.exchange.clone()).or_default().push(task);
    }

    let mut queues: Vec<VecDeque<FetchTask>> = by_exchange
        .into_values()
        .map(|mut group| {
            group.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.key.cmp(&b.key)));
            VecDeque::from(group)
        })
        .collect();

    let mut ordered = Vec::with_capacity(queues.iter().map(|q| q.len()).sum());
    loop {
        let mut progressed = false;
        for queue in queues.iter_mut() {
            if let Some(task) = queue.pop_front() {
                ordered.push(task);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::models::WatermarkStatus;

    const HOUR: i64 = 3_600_000;
    const NOW: i64 = 1_700_000_123_456;

    fn key(exchange: &str, symbol: &str) -> SeriesKey {
        SeriesKey::new(exchange, symbol, Interval::H1)
    }

    fn watermark(last_open_time: i64) -> Watermark {
        Watermark {
            last_open_time,
            status: WatermarkStatus::Complete,
            updated_at: 0,
        }
    }

    #[test]
    fn test_backfill_covers_exactly_48_hours() {
        let mut scheduler = Scheduler::new(2, 1000);
        let tasks = scheduler.plan_backfill(&key("binance", "BTC/USDT"), NOW);
        assert_eq!(tasks.len(), 1);
        let range = tasks[0].range;
        assert_eq!(range.end, 1_699_999_200_000);
        assert_eq!(range.end - range.start, 48 * HOUR);
        assert_eq!(tasks[0].expected_bars(), 48);
        assert_eq!(tasks[0].kind, TaskKind::Backfill);
    }

    #[test]
    fn test_backfill_is_chunked() {
        let mut scheduler = Scheduler::new(2, 20);
        let tasks = scheduler.plan_backfill(&key("binance", "BTC/USDT"), NOW);
        let sizes: Vec<i64> = tasks.iter().map(|t| t.expected_bars()).collect();
        assert_eq!(sizes, vec![20, 20, 8]);
        for pair in tasks.windows(2) {
            assert_eq!(pair[0].range.end, pair[1].range.start);
            assert!(pair[0].task_id < pair[1].task_id);
        }
    }

    #[test]
    fn test_incremental_starts_after_watermark() {
        let mut scheduler = Scheduler::new(2, 1000);
        let end = Interval::H1.align(NOW);
        let tasks = scheduler.plan_incremental(&key("binance", "BTC/USDT"), &watermark(end - 4 * HOUR), NOW);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].range, TimeRange::new(end - 3 * HOUR, end));
        assert_eq!(tasks[0].kind, TaskKind::Incremental);

        // 已追上最新收盘K线
        assert!(scheduler
            .plan_incremental(&key("binance", "BTC/USDT"), &watermark(end - HOUR), NOW)
            .is_empty());
    }

    #[test]
    fn test_retry_trims_to_watermark() {
        let mut scheduler = Scheduler::new(2, 1000);
        let task = scheduler.plan_backfill(&key("binance", "BTC/USDT"), NOW).remove(0);
        let wm = watermark(task.range.start + 9 * HOUR);
        let retry = scheduler.retry(&task, Some(&wm)).unwrap();
        assert_ne!(retry.task_id, task.task_id);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.range.start, task.range.start + 10 * HOUR);
        assert_eq!(retry.range.end, task.range.end);

        let done = watermark(task.range.end - HOUR);
        assert!(scheduler.retry(&task, Some(&done)).is_none());
    }

    #[test]
    fn test_round_robin_across_exchanges() {
        let mut scheduler = Scheduler::new(2, 1000);
        let mut tasks = Vec::new();
        tasks.extend(scheduler.plan_incremental(&key("okx", "BTC/USDT"), &watermark(NOW - 30 * HOUR), NOW));
        tasks.extend(scheduler.plan_incremental(&key("binance", "ETH/USDT"), &watermark(NOW - 5 * HOUR), NOW));
        tasks.extend(scheduler.plan_incremental(&key("binance", "BTC/USDT"), &watermark(NOW - 20 * HOUR), NOW));
        tasks.extend(scheduler.plan_incremental(&key("okx", "ETH/USDT"), &watermark(NOW - 3 * HOUR), NOW));

        let order: Vec<String> = order_for_dispatch(tasks).iter().map(|t| t.key.to_string()).collect();
        assert_eq!(
            order,
            vec![
                "binance:BTC/USDT:1h",
                "okx:BTC/USDT:1h",
                "binance:ETH/USDT:1h",
                "okx:ETH/USDT:1h",
            ]
        );
    }
}
