//! 采集编排器
//!
//! 单个协调循环：为每条序列规划抓取窗口，按限频与并发派发给worker池，
//! 串行写入结果并推进水位线，根据错误类型决定重试或降级。
//! 水位线与重试账本只由这里修改。

use crate::klcommon::api::ExchangeClient;
use crate::klcommon::clock::Clock;
use crate::klcommon::config::IngestConfig;
use crate::klcommon::db::BarStore;
use crate::klcommon::error::{AppError, ErrorKind, Result};
use crate::klcommon::models::{
    format_timestamp, Bar, FetchOutcome, FetchTask, GapRange, IngestionResult, SeriesKey, Watermark, WatermarkStatus,
};
use crate::kldata::rate_limiter::RateLimiter;
use crate::kldata::scheduler::{order_for_dispatch, Scheduler};
use crate::kldata::series::{SeriesState, SeriesSummary, SeriesTracker};
use crate::kldata::storage_writer::StorageWriter;
use crate::kldata::worker_pool::{wait_for_shutdown, FetchJob, WorkerPool, WorkerPoolConfig};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// 一次运行的结果
#[derive(Debug, Clone)]
pub struct RunReport {
    pub series: Vec<SeriesSummary>,
    /// 收到关闭信号提前结束
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn has_degraded(&self) -> bool {
        self.series.iter().any(|s| s.state.is_degraded())
    }

    pub fn degraded(&self) -> impl Iterator<Item = &SeriesSummary> {
        self.series.iter().filter(|s| s.state.is_degraded())
    }

    pub fn total_bars_persisted(&self) -> usize {
        self.series.iter().map(|s| s.bars_persisted).sum()
    }

    pub fn total_gaps(&self) -> usize {
        self.series.iter().map(|s| s.gap_count).sum()
    }

    pub fn get(&self, key: &SeriesKey) -> Option<&SeriesSummary> {
        self.series.iter().find(|s| &s.key == key)
    }
}

pub struct IngestionOrchestrator {
    config: IngestConfig,
    clients: HashMap<String, Arc<dyn ExchangeClient>>,
    limiter: Arc<RateLimiter>,
    scheduler: Scheduler,
    writer: StorageWriter,
    clock: Arc<dyn Clock>,
    series: BTreeMap<SeriesKey, SeriesTracker>,
    shutdown: watch::Receiver<bool>,
    initialized: bool,
}

impl IngestionOrchestrator {
    /// 每个配置的交易所都必须提供客户端
    pub fn new(
        config: IngestConfig,
        clients: Vec<Arc<dyn ExchangeClient>>,
        store: Arc<dyn BarStore>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        config.validate()?;

        let clients: HashMap<String, Arc<dyn ExchangeClient>> = clients
            .into_iter()
            .map(|client| (client.exchange_id().to_string(), client))
            .collect();

        for exchange in &config.exchanges {
            if !clients.contains_key(&exchange.name) {
                return Err(AppError::ConfigError(format!("交易所 {} 没有对应的客户端", exchange.name)));
            }
        }

        let limiter = Arc::new(RateLimiter::new());
        for exchange in &config.exchanges {
            if let Some(client) = clients.get(&exchange.name) {
                limiter.register(&exchange.name, client.rate_limit());
            }
        }

        let series = config
            .series_keys()?
            .into_iter()
            .map(|key| (key.clone(), SeriesTracker::new(key)))
            .collect();

        Ok(Self {
            scheduler: Scheduler::new(config.ingest.historical_days, config.ingest.max_bars_per_task),
            writer: StorageWriter::new(store, config.database.batch_size),
            config,
            clients,
            limiter,
            clock,
            series,
            shutdown,
            initialized: false,
        })
    }

    pub fn series_state(&self, key: &SeriesKey) -> Option<SeriesState> {
        self.series.get(key).map(|t| t.state)
    }

    pub fn watermark(&self, key: &SeriesKey) -> Option<Watermark> {
        self.series.get(key).and_then(|t| t.watermark)
    }

    /// 回补或追赶所有序列，全部空闲（或降级）后返回
    #[instrument(name = "ingest_cycle", skip(self), fields(series_count = self.series.len()))]
    pub async fn run_once(&mut self) -> Result<RunReport> {
        let started = std::time::Instant::now();
        if self.initialized {
            self.plan_cycle();
        } else {
            self.initialize().await?;
            self.initialized = true;
        }

        let interrupted = self.drive().await?;
        let report = RunReport {
            series: self.series.values().map(|t| t.summary()).collect(),
            interrupted,
            elapsed: started.elapsed(),
        };

        info!(
            target: "orchestrator",
            log_type = "module",
            series_count = report.series.len(),
            bars_persisted = report.total_bars_persisted(),
            gap_count = report.total_gaps(),
            degraded = report.degraded().count(),
            interrupted,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "✅ 采集周期完成"
        );
        Ok(report)
    }

    /// 持续运行：首次回补后，每隔 `update_interval_secs` 做一次增量更新，直到收到关闭信号。
    /// 可重试的降级序列按各自的退避时间提前唤醒
    pub async fn run(&mut self) -> Result<RunReport> {
        let mut shutdown = self.shutdown.clone();
        let mut report = self.run_once().await?;
        let mut next_cycle = Instant::now() + self.config.update_interval();

        loop {
            if report.interrupted || *shutdown.borrow() {
                return Ok(report);
            }

            let wake = self.next_rearm().map_or(next_cycle, |at| at.min(next_cycle));
            debug!(
                decision = "sleep_until_next_cycle",
                rearm_first = wake < next_cycle,
                wait_ms = wake.saturating_duration_since(Instant::now()).as_millis() as u64,
                "等待下一轮"
            );
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = wait_for_shutdown(&mut shutdown) => return Ok(report),
            }

            self.rearm_degraded();
            report = self.run_once().await?;
            if Instant::now() >= next_cycle {
                next_cycle = Instant::now() + self.config.update_interval();
            }
        }
    }

    /// 最早一个可重试降级序列的恢复时间
    fn next_rearm(&self) -> Option<Instant> {
        self.series
            .values()
            .filter(|t| t.state.is_degraded() && !t.permanent_failure)
            .filter_map(|t| t.retry_at)
            .min()
    }

    /// 读取水位线、可选地核对交易对，然后规划首个周期
    async fn initialize(&mut self) -> Result<()> {
        let store = self.writer.store().clone();
        for tracker in self.series.values_mut() {
            let mut watermark = store.load_watermark(&tracker.key).await?;
            if watermark.is_none() {
                if let Some(latest) = store.latest_open_time(&tracker.key).await? {
                    info!(
                        target: "orchestrator",
                        series = %tracker.key,
                        latest = %format_timestamp(latest),
                        "没有水位线记录，使用已存储的最新K线"
                    );
                    watermark = Some(Watermark {
                        last_open_time: latest,
                        status: WatermarkStatus::Complete,
                        updated_at: self.clock.now_ms(),
                    });
                }
            }
            tracker.watermark = watermark;
        }

        if self.config.ingest.verify_symbols {
            self.verify_symbols().await;
        }

        self.plan_cycle();
        Ok(())
    }

    /// 向交易所核对交易对。列表获取失败只告警
    async fn verify_symbols(&mut self) {
        for (exchange, client) in &self.clients {
            match client.fetch_symbols(self.limiter.as_ref()).await {
                Ok(listed) => {
                    let listed: HashSet<String> = listed.into_iter().map(|s| s.to_uppercase()).collect();
                    for tracker in self.series.values_mut().filter(|t| &t.key.exchange == exchange) {
                        if !listed.contains(&tracker.key.symbol.to_uppercase()) {
                            let err = AppError::SymbolNotFound(format!("{} 未上线 {}", exchange, tracker.key.symbol));
                            error!(
                                target: "orchestrator",
                                series = %tracker.key,
                                error.summary = err.get_error_type_summary(),
                                error.details = %err,
                                "交易对核对失败"
                            );
                            tracker.failures += 1;
                            tracker.last_error = Some(err.to_string());
                            tracker.permanent_failure = true;
                            tracker.degrade(ErrorKind::SymbolNotFound);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        target: "orchestrator",
                        exchange = %exchange,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "获取交易对列表失败，跳过核对"
                    );
                }
            }
        }
    }

    /// 为空闲且未降级的序列规划新任务
    fn plan_cycle(&mut self) {
        let now_ms = self.clock.now_ms();
        for tracker in self.series.values_mut() {
            if tracker.state.is_degraded() || !tracker.is_idle() {
                continue;
            }

            let tasks = match tracker.watermark {
                None => {
                    let tasks = self.scheduler.plan_backfill(&tracker.key, now_ms);
                    tracker.transition(SeriesState::Backfilling);
                    tasks
                }
                Some(watermark) => {
                    if tracker.state == SeriesState::Uninitialized {
                        tracker.transition(SeriesState::Steady);
                    }
                    self.scheduler.plan_incremental(&tracker.key, &watermark, now_ms)
                }
            };

            debug!(
                decision = "plan_tasks",
                series = %tracker.key,
                task_count = tasks.len(),
                expected_bars = tasks.iter().map(|t| t.expected_bars()).sum::<i64>(),
                "规划抓取任务"
            );
            tracker.pending.extend(tasks);
            tracker.finish_backfill_if_drained();
        }
    }

    /// 连续运行模式下，退避到期的可重试降级序列重新参与调度。
    /// 连续失败计数保留，再次失败时退避时间继续翻倍
    fn rearm_degraded(&mut self) {
        let now = Instant::now();
        for tracker in self.series.values_mut() {
            if !tracker.state.is_degraded() || tracker.permanent_failure {
                continue;
            }
            if tracker.retry_at.map_or(true, |at| at <= now) {
                info!(
                    target: "orchestrator",
                    series = %tracker.key,
                    consecutive_failures = tracker.consecutive_failures,
                    "降级序列重新参与调度"
                );
                tracker.retry_at = None;
                tracker.recover();
            }
        }
    }

    /// 驱动一个周期直到没有在途或等待重试的任务。返回是否被关闭信号中断
    async fn drive(&mut self) -> Result<bool> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Ok(true);
        }

        let pool_config = WorkerPoolConfig {
            workers: self.config.ingest.workers,
            per_exchange: self
                .config
                .exchanges
                .iter()
                .map(|e| (e.name.clone(), e.max_concurrency))
                .collect(),
            queue_capacity: self.series.len().max(1),
        };
        let mut pool = WorkerPool::start(pool_config, self.clients.clone(), self.limiter.clone(), shutdown.clone());

        let outcome = loop {
            if let Err(e) = self.dispatch_ready(&pool).await {
                break Err(e);
            }

            let in_flight = self.series.values().filter(|t| t.in_flight.is_some()).count();
            let next_retry = self.series.values().filter_map(|t| t.waiting_retry()).min();
            if in_flight == 0 && next_retry.is_none() {
                break Ok(false);
            }

            tokio::select! {
                result = pool.next_result() => match result {
                    Some(result) => self.handle_result(result).await,
                    None => break Err(AppError::ChannelError("worker池结果通道意外关闭".to_string())),
                },
                _ = sleep_until_opt(next_retry) => {}
                _ = wait_for_shutdown(&mut shutdown) => break Ok(true),
            }
        };

        pool.shutdown().await;

        if matches!(outcome, Ok(true)) {
            let abandoned = self.series.values_mut().filter_map(|t| t.in_flight.take()).count();
            warn!(
                target: "orchestrator",
                log_type = "module",
                abandoned,
                "收到关闭信号，放弃在途任务，水位线保持不变"
            );
        }
        outcome
    }

    async fn dispatch_ready(&mut self, pool: &WorkerPool) -> Result<()> {
        let now = Instant::now();
        let ready: Vec<FetchTask> = self
            .series
            .values()
            .filter(|t| t.ready_for_dispatch(now))
            .filter_map(|t| t.pending.front().cloned())
            .collect();

        for task in order_for_dispatch(ready) {
            let Some(tracker) = self.series.get_mut(&task.key) else {
                continue;
            };
            tracker.in_flight = Some(task.task_id);
            tracker.retry_at = None;
            let previous_open_time = tracker.watermark.map(|w| w.last_open_time);

            debug!(
                decision = "dispatch",
                task_id = task.task_id,
                series = %task.key,
                range = %task.range,
                attempt = task.attempt,
                "派发抓取任务"
            );
            pool.submit(FetchJob {
                task,
                previous_open_time,
            })
            .await?;
        }
        Ok(())
    }

    async fn handle_result(&mut self, result: IngestionResult) {
        let IngestionResult { task, outcome } = result;
        let Some(tracker) = self.series.get_mut(&task.key) else {
            warn!(target: "orchestrator", series = %task.key, "收到未知序列的结果");
            return;
        };
        if tracker.in_flight != Some(task.task_id) {
            debug!(decision = "discard_stale_result", task_id = task.task_id, series = %task.key, "丢弃过期结果");
            return;
        }
        tracker.in_flight = None;

        match outcome {
            FetchOutcome::Success { bars, .. } => self.persist(&task, bars, Vec::new()).await,
            FetchOutcome::Partial { bars, gaps, .. } => self.persist(&task, bars, gaps).await,
            FetchOutcome::Failure(e) => self.handle_failure(&task, e),
        }
    }

    async fn persist(&mut self, task: &FetchTask, bars: Vec<Bar>, gaps: Vec<GapRange>) {
        let key = &task.key;
        let had_gaps = !gaps.is_empty();

        match self.writer.upsert(key, bars).await {
            Ok(ack) => {
                if let Some(last) = ack.last_open_time {
                    if let Err(e) = self.advance_watermark(key, last, had_gaps).await {
                        self.handle_failure(task, e);
                        return;
                    }
                }

                if had_gaps {
                    self.record_gaps(key, &gaps).await;
                }

                let Some(tracker) = self.series.get_mut(key) else {
                    return;
                };
                tracker.bars_persisted += ack.written;
                tracker.consecutive_failures = 0;
                tracker.retry_at = None;
                tracker.pending.pop_front();
                tracker.recover();
                tracker.finish_backfill_if_drained();

                info!(
                    log_type = "transaction",
                    transaction_id = task.task_id,
                    event_name = "task_success",
                    series = %key,
                    written = ack.written,
                    gap_count = gaps.len(),
                    watermark = ?tracker.watermark.map(|w| w.last_open_time),
                );
            }
            Err(failure) => {
                if let Some(last) = failure.last_acknowledged {
                    // 已确认前缀内的空洞随水位线一起落地，其余的由重试任务重新检测
                    let acknowledged_gaps: Vec<GapRange> = gaps.iter().copied().filter(|g| g.end <= last).collect();
                    match self.advance_watermark(key, last, !acknowledged_gaps.is_empty()).await {
                        Ok(()) => {
                            if !acknowledged_gaps.is_empty() {
                                self.record_gaps(key, &acknowledged_gaps).await;
                            }
                            if let Some(tracker) = self.series.get_mut(key) {
                                tracker.bars_persisted += failure.acknowledged;
                            }
                        }
                        Err(e) => {
                            warn!(
                                target: "orchestrator",
                                series = %key,
                                error.summary = e.get_error_type_summary(),
                                error.details = %e,
                                "部分写入后保存水位线失败"
                            );
                        }
                    }
                }
                self.handle_failure(task, failure.error);
            }
        }
    }

    /// 只在存储确认后推进内存中的水位线
    async fn advance_watermark(&mut self, key: &SeriesKey, last_open_time: i64, had_gaps: bool) -> Result<()> {
        let now_ms = self.clock.now_ms();
        let store = self.writer.store().clone();
        let Some(tracker) = self.series.get_mut(key) else {
            return Ok(());
        };

        let next = Watermark::advanced(tracker.watermark, last_open_time, had_gaps, now_ms);
        store.save_watermark(key, next).await?;

        if tracker.watermark.map(|w| w.last_open_time) != Some(next.last_open_time) {
            debug!(
                decision = "watermark_advanced",
                series = %key,
                last_open_time = %format_timestamp(next.last_open_time),
                status = next.status.as_str(),
                "水位线已推进"
            );
        }
        tracker.watermark = Some(next);
        Ok(())
    }

    async fn record_gaps(&mut self, key: &SeriesKey, gaps: &[GapRange]) {
        for gap in gaps {
            warn!(
                log_type = "transaction",
                event_name = "gap_detected",
                series = %key,
                gap_start = %format_timestamp(gap.start),
                gap_end = %format_timestamp(gap.end),
                missing = gap.missing_count(),
            );
        }

        let now_ms = self.clock.now_ms();
        if let Err(e) = self.writer.store().record_gaps(key, gaps.to_vec(), now_ms).await {
            warn!(
                target: "orchestrator",
                series = %key,
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "保存空洞记录失败"
            );
        }
        if let Some(tracker) = self.series.get_mut(key) {
            tracker.gaps.extend_from_slice(gaps);
        }
    }

    /// 瞬时错误按指数退避重试，达到上限后降级；其他错误立即降级且本次运行不再重试
    fn handle_failure(&mut self, task: &FetchTask, error: AppError) {
        let kind = error.kind();
        let retry = self.config.retry.clone();
        let Some(tracker) = self.series.get_mut(&task.key) else {
            return;
        };

        tracker.failures += 1;
        tracker.last_error = Some(error.to_string());

        if !kind.is_retryable() {
            tracker.pending.clear();
            tracker.permanent_failure = true;
            tracker.retry_at = None;
            error!(
                log_type = "transaction",
                transaction_id = task.task_id,
                event_name = "task_failure",
                series = %task.key,
                retryable = false,
                error.kind = %kind,
                error.summary = error.get_error_type_summary(),
                error.details = %error,
            );
            tracker.degrade(kind);
            return;
        }

        tracker.consecutive_failures += 1;
        let backoff = retry.backoff(tracker.consecutive_failures);

        if kind == ErrorKind::RateLimitExceeded {
            self.limiter
                .penalize(&task.key.exchange, error.retry_after().unwrap_or(backoff));
        }

        if let Some(head) = tracker.pending.pop_front() {
            if let Some(next) = self.scheduler.retry(&head, tracker.watermark.as_ref()) {
                tracker.pending.push_front(next);
            }
        }

        if tracker.consecutive_failures >= retry.max_attempts {
            error!(
                log_type = "transaction",
                transaction_id = task.task_id,
                event_name = "task_failure",
                series = %task.key,
                retryable = true,
                attempts = tracker.consecutive_failures,
                error.kind = %kind,
                error.summary = error.get_error_type_summary(),
                error.details = %error,
            );
            tracker.retry_at = Some(Instant::now() + backoff);
            tracker.degrade(kind);
        } else {
            warn!(
                log_type = "transaction",
                transaction_id = task.task_id,
                event_name = "task_retry_scheduled",
                series = %task.key,
                attempt = tracker.consecutive_failures,
                backoff_ms = backoff.as_millis() as u64,
                error.kind = %kind,
                error.summary = error.get_error_type_summary(),
                error.details = %error,
            );
            tracker.retry_at = Some(Instant::now() + backoff);
            tracker.finish_backfill_if_drained();
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
