//! 有界抓取worker池
//!
//! 任务经队列进入，结果经结果通道返回。并发同时受全局上限与每个交易所的上限约束，
//! worker之间只共享限频器。worker先拿到交易所额度并等到限频放行，之后才占用全局额度，
//! 被限频或已满的交易所不会挤占其他交易所。
//! 收到关闭信号后，等待中和执行中的worker直接放弃，不发送结果。

use crate::klcommon::api::ExchangeClient;
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{FetchOutcome, FetchTask, IngestionResult, RawBar};
use crate::kldata::rate_limiter::RateLimiter;
use crate::kldata::validator::BarValidator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// 提交给worker的任务，附带序列当前水位线用于空洞检测
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub task: FetchTask,
    pub previous_open_time: Option<i64>,
}

/// 等待关闭信号。发送端被丢弃时视为永不关闭
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// 全局并发上限
    pub workers: usize,
    /// 每个交易所的并发上限
    pub per_exchange: HashMap<String, usize>,
    /// 任务队列与结果通道的容量
    pub queue_capacity: usize,
}

pub struct WorkerPool {
    job_tx: mpsc::Sender<FetchJob>,
    result_rx: mpsc::Receiver<IngestionResult>,
    dispatcher: JoinHandle<()>,
}

#[derive(Clone)]
struct WorkerContext {
    clients: Arc<HashMap<String, Arc<dyn ExchangeClient>>>,
    limiter: Arc<RateLimiter>,
    global_slots: Arc<Semaphore>,
    exchange_slots: Arc<HashMap<String, Arc<Semaphore>>>,
    result_tx: mpsc::Sender<IngestionResult>,
}

impl WorkerPool {
    pub fn start(
        config: WorkerPoolConfig,
        clients: HashMap<String, Arc<dyn ExchangeClient>>,
        limiter: Arc<RateLimiter>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        let exchange_slots = clients
            .keys()
            .map(|name| {
                let limit = config.per_exchange.get(name).copied().unwrap_or(config.workers).max(1);
                (name.clone(), Arc::new(Semaphore::new(limit)))
            })
            .collect();

        let context = WorkerContext {
            clients: Arc::new(clients),
            limiter,
            global_slots: Arc::new(Semaphore::new(config.workers.max(1))),
            exchange_slots: Arc::new(exchange_slots),
            result_tx,
        };

        info!(
            target: "worker_pool",
            log_type = "module",
            workers = config.workers,
            exchanges = context.clients.len(),
            "🚀 抓取worker池已启动"
        );

        let dispatcher = tokio::spawn(dispatch_loop(job_rx, context, shutdown));

        Self {
            job_tx,
            result_rx,
            dispatcher,
        }
    }

    pub async fn submit(&self, job: FetchJob) -> Result<()> {
        self.job_tx
            .send(job)
            .await
            .map_err(|e| AppError::ChannelError(format!("提交抓取任务失败: task_id={}", e.0.task.task_id)))
    }

    /// 下一个结果。所有任务完成且队列关闭后返回 None
    pub async fn next_result(&mut self) -> Option<IngestionResult> {
        self.result_rx.recv().await
    }

    /// 关闭任务队列并等待派发循环退出，已派发的worker继续执行
    pub async fn shutdown(self) {
        drop(self.job_tx);
        drop(self.result_rx);
        if let Err(e) = self.dispatcher.await {
            warn!(target: "worker_pool", error = %e, "任务派发循环异常退出");
        }
        debug!(target: "worker_pool", "worker池已关闭");
    }
}

async fn dispatch_loop(mut job_rx: mpsc::Receiver<FetchJob>, context: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    loop {
        let job = tokio::select! {
            job = job_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = wait_for_shutdown(&mut shutdown) => break,
        };

        let span = tracing::info_span!(
            "fetch_task",
            task_id = job.task.task_id,
            series = %job.task.key,
            kind = job.task.kind.as_str(),
            attempt = job.task.attempt
        );
        tokio::spawn(run_worker(job, context.clone(), shutdown.clone()).instrument(span));
    }
    debug!(target: "worker_pool", "任务派发循环退出");
}

async fn run_worker(job: FetchJob, context: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    let task_id = job.task.task_id;
    let result_tx = context.result_tx.clone();
    tokio::select! {
        result = execute(job, context) => {
            if result_tx.send(result).await.is_err() {
                debug!(target: "worker_pool", task_id, "结果通道已关闭，丢弃结果");
            }
        }
        _ = wait_for_shutdown(&mut shutdown) => {
            debug!(target: "worker_pool", task_id, "收到关闭信号，放弃任务");
        }
    }
}

/// 依次等待交易所额度、限频放行、全局额度，然后调用适配器并校验
async fn execute(job: FetchJob, context: WorkerContext) -> IngestionResult {
    let FetchJob {
        task,
        previous_open_time,
    } = job;
    let exchange = task.key.exchange.clone();

    let (client, slots) = match (context.clients.get(&exchange), context.exchange_slots.get(&exchange)) {
        (Some(client), Some(slots)) => (client.clone(), slots.clone()),
        _ => {
            let err = AppError::ConfigError(format!("未配置交易所客户端: {}", exchange));
            return IngestionResult {
                task,
                outcome: FetchOutcome::Failure(err),
            };
        }
    };

    let _exchange_permit = match slots.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return IngestionResult {
                task,
                outcome: FetchOutcome::Failure(AppError::ChannelError("交易所并发额度已关闭".to_string())),
            }
        }
    };

    context.limiter.wait_ready(&exchange).await;

    let _global_permit = match context.global_slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return IngestionResult {
                task,
                outcome: FetchOutcome::Failure(AppError::ChannelError("全局并发额度已关闭".to_string())),
            }
        }
    };

    info!(
        log_type = "transaction",
        transaction_id = task.task_id,
        event_name = "fetch_dispatched",
        series = %task.key,
        range = %task.range,
        expected_bars = task.expected_bars(),
    );

    let started = Instant::now();
    let fetched = client
        .fetch_bars(
            context.limiter.as_ref(),
            &task.key.symbol,
            task.key.interval,
            task.range.start,
            task.range.end,
        )
        .await;

    let outcome = match fetched {
        Ok(bars) => {
            let raw = bars
                .into_iter()
                .enumerate()
                .map(|(seq, bar)| RawBar {
                    bar,
                    fetch_seq: seq as u64,
                })
                .collect();
            let report = BarValidator::new(task.key.clone())
                .with_previous(previous_open_time)
                .normalize(raw);

            info!(
                log_type = "transaction",
                transaction_id = task.task_id,
                event_name = "fetch_success",
                received = report.stats.received,
                accepted = report.bars.len(),
                duplicates = report.stats.duplicates,
                discarded = report.stats.discarded(),
                gap_count = report.gaps.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
            );

            if report.has_gaps() {
                FetchOutcome::Partial {
                    bars: report.bars,
                    gaps: report.gaps,
                    stats: report.stats,
                }
            } else {
                FetchOutcome::Success {
                    bars: report.bars,
                    stats: report.stats,
                }
            }
        }
        Err(e) => {
            warn!(
                log_type = "transaction",
                transaction_id = task.task_id,
                event_name = "fetch_failure",
                error.kind = %e.kind(),
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
            );
            FetchOutcome::Failure(e)
        }
    };

    IngestionResult { task, outcome }
}
