//! 单条序列的状态机与运行账本
//!
//! `Uninitialized → Backfilling → Steady`，任意阶段失败后进入 `Degraded`，
//! 恢复时回到降级前的阶段。

use crate::klcommon::error::ErrorKind;
use crate::klcommon::models::{FetchTask, GapRange, SeriesKey, Watermark};
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Backfilling,
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesState {
    Uninitialized,
    Backfilling,
    Steady,
    Degraded { reason: ErrorKind, resume: Phase },
}

impl SeriesState {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SeriesState::Degraded { .. })
    }

    /// 当前（或降级前）所处的阶段
    pub fn phase(&self) -> Phase {
        match self {
            SeriesState::Uninitialized | SeriesState::Backfilling => Phase::Backfilling,
            SeriesState::Steady => Phase::Steady,
            SeriesState::Degraded { resume, .. } => *resume,
        }
    }

    fn from_phase(phase: Phase) -> Self {
        match phase {
            Phase::Backfilling => SeriesState::Backfilling,
            Phase::Steady => SeriesState::Steady,
        }
    }
}

impl fmt::Display for SeriesState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesState::Uninitialized => f.write_str("Uninitialized"),
            SeriesState::Backfilling => f.write_str("Backfilling"),
            SeriesState::Steady => f.write_str("Steady"),
            SeriesState::Degraded { reason, .. } => write!(f, "Degraded({})", reason),
        }
    }
}

/// 运行结束时每条序列的摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesSummary {
    pub key: SeriesKey,
    pub state: SeriesState,
    pub watermark: Option<Watermark>,
    pub bars_persisted: usize,
    pub gap_count: usize,
    pub missing_bars: i64,
    pub failures: u32,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct SeriesTracker {
    pub key: SeriesKey,
    pub state: SeriesState,
    pub watermark: Option<Watermark>,
    /// 待执行的任务，按区间从旧到新排列，只有队首会被派发
    pub pending: VecDeque<FetchTask>,
    pub in_flight: Option<u64>,
    pub consecutive_failures: u32,
    pub retry_at: Option<Instant>,
    /// 不可重试的错误，本次运行内不再尝试
    pub permanent_failure: bool,
    pub bars_persisted: usize,
    pub gaps: Vec<GapRange>,
    pub failures: u32,
    pub last_error: Option<String>,
}

impl SeriesTracker {
    pub fn new(key: SeriesKey) -> Self {
        Self {
            key,
            state: SeriesState::Uninitialized,
            watermark: None,
            pending: VecDeque::new(),
            in_flight: None,
            consecutive_failures: 0,
            retry_at: None,
            permanent_failure: false,
            bars_persisted: 0,
            gaps: Vec::new(),
            failures: 0,
            last_error: None,
        }
    }

    pub fn transition(&mut self, next: SeriesState) {
        if self.state == next {
            return;
        }
        info!(
            log_type = "transaction",
            event_name = "state_transition",
            series = %self.key,
            from = %self.state,
            to = %next,
        );
        self.state = next;
    }

    pub fn degrade(&mut self, reason: ErrorKind) {
        let resume = self.state.phase();
        self.transition(SeriesState::Degraded { reason, resume });
    }

    /// 成功后从降级状态回到原阶段
    pub fn recover(&mut self) {
        if let SeriesState::Degraded { resume, .. } = self.state {
            self.transition(SeriesState::from_phase(resume));
        }
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    pub fn ready_for_dispatch(&self, now: Instant) -> bool {
        !self.state.is_degraded()
            && self.in_flight.is_none()
            && !self.pending.is_empty()
            && self.retry_at.map_or(true, |at| at <= now)
    }

    /// 有任务在等待退避结束
    pub fn waiting_retry(&self) -> Option<Instant> {
        if self.state.is_degraded() || self.in_flight.is_some() || self.pending.is_empty() {
            return None;
        }
        self.retry_at
    }

    /// 回补任务全部确认后进入 Steady
    pub fn finish_backfill_if_drained(&mut self) {
        if self.state == SeriesState::Backfilling && self.is_idle() {
            if self.watermark.is_none() {
                tracing::warn!(
                    target: "orchestrator",
                    series = %self.key,
                    "回补区间内交易所没有返回任何K线，已到达历史起点"
                );
            }
            self.transition(SeriesState::Steady);
        }
    }

    pub fn summary(&self) -> SeriesSummary {
        SeriesSummary {
            key: self.key.clone(),
            state: self.state,
            watermark: self.watermark,
            bars_persisted: self.bars_persisted,
            gap_count: self.gaps.len(),
            missing_bars: self.gaps.iter().map(|g| g.missing_count()).sum(),
            failures: self.failures,
            last_error: self.last_error.clone(),
        }
    }
}
