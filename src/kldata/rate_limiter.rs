//! 按交易所划分的滑动窗口限频器
//!
//! 每个交易所维护最近一个窗口内已发出请求的时间点。多个worker共享同一个实例，
//! 内部只在计算时短暂持锁，等待发生在锁外。

use crate::klcommon::api::RequestGate;
use crate::klcommon::models::RateLimitSpec;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug)]
struct RateLimitWindow {
    spec: RateLimitSpec,
    sent: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl RateLimitWindow {
    fn new(spec: RateLimitSpec) -> Self {
        Self {
            spec,
            sent: VecDeque::with_capacity(spec.requests_per_window as usize),
            blocked_until: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.sent.front() {
            if *front + self.spec.window <= now {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        if matches!(self.blocked_until, Some(until) if until <= now) {
            self.blocked_until = None;
        }
    }

    fn next_slot(&mut self, now: Instant) -> Instant {
        self.prune(now);
        let by_window = if (self.sent.len() as u32) < self.spec.requests_per_window {
            now
        } else {
            // 窗口已满，最早的请求滑出窗口时才有额度
            self.sent.front().map(|front| *front + self.spec.window).unwrap_or(now)
        };
        match self.blocked_until {
            Some(until) => by_window.max(until),
            None => by_window,
        }
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_specs<'a>(specs: impl IntoIterator<Item = (&'a str, RateLimitSpec)>) -> Self {
        let limiter = Self::new();
        for (exchange, spec) in specs {
            limiter.register(exchange, spec);
        }
        limiter
    }

    /// 注册（或替换）交易所的限频配置
    pub fn register(&self, exchange: &str, spec: RateLimitSpec) {
        self.lock().insert(exchange.to_string(), RateLimitWindow::new(spec));
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateLimitWindow>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 最早可以发出下一次请求的时间点
    pub fn schedule_next(&self, exchange: &str) -> Instant {
        self.schedule_next_at(exchange, Instant::now())
    }

    pub fn schedule_next_at(&self, exchange: &str, now: Instant) -> Instant {
        match self.lock().get_mut(exchange) {
            Some(window) => window.next_slot(now),
            None => now,
        }
    }

    /// 有额度时消耗一个单位并返回 true。未注册的交易所不限频
    pub fn admit(&self, exchange: &str) -> bool {
        self.admit_at(exchange, Instant::now())
    }

    pub fn admit_at(&self, exchange: &str, now: Instant) -> bool {
        let mut windows = self.lock();
        let Some(window) = windows.get_mut(exchange) else {
            return true;
        };
        if window.next_slot(now) <= now {
            window.sent.push_back(now);
            true
        } else {
            false
        }
    }

    /// 等待直到获得额度，不阻塞其他任务
    pub async fn acquire(&self, exchange: &str) {
        loop {
            let now = Instant::now();
            if self.admit_at(exchange, now) {
                return;
            }
            let next = self.schedule_next_at(exchange, now).max(now + Duration::from_millis(1));
            debug!(
                target: "rate_limiter",
                exchange = %exchange,
                wait_ms = (next - now).as_millis() as u64,
                "限频额度已用完，等待"
            );
            tokio::time::sleep_until(next).await;
        }
    }

    /// 等到交易所有额度为止，但不消耗额度
    pub async fn wait_ready(&self, exchange: &str) {
        loop {
            let now = Instant::now();
            let next = self.schedule_next_at(exchange, now);
            if next <= now {
                return;
            }
            tokio::time::sleep_until(next).await;
        }
    }

    /// 交易所报告限频后，在 `duration` 内拒绝该交易所的所有请求
    pub fn penalize(&self, exchange: &str, duration: Duration) {
        self.penalize_at(exchange, duration, Instant::now());
    }

    pub fn penalize_at(&self, exchange: &str, duration: Duration, now: Instant) {
        if let Some(window) = self.lock().get_mut(exchange) {
            let until = now + duration;
            window.blocked_until = Some(window.blocked_until.map_or(until, |current| current.max(until)));
            warn!(
                target: "rate_limiter",
                log_type = "module",
                exchange = %exchange,
                penalty_ms = duration.as_millis() as u64,
                "交易所报告限频，暂停发送请求"
            );
        }
    }
}

#[async_trait]
impl RequestGate for RateLimiter {
    async fn admit_request(&self, exchange: &str) {
        self.acquire(exchange).await;
    }
}
