//! 幂等写入校验后的K线
//!
//! 按 `batch_size` 分事务写入。某个子批次失败时返回已确认的连续前缀，
//! 调用方据此推进水位线，保证水位线不会越过未持久化的K线。

use crate::klcommon::db::BarStore;
use crate::klcommon::error::{AppError, ErrorKind, Result};
use crate::klcommon::models::{Bar, SeriesKey};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub key: SeriesKey,
    pub written: usize,
    /// 本次写入的最后一根K线，空写入时为 None
    pub last_open_time: Option<i64>,
}

#[derive(Debug)]
pub struct WriteFailure {
    pub key: SeriesKey,
    /// 失败前已提交的K线数量
    pub acknowledged: usize,
    pub last_acknowledged: Option<i64>,
    pub error: AppError,
}

impl std::fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} 写入失败（已确认 {} 根）: {}", self.key, self.acknowledged, self.error)
    }
}

#[derive(Clone)]
pub struct StorageWriter {
    store: Arc<dyn BarStore>,
    batch_size: usize,
}

impl StorageWriter {
    pub fn new(store: Arc<dyn BarStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn BarStore> {
        &self.store
    }

    /// 写入同一序列、严格升序的K线
    pub async fn upsert(&self, key: &SeriesKey, bars: Vec<Bar>) -> std::result::Result<WriteAck, WriteFailure> {
        if let Err(error) = check_batch(key, &bars) {
            error!(
                target: "db",
                log_type = "module",
                series = %key,
                bar_count = bars.len(),
                error.summary = error.get_error_type_summary(),
                error.details = %error,
                "❌ 拒绝写入批次，需要排查上游数据"
            );
            return Err(WriteFailure {
                key: key.clone(),
                acknowledged: 0,
                last_acknowledged: None,
                error,
            });
        }

        let mut acknowledged = 0;
        let mut last_acknowledged = None;

        for chunk in bars.chunks(self.batch_size) {
            match self.store.upsert_bars(chunk.to_vec()).await {
                Ok(written) => {
                    acknowledged += written;
                    last_acknowledged = chunk.last().map(|b| b.open_time);
                    debug!(target: "db", series = %key, written, acknowledged, "子批次写入完成");
                }
                Err(error) => {
                    if error.kind() == ErrorKind::ConstraintViolation {
                        error!(
                            target: "db",
                            log_type = "module",
                            series = %key,
                            acknowledged,
                            error.summary = error.get_error_type_summary(),
                            error.details = %error,
                            "❌ 写入违反存储约束，需要检查数据库状态"
                        );
                    }
                    return Err(WriteFailure {
                        key: key.clone(),
                        acknowledged,
                        last_acknowledged,
                        error,
                    });
                }
            }
        }

        Ok(WriteAck {
            key: key.clone(),
            written: acknowledged,
            last_open_time: last_acknowledged,
        })
    }
}

fn check_batch(key: &SeriesKey, bars: &[Bar]) -> Result<()> {
    if let Some(foreign) = bars.iter().find(|b| !b.belongs_to(key)) {
        return Err(AppError::ConstraintViolation(format!(
            "批次属于 {}，但包含 {} 的K线",
            key,
            foreign.series_key()
        )));
    }
    if let Some(pair) = bars.windows(2).find(|pair| pair[0].open_time >= pair[1].open_time) {
        return Err(AppError::ConstraintViolation(format!(
            "{} 的批次未严格升序: {} 之后是 {}",
            key, pair[0].open_time, pair[1].open_time
        )));
    }
    Ok(())
}
