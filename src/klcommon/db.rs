use crate::klcommon::config::DatabaseConfig;
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{Bar, GapRange, SeriesKey, TimeRange, Watermark, WatermarkStatus};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;
use tokio::task;
use tracing::{error, info, instrument};

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 持久化后端的窄接口
///
/// 所有写操作按 (exchange, symbol, interval, open_time) 幂等。
#[async_trait]
pub trait BarStore: Send + Sync {
    /// 在单个事务中写入K线，返回写入条数
    async fn upsert_bars(&self, bars: Vec<Bar>) -> Result<usize>;

    /// `[start, end)` 内的K线，按开盘时间升序
    async fn bars_in_range(&self, key: &SeriesKey, range: TimeRange) -> Result<Vec<Bar>>;

    /// 序列中最新一根K线的开盘时间
    async fn latest_open_time(&self, key: &SeriesKey) -> Result<Option<i64>>;

    async fn load_watermark(&self, key: &SeriesKey) -> Result<Option<Watermark>>;

    /// 保存水位线。已存储的水位线更新时不会后退，HasGaps 状态不会被覆盖
    async fn save_watermark(&self, key: &SeriesKey, watermark: Watermark) -> Result<()>;

    async fn record_gaps(&self, key: &SeriesKey, gaps: Vec<GapRange>, detected_at: i64) -> Result<()>;

    async fn load_gaps(&self, key: &SeriesKey) -> Result<Vec<GapRange>>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS bars (
        exchange TEXT NOT NULL,
        symbol TEXT NOT NULL,
        interval TEXT NOT NULL,
        open_time INTEGER NOT NULL,
        open TEXT NOT NULL,
        high TEXT NOT NULL,
        low TEXT NOT NULL,
        close TEXT NOT NULL,
        volume TEXT NOT NULL,
        close_time INTEGER NOT NULL,
        PRIMARY KEY (exchange, symbol, interval, open_time)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS watermarks (
        exchange TEXT NOT NULL,
        symbol TEXT NOT NULL,
        interval TEXT NOT NULL,
        last_open_time INTEGER NOT NULL,
        status TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (exchange, symbol, interval)
    );

    CREATE TABLE IF NOT EXISTS gaps (
        exchange TEXT NOT NULL,
        symbol TEXT NOT NULL,
        interval TEXT NOT NULL,
        gap_start INTEGER NOT NULL,
        gap_end INTEGER NOT NULL,
        detected_at INTEGER NOT NULL,
        PRIMARY KEY (exchange, symbol, interval, gap_start)
    );
";

/// SQLite 实现
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// 打开（必要时创建）数据库文件
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let db_path = Path::new(&config.database_path);
        tracing::debug!(decision = "db_init_start", db_path = %db_path.display(), "开始初始化数据库");

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let enable_wal = config.enable_wal;
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            if enable_wal {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            conn.execute_batch(
                "
                PRAGMA synchronous = NORMAL;
                PRAGMA cache_size = -102400;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = 5000;
                ",
            )
        });

        let pool = Pool::builder().max_size(config.pool_size).build(manager).map_err(|e| {
            let pool_error = AppError::StorageUnavailable(format!("创建连接池失败: {}", e));
            error!(
                target: "db",
                log_type = "module",
                db_path = %db_path.display(),
                error.summary = pool_error.get_error_type_summary(),
                error.details = %pool_error,
                "创建连接池失败"
            );
            pool_error
        })?;

        let store = Self { pool };
        store.init_schema()?;
        info!(
            target: "db",
            log_type = "module",
            db_path = %db_path.display(),
            wal = enable_wal,
            pool_size = config.pool_size,
            "✅ SQLite数据库初始化成功"
        );
        Ok(store)
    }

    /// 内存数据库，仅保留一个连接，供测试与临时运行使用
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)
            .map_err(|e| AppError::StorageUnavailable(format!("创建内存数据库失败: {}", e)))?;
        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::StorageUnavailable(format!("获取数据库连接失败: {}", e)))
    }

    /// 在阻塞线程池中执行数据库操作，保留调用方的 span 上下文
    async fn blocking<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let parent_span = tracing::Span::current();
        task::spawn_blocking(move || {
            parent_span.in_scope(|| {
                let mut conn = pool
                    .get()
                    .map_err(|e| AppError::StorageUnavailable(format!("获取数据库连接失败: {}", e)))?;
                f(&mut conn)
            })
        })
        .await
        .map_err(|e| AppError::StorageUnavailable(format!("数据库任务 {} 异常退出: {}", op, e)))?
    }
}

fn write_bars(conn: &mut Connection, bars: &[Bar]) -> Result<usize> {
    if bars.is_empty() {
        tracing::debug!(decision = "empty_bars", "K线数据为空，跳过写入");
        return Ok(0);
    }

    let started = Instant::now();
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO bars (exchange, symbol, interval, open_time, open, high, low, close, volume, close_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(exchange, symbol, interval, open_time) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                close_time = excluded.close_time",
        )?;
        for bar in bars {
            stmt.execute(params![
                bar.exchange,
                bar.symbol,
                bar.interval.as_str(),
                bar.open_time,
                bar.open.to_string(),
                bar.high.to_string(),
                bar.low.to_string(),
                bar.close.to_string(),
                bar.volume.to_string(),
                bar.close_time(),
            ])?;
        }
    }
    tx.commit()?;

    tracing::debug!(
        decision = "db_transaction_complete",
        bar_count = bars.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "数据库事务成功完成"
    );
    Ok(bars.len())
}

fn decimal_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[async_trait]
impl BarStore for SqliteStore {
    #[instrument(name = "db_upsert_bars", skip_all, fields(bar_count = bars.len()), err)]
    async fn upsert_bars(&self, bars: Vec<Bar>) -> Result<usize> {
        self.blocking("upsert_bars", move |conn| write_bars(conn, &bars)).await
    }

    async fn bars_in_range(&self, key: &SeriesKey, range: TimeRange) -> Result<Vec<Bar>> {
        let key = key.clone();
        self.blocking("bars_in_range", move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT open_time, open, high, low, close, volume FROM bars
                 WHERE exchange = ?1 AND symbol = ?2 AND interval = ?3 AND open_time >= ?4 AND open_time < ?5
                 ORDER BY open_time ASC",
            )?;
            let rows = stmt.query_map(
                params![key.exchange, key.symbol, key.interval.as_str(), range.start, range.end],
                |row| {
                    Ok(Bar {
                        exchange: key.exchange.clone(),
                        symbol: key.symbol.clone(),
                        interval: key.interval,
                        open_time: row.get(0)?,
                        open: decimal_column(row, 1)?,
                        high: decimal_column(row, 2)?,
                        low: decimal_column(row, 3)?,
                        close: decimal_column(row, 4)?,
                        volume: decimal_column(row, 5)?,
                    })
                },
            )?;
            let mut bars = Vec::new();
            for bar in rows {
                bars.push(bar?);
            }
            Ok(bars)
        })
        .await
    }

    async fn latest_open_time(&self, key: &SeriesKey) -> Result<Option<i64>> {
        let key = key.clone();
        self.blocking("latest_open_time", move |conn| {
            let latest: Option<i64> = conn.query_row(
                "SELECT MAX(open_time) FROM bars WHERE exchange = ?1 AND symbol = ?2 AND interval = ?3",
                params![key.exchange, key.symbol, key.interval.as_str()],
                |row| row.get(0),
            )?;
            Ok(latest)
        })
        .await
    }

    async fn load_watermark(&self, key: &SeriesKey) -> Result<Option<Watermark>> {
        let key = key.clone();
        self.blocking("load_watermark", move |conn| {
            let row = conn
                .query_row(
                    "SELECT last_open_time, status, updated_at FROM watermarks
                     WHERE exchange = ?1 AND symbol = ?2 AND interval = ?3",
                    params![key.exchange, key.symbol, key.interval.as_str()],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?)),
                )
                .optional()?;

            match row {
                None => Ok(None),
                Some((last_open_time, status, updated_at)) => {
                    let status = WatermarkStatus::parse(&status)
                        .ok_or_else(|| AppError::DataError(format!("{} 的水位线状态无效: {}", key, status)))?;
                    Ok(Some(Watermark {
                        last_open_time,
                        status,
                        updated_at,
                    }))
                }
            }
        })
        .await
    }

    async fn save_watermark(&self, key: &SeriesKey, watermark: Watermark) -> Result<()> {
        let key = key.clone();
        self.blocking("save_watermark", move |conn| {
            conn.execute(
                "INSERT INTO watermarks (exchange, symbol, interval, last_open_time, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(exchange, symbol, interval) DO UPDATE SET
                    last_open_time = MAX(watermarks.last_open_time, excluded.last_open_time),
                    status = CASE WHEN watermarks.status = 'has_gaps' THEN 'has_gaps' ELSE excluded.status END,
                    updated_at = excluded.updated_at",
                params![
                    key.exchange,
                    key.symbol,
                    key.interval.as_str(),
                    watermark.last_open_time,
                    watermark.status.as_str(),
                    watermark.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_gaps(&self, key: &SeriesKey, gaps: Vec<GapRange>, detected_at: i64) -> Result<()> {
        if gaps.is_empty() {
            return Ok(());
        }
        let key = key.clone();
        self.blocking("record_gaps", move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO gaps (exchange, symbol, interval, gap_start, gap_end, detected_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(exchange, symbol, interval, gap_start) DO UPDATE SET
                        gap_end = MAX(gaps.gap_end, excluded.gap_end),
                        detected_at = excluded.detected_at",
                )?;
                for gap in &gaps {
                    stmt.execute(params![
                        key.exchange,
                        key.symbol,
                        key.interval.as_str(),
                        gap.start,
                        gap.end,
                        detected_at,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_gaps(&self, key: &SeriesKey) -> Result<Vec<GapRange>> {
        let key = key.clone();
        self.blocking("load_gaps", move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT gap_start, gap_end FROM gaps
                 WHERE exchange = ?1 AND symbol = ?2 AND interval = ?3
                 ORDER BY gap_start ASC",
            )?;
            let rows = stmt.query_map(params![key.exchange, key.symbol, key.interval.as_str()], |row| {
                Ok(GapRange {
                    start: row.get(0)?,
                    end: row.get(1)?,
                    interval: key.interval,
                })
            })?;
            let mut gaps = Vec::new();
            for gap in rows {
                gaps.push(gap?);
            }
            Ok(gaps)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::models::Interval;

    const HOUR: i64 = 3_600_000;

    fn key() -> SeriesKey {
        SeriesKey::new("binance", "BTC/USDT", Interval::H1)
    }

    fn bar(open_time: i64, close: &str) -> Bar {
        Bar {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            interval: Interval::H1,
            open_time,
            open: "100".parse().unwrap(),
            high: "200".parse().unwrap(),
            low: "50".parse().unwrap(),
            close: close.parse().unwrap(),
            volume: "1.5".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let bars = vec![bar(0, "101"), bar(HOUR, "102"), bar(2 * HOUR, "103")];

        store.upsert_bars(bars.clone()).await.unwrap();
        let first = store.bars_in_range(&key(), TimeRange::new(0, 3 * HOUR)).await.unwrap();
        store.upsert_bars(bars.clone()).await.unwrap();
        let second = store.bars_in_range(&key(), TimeRange::new(0, 3 * HOUR)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second, bars);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_values() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_bars(vec![bar(0, "101")]).await.unwrap();
        store.upsert_bars(vec![bar(0, "150.25")]).await.unwrap();
        let stored = store.bars_in_range(&key(), TimeRange::new(0, HOUR)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].close.to_string(), "150.25");
        assert_eq!(store.latest_open_time(&key()).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_range_is_half_open() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_bars((0..5).map(|i| bar(i * HOUR, "101")).collect())
            .await
            .unwrap();
        let stored = store.bars_in_range(&key(), TimeRange::new(HOUR, 3 * HOUR)).await.unwrap();
        let times: Vec<i64> = stored.iter().map(|b| b.open_time).collect();
        assert_eq!(times, vec![HOUR, 2 * HOUR]);
    }

    #[tokio::test]
    async fn test_watermark_never_decreases() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.load_watermark(&key()).await.unwrap().is_none());

        let high = Watermark {
            last_open_time: 10 * HOUR,
            status: WatermarkStatus::HasGaps,
            updated_at: 1,
        };
        store.save_watermark(&key(), high).await.unwrap();

        let low = Watermark {
            last_open_time: 5 * HOUR,
            status: WatermarkStatus::Complete,
            updated_at: 2,
        };
        store.save_watermark(&key(), low).await.unwrap();

        let loaded = store.load_watermark(&key()).await.unwrap().unwrap();
        assert_eq!(loaded.last_open_time, 10 * HOUR);
        assert_eq!(loaded.status, WatermarkStatus::HasGaps);
        assert_eq!(loaded.updated_at, 2);
    }

    #[tokio::test]
    async fn test_gaps_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let gap = GapRange {
            start: 2 * HOUR,
            end: 3 * HOUR,
            interval: Interval::H1,
        };
        store.record_gaps(&key(), vec![gap], 100).await.unwrap();
        store.record_gaps(&key(), vec![gap], 200).await.unwrap();
        assert_eq!(store.load_gaps(&key()).await.unwrap(), vec![gap]);
    }

    #[tokio::test]
    async fn test_file_database_with_wal() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            database_path: dir.path().join("nested/klines.db").to_string_lossy().into_owned(),
            pool_size: 2,
            batch_size: 100,
            enable_wal: true,
        };
        let store = SqliteStore::open(&config).unwrap();
        store.upsert_bars(vec![bar(0, "101")]).await.unwrap();

        let reopened = SqliteStore::open(&config).unwrap();
        assert_eq!(reopened.latest_open_time(&key()).await.unwrap(), Some(0));
    }
}
