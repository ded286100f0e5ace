// K线采集服务主程序 - 多交易所历史回补与增量更新
use clap::Parser;
use kline_ingest::klcommon::logging_setup::init_logging;
use kline_ingest::klcommon::{build_exchange_client, IngestConfig, SqliteStore, SystemClock};
use kline_ingest::kldata::{IngestionOrchestrator, RunReport};
use kline_ingest::Result;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "kline_ingest", about = "多交易所K线采集服务")]
struct Cli {
    /// 配置文件路径，未指定时依次尝试 CONFIG_PATH 与默认路径
    #[arg(short, long)]
    config: Option<String>,

    /// 只执行一轮回补/追赶后退出
    #[arg(long)]
    once: bool,

    /// 覆盖配置中的交易对（逗号分隔）
    #[arg(long)]
    symbols: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match IngestConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置失败: {}", e);
            return ExitCode::from(2);
        }
    };
    if let Some(symbols) = &cli.symbols {
        if let Err(e) = config.override_symbols(symbols) {
            eprintln!("交易对参数无效: {}", e);
            return ExitCode::from(2);
        }
    }

    // 持有 guard，直到 main 函数结束，确保文件被正确写入
    let _log_guard = match init_logging(&config.logging, "kline_ingest") {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("初始化日志失败: {}", e);
            return ExitCode::from(2);
        }
    };

    match run_app(config, cli.once).await {
        Ok(report) if report.has_degraded() => {
            for summary in report.degraded() {
                warn!(
                    target: "kline_ingest",
                    series = %summary.key,
                    state = %summary.state,
                    last_error = summary.last_error.as_deref().unwrap_or(""),
                    "序列处于降级状态"
                );
            }
            ExitCode::from(1)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(
                target: "kline_ingest",
                log_type = "module",
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "采集服务异常退出"
            );
            ExitCode::from(2)
        }
    }
}

/// 应用程序的核心业务逻辑
async fn run_app(config: IngestConfig, once: bool) -> Result<RunReport> {
    info!(
        target: "kline_ingest",
        log_type = "module",
        symbols = ?config.ingest.symbols,
        interval = %config.ingest.interval,
        historical_days = config.ingest.historical_days,
        exchanges = config.exchanges.len(),
        once,
        "🚀 K线采集服务启动"
    );

    let store = Arc::new(SqliteStore::open(&config.database)?);
    let clients = config
        .exchanges
        .iter()
        .map(build_exchange_client)
        .collect::<Result<Vec<_>>>()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "kline_ingest", "收到 Ctrl+C，正在停止...");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut orchestrator = IngestionOrchestrator::new(config, clients, store, Arc::new(SystemClock), shutdown_rx)?;
    let report = if once {
        orchestrator.run_once().await?
    } else {
        orchestrator.run().await?
    };

    info!(
        target: "kline_ingest",
        log_type = "module",
        bars_persisted = report.total_bars_persisted(),
        gap_count = report.total_gaps(),
        degraded = report.degraded().count(),
        interrupted = report.interrupted,
        "✅ K线采集服务结束"
    );
    Ok(report)
}
