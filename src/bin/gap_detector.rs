// K线数据空洞检测器 - 只读审计已存储的序列
use clap::Parser;
use kline_ingest::klcommon::logging_setup::init_logging;
use kline_ingest::klcommon::models::format_timestamp;
use kline_ingest::klcommon::{IngestConfig, SqliteStore, SystemClock};
use kline_ingest::kldata::gap_audit::write_csv_report;
use kline_ingest::kldata::GapAuditor;
use kline_ingest::Result;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "gap_detector", about = "检测已存储K线序列中的数据空洞")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 审计最近多少天，默认使用配置中的 historical_days
    #[arg(short, long)]
    days: Option<i64>,

    /// 把空洞明细写入CSV文件
    #[arg(long)]
    csv: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match IngestConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置失败: {}", e);
            return ExitCode::from(2);
        }
    };

    let _log_guard = match init_logging(&config.logging, "gap_detector") {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("初始化日志失败: {}", e);
            return ExitCode::from(2);
        }
    };

    match run(config, cli).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            eprintln!("空洞检测失败: {}", e);
            ExitCode::from(2)
        }
    }
}

/// 返回发现的空洞数量
async fn run(config: IngestConfig, cli: Cli) -> Result<usize> {
    let days = cli.days.unwrap_or(config.ingest.historical_days);
    let keys = config.series_keys()?;
    info!(target: "gap_detector", series_count = keys.len(), days, "🔍 开始检测数据空洞");

    let store = Arc::new(SqliteStore::open(&config.database)?);
    let auditor = GapAuditor::new(store, Arc::new(SystemClock));
    let reports = auditor.audit_all(&keys, days).await?;

    println!("{:<12} {:<12} {:<6} {:>8} {:>8} {:>6} {:>8}", "exchange", "symbol", "iv", "stored", "expected", "gaps", "missing");
    for report in &reports {
        println!(
            "{:<12} {:<12} {:<6} {:>8} {:>8} {:>6} {:>8}",
            report.key.exchange,
            report.key.symbol,
            report.key.interval.as_str(),
            report.stored_bars,
            report.expected_bars,
            report.gaps.len(),
            report.missing_bars()
        );
        for gap in &report.gaps {
            println!(
                "    {} -> {} ({} 根)",
                format_timestamp(gap.start),
                format_timestamp(gap.end),
                gap.missing_count()
            );
        }
    }

    let total: usize = reports.iter().map(|r| r.gaps.len()).sum();
    if let Some(path) = &cli.csv {
        let rows = write_csv_report(&reports, path)?;
        info!(target: "gap_detector", path = %path, rows, "📄 空洞报告已写入");
    }

    info!(target: "gap_detector", total_gaps = total, "✅ 空洞检测完成");
    Ok(total)
}
