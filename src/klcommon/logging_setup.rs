//! 日志系统初始化
//!
//! 控制台与按天滚动的日志文件共用同一个过滤器，`RUST_LOG` 优先于配置文件中的级别。
//! 返回的 guard 必须由 main 持有，否则文件日志会在缓冲区刷新前丢失。

use crate::klcommon::config::LoggingConfig;
use crate::klcommon::error::{AppError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 初始化日志系统，`app_name` 决定日志文件名
pub fn init_logging(config: &LoggingConfig, app_name: &str) -> Result<Option<WorkerGuard>> {
    let filter_str = format!("{},hyper=warn,reqwest=warn,rusqlite=warn,r2d2=warn", config.log_level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.enable_console_output {
        let console = fmt::layer().with_target(true).with_level(true);
        if config.json {
            layers.push(console.json().boxed());
        } else {
            layers.push(console.boxed());
        }
    }

    let guard = match config.log_dir.as_deref().filter(|d| !d.is_empty()) {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", app_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
            if config.json {
                layers.push(file.json().boxed());
            } else {
                layers.push(file.boxed());
            }
            Some(guard)
        }
        None => None,
    };

    Registry::default()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    tracing::info!(
        target: "app",
        log_type = "module",
        log_level = %config.log_level,
        log_dir = ?config.log_dir,
        json = config.json,
        "日志系统初始化完成"
    );

    Ok(guard)
}
