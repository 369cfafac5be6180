//! 统一日志系统初始化模块
//!
//! 控制台输出层与可选的JSON文件层共用同一个过滤器，
//! 返回的 guard 决定文件日志何时被刷新，必须由 main 持有。

use crate::common::{config::LoggingConfig, AppError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 自定义Guard trait，避免dyn Drop警告
pub trait LogGuard: Send + Sync {}

/// 未启用文件日志时的占位符
pub struct DummyGuard;

impl LogGuard for DummyGuard {}

impl LogGuard for tracing_appender::non_blocking::WorkerGuard {}

/// 业务日志过滤器字符串，压低第三方库的噪音
pub fn business_filter(log_level: &str) -> String {
    format!("{},hyper=warn,reqwest=warn,tungstenite=warn,tokio_tungstenite=warn", log_level)
}

/// 初始化日志系统，只能调用一次
pub fn init_logging(config: &LoggingConfig) -> Result<Box<dyn LogGuard>> {
    let filter_str = business_filter(&config.log_level);

    let console_layer = config.enable_console_output.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true)
            .with_writer(std::io::stderr)
            .with_filter(EnvFilter::new(&filter_str))
    });

    let (file_layer, guard): (Option<_>, Box<dyn LogGuard>) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| AppError::ConfigError(format!("无法创建日志目录 {}: {}", dir, e)))?;
            let appender = tracing_appender::rolling::daily(dir, "aurora_console.log");
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new(&filter_str));
            (Some(layer), Box::new(worker_guard))
        }
        None => (None, Box::new(DummyGuard)),
    };

    // .with(None) 是无操作的
    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    tracing::info!(
        log_type = "low_freq",
        event_type = "logging_config_loaded",
        log_level = %config.log_level,
        console = config.enable_console_output,
        log_dir = ?config.log_dir,
        program_version = env!("CARGO_PKG_VERSION"),
        "📋 日志配置已加载并应用"
    );

    Ok(guard)
}
