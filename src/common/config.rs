//! 操作台配置模块

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use crate::common::{AppError, Result};

/// 默认配置常量
pub mod constants {
    /// 默认REST端点
    pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/v1";

    /// 默认推送端点
    pub const DEFAULT_STREAM_URL: &str = "ws://localhost:8000/ws";

    /// 固定重连延迟（毫秒），没有指数退避，也没有最大次数
    pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

    /// 确认窗口（毫秒）
    pub const DEFAULT_CONFIRM_WINDOW_MS: u64 = 3000;

    /// 滚动缓冲区默认容量
    pub const DEFAULT_SIGNAL_BUFFER: usize = 50;
    pub const DEFAULT_TRADE_BUFFER: usize = 50;
    pub const DEFAULT_ALERT_BUFFER: usize = 20;

    /// 凭证环境变量
    pub const TOKEN_ENV_VAR: &str = "AURORA_TOKEN";
}

use constants::*;

/// 操作台配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// REST配置
    pub api: ApiConfig,

    /// 推送连接配置
    pub stream: StreamConfig,

    /// 轮询配置
    pub polling: PollingConfig,

    /// 滚动缓冲区配置
    pub buffers: BufferConfig,

    /// 确认门配置
    pub confirm: ConfirmConfig,

    /// 日志配置
    pub logging: LoggingConfig,
}

/// REST配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// 带版本号的REST根路径
    pub base_url: String,

    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,

    /// 建连超时（秒）
    pub connect_timeout_secs: u64,
}

/// 推送连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// WebSocket URL
    pub url: String,

    /// 重连间隔（毫秒）
    pub reconnect_delay_ms: u64,

    /// 应用层心跳间隔（秒），0 表示关闭
    pub keepalive_interval_secs: u64,

    /// 单次建连超时（秒）
    pub connect_timeout_secs: u64,
}

/// 轮询配置，0 表示只在身份变化时获取一次
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub dashboard_refresh_ms: u64,
    pub trades_refresh_ms: u64,
    pub signals_refresh_ms: u64,
    pub audit_refresh_ms: u64,
}

/// 滚动缓冲区容量
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub signals: usize,
    pub trades: usize,
    pub alerts: usize,
}

/// 确认门配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmConfig {
    /// 二次确认窗口（毫秒）
    pub window_ms: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,

    /// 是否启用控制台输出
    pub enable_console_output: bool,

    /// JSON日志文件目录，未设置时不写文件
    pub log_dir: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            keepalive_interval_secs: 30,
            connect_timeout_secs: 15,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            dashboard_refresh_ms: 10_000,
            trades_refresh_ms: 30_000,
            signals_refresh_ms: 30_000,
            audit_refresh_ms: 0,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            signals: DEFAULT_SIGNAL_BUFFER,
            trades: DEFAULT_TRADE_BUFFER,
            alerts: DEFAULT_ALERT_BUFFER,
        }
    }
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self { window_ms: DEFAULT_CONFIRM_WINDOW_MS }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_console_output: true,
            log_dir: None,
        }
    }
}

impl StreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ConfirmConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl ConsoleConfig {
    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 从TOML文本解析并校验
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        let api_url = Url::parse(&self.api.base_url)
            .map_err(|e| AppError::ConfigError(format!("无效的REST地址 {}: {}", self.api.base_url, e)))?;
        if !matches!(api_url.scheme(), "http" | "https") {
            return Err(AppError::ConfigError(format!("REST地址必须是http或https: {}", self.api.base_url)));
        }

        let stream_url = Url::parse(&self.stream.url)
            .map_err(|e| AppError::ConfigError(format!("无效的推送地址 {}: {}", self.stream.url, e)))?;
        if !matches!(stream_url.scheme(), "ws" | "wss") {
            return Err(AppError::ConfigError(format!("推送地址必须是ws或wss: {}", self.stream.url)));
        }

        if self.api.request_timeout_secs == 0 {
            return Err(AppError::ConfigError("请求超时必须大于0".to_string()));
        }

        if self.stream.reconnect_delay_ms == 0 {
            return Err(AppError::ConfigError("重连间隔必须大于0".to_string()));
        }

        if self.stream.connect_timeout_secs == 0 {
            return Err(AppError::ConfigError("建连超时必须大于0".to_string()));
        }

        if self.confirm.window_ms == 0 {
            return Err(AppError::ConfigError("确认窗口必须大于0".to_string()));
        }

        if self.buffers.signals == 0 || self.buffers.trades == 0 || self.buffers.alerts == 0 {
            return Err(AppError::ConfigError("滚动缓冲区容量必须大于0".to_string()));
        }

        Ok(())
    }
}

/// 解析凭证：命令行优先，其次环境变量；空字符串视为未设置
pub fn resolve_token(cli_token: Option<String>) -> Option<String> {
    cli_token
        .or_else(|| std::env::var(TOKEN_ENV_VAR).ok())
        .filter(|t| !t.trim().is_empty())
}
