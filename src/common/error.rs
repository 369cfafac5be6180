use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("URL parsing error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Command error: {0}")]
    CommandError(String),
}

impl AppError {
    /// 获取错误类型的简洁摘要，用于日志中的错误分类
    ///
    /// 返回一个稳定的错误类别字符串，便于按业务影响聚合
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // 快照获取相关
            AppError::ApiError(_) => "snapshot_request_failed",
            AppError::HttpError(_) => "backend_connection_failed",
            AppError::Unauthorized(_) => "session_unauthorized",

            // 数据解析相关
            AppError::JsonError(_) => "payload_parsing_failed",

            // 实时推送相关
            AppError::WebSocketError(_) => "live_stream_failed",
            AppError::UrlParseError(_) => "endpoint_invalid",

            // 系统资源相关
            AppError::IoError(_) => "console_io_failed",
            AppError::ChannelError(_) => "console_pipeline_failed",

            AppError::ConfigError(_) => "console_configuration_invalid",
            AppError::CommandError(_) => "control_command_failed",
        }
    }

    /// 检查错误是否为可重试类型
    ///
    /// 瞬时的获取失败和连接丢失由下一次轮询或重连自动恢复；
    /// 授权失败需要重新登录，不重试
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::HttpError(_) |
            AppError::ApiError(_) |
            AppError::WebSocketError(_) => true,

            AppError::IoError(_) |
            AppError::ChannelError(_) => true,

            AppError::CommandError(_) => true,

            AppError::Unauthorized(_) |
            AppError::JsonError(_) |
            AppError::ConfigError(_) |
            AppError::UrlParseError(_) => false,
        }
    }

    /// 需要重新认证的错误
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, AppError::Unauthorized(_))
    }

    /// 面向操作员的错误描述，写入轮询器的 `error` 字段
    pub fn operator_message(&self) -> String {
        match self {
            AppError::Unauthorized(_) => "会话已失效，请重新登录".to_string(),
            AppError::HttpError(e) if e.is_timeout() => "请求超时，将在下次刷新时重试".to_string(),
            AppError::HttpError(_) => "无法连接到后端，将在下次刷新时重试".to_string(),
            AppError::ApiError(msg) => format!("后端返回错误: {}", msg),
            AppError::JsonError(_) => "后端返回的数据格式无法解析".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
