// 导出共享模块
pub mod api;
pub mod config;
pub mod error;
pub mod logging_setup;
pub mod models;

// 重新导出常用类型，方便使用
pub use api::{ApiClient, SessionGate, SessionState};
pub use config::ConsoleConfig;
pub use error::{AppError, Result};
pub use models::{
    CircuitBreakerLevel, CircuitBreakerStatus, CommandReceipt, DashboardSnapshot, PortfolioSummary,
    RiskAlert, SignalRecord, TradeRecord,
};
