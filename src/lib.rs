// 导出模块
pub mod command;
pub mod common;
pub mod sync;

// Re-export error types
pub use common::error::{AppError, Result};
