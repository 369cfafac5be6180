//! 操作台数据模型
//!
//! REST快照与推送事件共用的结构体。所有结构都容忍未知字段，
//! 缺失的可选字段使用默认值，后端新增字段不会导致解析失败。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

//=============================================================================
// 组合与风控
//=============================================================================

/// 组合概览，来自 `/dashboard` 快照或 `portfolio_update` 推送
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioSummary {
    pub total_equity: f64,
    pub cash: f64,
    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,
    pub total_exposure_pct: f64,
    /// 快照里叫 `open_positions`，推送里叫 `open_positions_count`
    #[serde(alias = "open_positions_count")]
    pub open_positions: u32,
}

impl PortfolioSummary {
    /// 当日盈亏的展示文本，例如 `+$95.00`
    pub fn daily_pnl_display(&self) -> String {
        format_signed_usd(self.daily_pnl)
    }
}

/// 带符号的美元金额，`+$120.00` / `-$12.50`
pub fn format_signed_usd(value: f64) -> String {
    let cents = (value * 100.0).round();
    // -0.00 显示为 +$0.00
    let sign = if cents < 0.0 { '-' } else { '+' };
    format!("{}${:.2}", sign, cents.abs() / 100.0)
}

/// 熔断级别，由后端风控计算，这里只负责展示
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircuitBreakerLevel {
    #[default]
    None,
    Yellow,
    Orange,
    Red,
    #[serde(other)]
    Unknown,
}

impl CircuitBreakerLevel {
    /// 是否已停止开新仓
    pub fn is_halting(&self) -> bool {
        matches!(self, CircuitBreakerLevel::Orange | CircuitBreakerLevel::Red)
    }
}

impl fmt::Display for CircuitBreakerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitBreakerLevel::None => "NONE",
            CircuitBreakerLevel::Yellow => "YELLOW",
            CircuitBreakerLevel::Orange => "ORANGE",
            CircuitBreakerLevel::Red => "RED",
            CircuitBreakerLevel::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// `circuit_breaker` 推送的载荷
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerStatus {
    pub level: CircuitBreakerLevel,
    pub reason: Option<String>,
    pub action_taken: Option<String>,
    pub timestamp: Option<String>,
}

/// 风控告警
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskAlert {
    pub severity: String,
    pub message: String,
    pub symbol: Option<String>,
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

//=============================================================================
// 信号、成交、审计
//=============================================================================

/// 交易信号
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalRecord {
    pub id: Option<i64>,
    pub symbol: String,
    /// BUY / SELL / HOLD
    pub action: String,
    pub confidence: f64,
    pub claude_approved: Option<bool>,
    pub claude_adjusted_confidence: Option<f64>,
    pub claude_reasoning: Option<String>,
    pub claude_position_sizing: Option<String>,
    pub risk_approved: Option<bool>,
    pub status: Option<String>,
    pub model_version: Option<String>,
    pub timestamp: Option<String>,
}

/// 成交记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub symbol: String,
    pub side: String,
    pub shares: f64,
    pub entry_price: Option<f64>,
    pub fill_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub realized_pnl_pct: Option<f64>,
    pub ml_confidence: Option<f64>,
    pub claude_confidence: Option<f64>,
    pub claude_reasoning: Option<String>,
    pub status: Option<String>,
    pub exit_reason: Option<String>,
    pub placed_at: Option<String>,
    pub filled_at: Option<String>,
    pub closed_at: Option<String>,
}

/// 审计日志条目
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub timestamp: Option<String>,
    pub event_type: String,
    pub severity: String,
    pub component: Option<String>,
    pub symbol: Option<String>,
    pub details: Value,
    pub decision_chain_id: Option<String>,
}

//=============================================================================
// 快照
//=============================================================================

/// `/dashboard` 快照，每次成功轮询整体替换，从不局部修改
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardSnapshot {
    pub portfolio: PortfolioSummary,
    pub signals_today: u64,
    pub active_trades: u64,
    pub system_status: String,
    pub circuit_breaker: CircuitBreakerLevel,
    pub recent_signals: Vec<SignalRecord>,
    pub recent_trades: Vec<TradeRecord>,
    pub recent_alerts: Vec<RiskAlert>,
    /// 客户端收到时打的时间戳，不来自后端
    #[serde(skip)]
    pub fetched_at: Option<DateTime<Utc>>,
}

/// 控制命令的回执，例如紧急停止
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandReceipt {
    pub status: String,
    pub message: String,
    pub cancelled_orders: Option<u64>,
    pub closed_positions: Option<u64>,
    pub triggered_by: Option<String>,
}

//=============================================================================
// 查询过滤条件
//=============================================================================

/// 过滤条件转换为查询参数和轮询身份键
pub trait QueryFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)>;

    /// 任一值变化都会让轮询器重启
    fn identity_key(&self) -> Vec<String> {
        self.query_pairs()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

fn push_opt(pairs: &mut Vec<(&'static str, String)>, key: &'static str, value: &Option<String>) {
    if let Some(v) = value.as_ref().filter(|v| !v.is_empty()) {
        pairs.push((key, v.clone()));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradeFilter {
    pub symbol: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl QueryFilter for TradeFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        push_opt(&mut pairs, "symbol", &self.symbol.as_ref().map(|s| s.to_uppercase()));
        push_opt(&mut pairs, "status", &self.status);
        if let Some(limit) = self.limit { pairs.push(("limit", limit.to_string())); }
        if let Some(offset) = self.offset { pairs.push(("offset", offset.to_string())); }
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalFilter {
    pub symbol: Option<String>,
    pub status: Option<String>,
    pub action: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl QueryFilter for SignalFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        push_opt(&mut pairs, "symbol", &self.symbol.as_ref().map(|s| s.to_uppercase()));
        push_opt(&mut pairs, "status", &self.status);
        push_opt(&mut pairs, "action", &self.action.as_ref().map(|s| s.to_uppercase()));
        if let Some(limit) = self.limit { pairs.push(("limit", limit.to_string())); }
        if let Some(offset) = self.offset { pairs.push(("offset", offset.to_string())); }
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub event_type: Option<String>,
    pub severity: Option<String>,
    pub symbol: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl QueryFilter for AuditFilter {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        push_opt(&mut pairs, "event_type", &self.event_type);
        push_opt(&mut pairs, "severity", &self.severity);
        push_opt(&mut pairs, "symbol", &self.symbol.as_ref().map(|s| s.to_uppercase()));
        if let Some(limit) = self.limit { pairs.push(("limit", limit.to_string())); }
        if let Some(offset) = self.offset { pairs.push(("offset", offset.to_string())); }
        pairs
    }
}
