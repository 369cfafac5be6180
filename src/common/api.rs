//! REST客户端与会话边界
//!
//! 所有快照获取和控制命令都经过 [`ApiClient`]。401 响应会清除凭证并
//! 通过 [`SessionGate`] 广播 `LoginRequired`，与其他可重试错误区分开。

use crate::common::{
    config::ApiConfig,
    models::{
        AuditEntry, AuditFilter, CommandReceipt, DashboardSnapshot, QueryFilter, SignalFilter,
        SignalRecord, TradeFilter, TradeRecord,
    },
    AppError, Result,
};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, instrument, warn};

/// REST日志目标
pub const API_TARGET: &str = "api";

/// 错误响应体在日志和错误消息中保留的最大长度
const BODY_EXCERPT_LIMIT: usize = 300;

//=============================================================================
// 会话
//=============================================================================

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 持有凭证
    Authenticated,
    /// 未提供凭证（后端未启用认证时也能工作）
    Anonymous,
    /// 凭证被拒绝，需要回到登录边界
    LoginRequired,
}

/// 凭证持有者，REST客户端和推送连接共用一个实例
#[derive(Debug)]
pub struct SessionGate {
    token: RwLock<Option<String>>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionGate {
    pub fn new(token: Option<String>) -> Arc<Self> {
        let state = if token.is_some() { SessionState::Authenticated } else { SessionState::Anonymous };
        let (state_tx, _) = watch::channel(state);
        Arc::new(Self { token: RwLock::new(token), state_tx })
    }

    /// 当前凭证
    pub fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// 作废本地凭证并要求重新登录，不重试
    pub fn invalidate(&self, reason: &str) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
        }
        warn!(target: API_TARGET, log_type = "low_freq", reason, "🔒 会话已失效，需要重新登录");
        self.state_tx.send_replace(SessionState::LoginRequired);
    }

    /// 重新登录后替换凭证
    pub fn set_token(&self, token: String) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token);
        }
        self.state_tx.send_replace(SessionState::Authenticated);
    }
}

//=============================================================================
// REST客户端
//=============================================================================

/// AURORA REST客户端
#[derive(Clone, Debug)]
pub struct ApiClient {
    base_url: String,
    client: Client,
    session: Arc<SessionGate>,
}

impl ApiClient {
    /// 创建客户端，连接池在所有请求之间复用
    pub fn new(config: &ApiConfig, session: Arc<SessionGate>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| AppError::ApiError(format!("创建HTTP客户端失败: {}", e)))?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        debug!(target: API_TARGET, endpoint = %base_url, "API客户端初始化完成");
        Ok(Self { base_url, client, session })
    }

    pub fn session(&self) -> &Arc<SessionGate> {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// 发送请求并统一处理状态码
    async fn send(&self, method: Method, path: &str, query: &[(&'static str, String)]) -> Result<String> {
        let url = self.url(path);
        let mut request = self.client.request(method.clone(), &url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = self.session.token() {
            request = request.bearer_auth(token);
        }

        debug!(target: API_TARGET, %method, %url, "发送请求");

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let http_error = AppError::from(e);
                error!(
                    target: API_TARGET,
                    %url,
                    error.summary = http_error.get_error_type_summary(),
                    error.details = %http_error,
                    "HTTP请求失败"
                );
                return Err(http_error);
            }
        };

        // 401 不依赖响应体，先于读取处理
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.session.invalidate(&format!("{} {} 返回401", method, path));
            return Err(AppError::Unauthorized(format!("{} {}", method, path)));
        }

        let text = response.text().await?;

        if !status.is_success() {
            let excerpt = &text[..floor_char_boundary(&text, BODY_EXCERPT_LIMIT)];
            let api_error = AppError::ApiError(format!("{} - {}", status, excerpt));
            warn!(
                target: API_TARGET,
                %url,
                %status,
                error.summary = api_error.get_error_type_summary(),
                "API响应状态错误"
            );
            return Err(api_error);
        }

        Ok(text)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&'static str, String)]) -> Result<T> {
        let text = self.send(Method::GET, path, query).await?;
        serde_json::from_str::<T>(&text).map_err(|e| {
            error!(
                target: API_TARGET,
                path,
                response_preview = %&text[..floor_char_boundary(&text, BODY_EXCERPT_LIMIT)],
                "解析响应JSON失败: {}", e
            );
            AppError::JsonError(e)
        })
    }

    /// 获取仪表盘快照，并打上接收时间
    #[instrument(skip_all, err)]
    pub async fn dashboard(&self) -> Result<DashboardSnapshot> {
        let mut snapshot: DashboardSnapshot = self.get_json("/dashboard", &[]).await?;
        snapshot.fetched_at = Some(chrono::Utc::now());
        Ok(snapshot)
    }

    #[instrument(skip_all, err)]
    pub async fn trades(&self, filter: &TradeFilter) -> Result<Vec<TradeRecord>> {
        self.get_json("/trades", &filter.query_pairs()).await
    }

    #[instrument(skip_all, err)]
    pub async fn trade(&self, trade_id: i64) -> Result<TradeRecord> {
        self.get_json(&format!("/trades/{}", trade_id), &[]).await
    }

    #[instrument(skip_all, err)]
    pub async fn signals(&self, filter: &SignalFilter) -> Result<Vec<SignalRecord>> {
        self.get_json("/signals", &filter.query_pairs()).await
    }

    #[instrument(skip_all, err)]
    pub async fn audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.get_json("/audit", &filter.query_pairs()).await
    }

    /// 一条决策链上的全部审计记录
    #[instrument(skip_all, err)]
    pub async fn decision_chain(&self, chain_id: &str) -> Result<Value> {
        self.get_json(&format!("/audit/chain/{}", chain_id), &[]).await
    }

    #[instrument(skip_all, err)]
    pub async fn portfolio(&self) -> Result<Value> {
        self.get_json("/portfolio", &[]).await
    }

    #[instrument(skip_all, err)]
    pub async fn equity_curve(&self) -> Result<Value> {
        self.get_json("/portfolio/equity-curve", &[]).await
    }

    #[instrument(skip_all, err)]
    pub async fn settings(&self) -> Result<Value> {
        self.get_json("/settings", &[]).await
    }

    #[instrument(skip_all, err)]
    pub async fn analysis(&self, symbol: &str) -> Result<Value> {
        self.get_json(&format!("/analysis/{}", symbol.to_uppercase()), &[]).await
    }

    #[instrument(skip_all, err)]
    pub async fn watchlist_overview(&self) -> Result<Value> {
        self.get_json("/analysis", &[]).await
    }

    /// 健康检查，路径在版本前缀之外
    #[instrument(skip_all, err)]
    pub async fn health(&self) -> Result<Value> {
        let root = match url::Url::parse(&self.base_url) {
            Ok(mut url) => {
                url.set_path("/health");
                url.to_string()
            }
            Err(e) => return Err(AppError::UrlParseError(e)),
        };
        let text = self.client.get(&root).send().await?.error_for_status()?.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// 无请求体的POST控制命令
    #[instrument(skip(self), err)]
    pub async fn post_command(&self, path: &str) -> Result<CommandReceipt> {
        let text = self.send(Method::POST, path, &[]).await?;
        if text.trim().is_empty() {
            return Ok(CommandReceipt::default());
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// 不超过 `limit` 的最大字符边界
fn floor_char_boundary(s: &str, limit: usize) -> usize {
    if s.len() <= limit {
        return s.len();
    }
    let mut idx = limit;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_invalidate_clears_token() {
        let session = SessionGate::new(Some("abc".to_string()));
        let rx = session.watch();
        assert_eq!(session.state(), SessionState::Authenticated);

        session.invalidate("test");

        assert!(session.token().is_none());
        assert_eq!(*rx.borrow(), SessionState::LoginRequired);
    }

    #[test]
    fn test_anonymous_session() {
        let session = SessionGate::new(None);
        assert_eq!(session.state(), SessionState::Anonymous);
        session.set_token("t".into());
        assert_eq!(session.token().as_deref(), Some("t"));
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[test]
    fn test_url_join() {
        let config = ApiConfig { base_url: "http://h:1/api/v1/".into(), ..Default::default() };
        let api = ApiClient::new(&config, SessionGate::new(None)).unwrap();
        assert_eq!(api.url("/dashboard"), "http://h:1/api/v1/dashboard");
        assert_eq!(api.url("trades"), "http://h:1/api/v1/trades");
    }

    #[test]
    fn test_floor_char_boundary() {
        assert_eq!(floor_char_boundary("abc", 10), 3);
        let s = "错误错误";
        let idx = floor_char_boundary(s, 4);
        assert!(s.is_char_boundary(idx));
        assert_eq!(idx, 3);
    }
}
