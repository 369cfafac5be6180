//! 集成测试共用的本地后端

use axum::body::{Body, Bytes};
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;

pub const GOOD_TOKEN: &str = "good-token";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v == format!("Bearer {}", GOOD_TOKEN))
}

async fn dashboard(headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "Invalid token"}))).into_response();
    }
    Json(json!({
        "portfolio": {
            "total_equity": 100250.5,
            "cash": 40000.0,
            "daily_pnl": 120.0,
            "daily_pnl_pct": 0.12,
            "total_exposure_pct": 60.0,
            "open_positions": 4
        },
        "signals_today": 7,
        "active_trades": 2,
        "system_status": "online",
        "circuit_breaker": "NONE",
        "recent_signals": [{"symbol": "AAPL", "action": "BUY", "confidence": 0.81}]
    }))
    .into_response()
}

async fn trades(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let symbol = params.get("symbol").cloned().unwrap_or_else(|| "ANY".to_string());
    Json(json!([{"id": 1, "symbol": symbol, "side": "BUY", "shares": 10.0, "status": "open"}]))
}

async fn signals() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

async fn emergency_stop(headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "status": "stopped",
        "message": "All orders cancelled and positions closed",
        "cancelled_orders": 3,
        "closed_positions": 2,
        "triggered_by": "api"
    }))
    .into_response()
}

async fn resume() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "broker unavailable")
}

/// 401 响应体发到一半断开
async fn portfolio_broken_body() -> impl IntoResponse {
    let chunks = futures_util::stream::iter(vec![
        Ok(Bytes::from_static(b"{\"detail\": ")),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "body aborted")),
    ]);
    (StatusCode::UNAUTHORIZED, Body::from_stream(chunks))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// 启动后端，返回带版本前缀的 REST 根路径
pub async fn spawn_backend() -> String {
    let app = Router::new()
        .route("/api/v1/dashboard", get(dashboard))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/signals", get(signals))
        .route("/api/v1/emergency-stop", post(emergency_stop))
        .route("/api/v1/resume", post(resume))
        .route("/api/v1/portfolio", get(portfolio_broken_body))
        .route("/health", get(health));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/api/v1", addr)
}
