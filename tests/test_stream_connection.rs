//! 推送连接测试
//!
//! 大部分用例使用脚本化的假连接器和暂停的时钟；最后一个用例用本地 axum
//! WebSocket 服务走一遍真实的 tokio-tungstenite 传输。

use aurora_console::common::{config::StreamConfig, SessionGate, SessionState};
use aurora_console::sync::stream::SocketMessage;
use aurora_console::sync::{
    ConnectionStatus, EventFilter, EventKind, StreamConnection, StreamConnector, StreamEvent, StreamSocket,
    TungsteniteConnector,
};
use aurora_console::{AppError, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use url::Url;

//=============================================================================
// 脚本化的假传输
//=============================================================================

#[derive(Debug, Clone)]
enum Step {
    Frame(SocketMessage),
    Error,
    End,
}

#[derive(Debug, Clone)]
enum Script {
    /// 建连直接失败
    Refuse,
    /// 建连一直不返回
    Stall,
    /// 建连成功，依次产生这些帧，之后挂起
    Session(Vec<Step>),
}

#[derive(Default)]
struct FakeState {
    scripts: Mutex<VecDeque<Script>>,
    connect_times: Mutex<Vec<Instant>>,
    urls: Mutex<Vec<String>>,
    sent: Mutex<Vec<String>>,
    open: AtomicUsize,
    max_open: AtomicUsize,
}

#[derive(Clone, Default)]
struct ScriptedConnector {
    state: Arc<FakeState>,
}

impl ScriptedConnector {
    fn new(scripts: Vec<Script>) -> Self {
        let connector = Self::default();
        *connector.state.scripts.lock().unwrap() = scripts.into();
        connector
    }

    fn connect_gaps(&self) -> Vec<Duration> {
        let times = self.state.connect_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn urls(&self) -> Vec<String> {
        self.state.urls.lock().unwrap().clone()
    }

    fn sent(&self) -> Vec<String> {
        self.state.sent.lock().unwrap().clone()
    }

    fn max_open(&self) -> usize {
        self.state.max_open.load(Ordering::SeqCst)
    }
}

struct FakeSocket {
    steps: VecDeque<Step>,
    state: Arc<FakeState>,
}

impl Drop for FakeSocket {
    fn drop(&mut self) {
        self.state.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StreamConnector for ScriptedConnector {
    type Socket = FakeSocket;

    fn connect(&self, url: &Url) -> impl Future<Output = Result<FakeSocket>> + Send {
        let state = self.state.clone();
        let url = url.to_string();
        async move {
            state.connect_times.lock().unwrap().push(Instant::now());
            state.urls.lock().unwrap().push(url);
            // 脚本用完之后的连接一直保持打开
            let script = state
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Session(Vec::new()));

            match script {
                Script::Refuse => Err(AppError::WebSocketError("connection refused".into())),
                Script::Stall => std::future::pending().await,
                Script::Session(steps) => {
                    let open = state.open.fetch_add(1, Ordering::SeqCst) + 1;
                    state.max_open.fetch_max(open, Ordering::SeqCst);
                    Ok(FakeSocket { steps: steps.into(), state })
                }
            }
        }
    }
}

impl StreamSocket for FakeSocket {
    fn recv(&mut self) -> impl Future<Output = Option<Result<SocketMessage>>> + Send {
        async move {
            match self.steps.pop_front() {
                Some(Step::Frame(frame)) => Some(Ok(frame)),
                Some(Step::Error) => Some(Err(AppError::WebSocketError("connection reset".into()))),
                Some(Step::End) => None,
                None => std::future::pending().await,
            }
        }
    }

    fn send_text(&mut self, text: String) -> impl Future<Output = Result<()>> + Send {
        self.state.sent.lock().unwrap().push(text);
        async { Ok(()) }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

fn stream_config() -> StreamConfig {
    StreamConfig {
        url: "ws://console.test/ws".into(),
        reconnect_delay_ms: 3000,
        keepalive_interval_secs: 0,
        connect_timeout_secs: 15,
    }
}

fn text(s: &str) -> Step {
    Step::Frame(SocketMessage::Text(s.to_string()))
}

//=============================================================================
// 重连
//=============================================================================

#[tokio::test(start_paused = true)]
async fn test_each_abnormal_closure_schedules_one_fixed_delay_reconnect() {
    let n = 3;
    let scripts = (0..n).map(|_| Script::Session(vec![Step::Error])).collect();
    let connector = ScriptedConnector::new(scripts);
    let conn = StreamConnection::open(connector.clone(), &stream_config(), SessionGate::new(None));

    sleep(Duration::from_millis(1_000)).await;
    assert_eq!(conn.status(), ConnectionStatus::Closed);

    sleep(Duration::from_millis(9_000)).await;
    let stats = conn.stats();
    assert_eq!(stats.reconnects_scheduled, n as u64);
    assert_eq!(stats.connect_attempts, n as u64 + 1);
    assert_eq!(conn.status(), ConnectionStatus::Open);
    assert!(conn.connected());

    // 固定间隔，没有退避
    assert_eq!(connector.connect_gaps(), vec![Duration::from_millis(3000); n]);
    // 任何时刻最多一条连接
    assert_eq!(connector.max_open(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refused_and_ended_connections_keep_retrying() {
    let connector = ScriptedConnector::new(vec![
        Script::Refuse,
        Script::Session(vec![Step::End]),
        Script::Refuse,
        Script::Refuse,
    ]);
    let conn = StreamConnection::open(connector.clone(), &stream_config(), SessionGate::new(None));

    sleep(Duration::from_millis(12_500)).await;
    assert_eq!(conn.stats().connect_attempts, 5);
    assert_eq!(conn.status(), ConnectionStatus::Open);
    assert_eq!(connector.max_open(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_counts_as_failed_attempt() {
    let connector = ScriptedConnector::new(vec![Script::Stall]);
    let config = StreamConfig { connect_timeout_secs: 1, ..stream_config() };
    let conn = StreamConnection::open(connector.clone(), &config, SessionGate::new(None));

    sleep(Duration::from_millis(500)).await;
    assert_eq!(conn.status(), ConnectionStatus::Connecting);

    sleep(Duration::from_millis(3_600)).await;
    assert_eq!(conn.stats().connect_attempts, 2);
    assert_eq!(conn.status(), ConnectionStatus::Open);
    assert_eq!(connector.connect_gaps(), vec![Duration::from_millis(4000)]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_reconnect() {
    let connector = ScriptedConnector::new(vec![Script::Session(vec![Step::Error])]);
    let mut conn = StreamConnection::open(connector.clone(), &stream_config(), SessionGate::new(None));
    let mut sub = conn.subscribe(EventFilter::All);

    sleep(Duration::from_millis(1_000)).await;
    conn.shutdown().await;

    sleep(Duration::from_secs(30)).await;
    assert_eq!(conn.stats().connect_attempts, 1);
    assert_eq!(conn.status(), ConnectionStatus::Closed);
    assert!(sub.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_open_socket() {
    let connector = ScriptedConnector::new(vec![]);
    let mut conn = StreamConnection::open(connector.clone(), &stream_config(), SessionGate::new(None));
    sleep(Duration::from_millis(10)).await;
    assert!(conn.connected());

    conn.shutdown().await;
    assert_eq!(conn.status(), ConnectionStatus::Closed);
    assert_eq!(connector.state.open.load(Ordering::SeqCst), 0);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(conn.stats().connect_attempts, 1);
}

//=============================================================================
// 消息处理
//=============================================================================

#[tokio::test(start_paused = true)]
async fn test_events_delivered_in_arrival_order_and_garbage_dropped() {
    let connector = ScriptedConnector::new(vec![Script::Session(vec![
        text(r#"{"type":"new_signal","payload":{"symbol":"AAPL","action":"BUY","confidence":0.8}}"#),
        text("this is not json"),
        text(r#"{"type":"market_open","payload":{}}"#),
        text("pong"),
        text(r#"{"type":"new_signal","payload":"broken"}"#),
        text(r#"{"type":"new_signal","payload":{"symbol":"MSFT","action":"SELL","confidence":0.7}}"#),
    ])]);
    let conn = StreamConnection::open(connector.clone(), &stream_config(), SessionGate::new(None));
    let mut sub = conn.subscribe(EventFilter::All);

    let first = sub.recv().await;
    let second = sub.recv().await;
    match (first, second) {
        (Some(StreamEvent::NewSignal(a)), Some(StreamEvent::NewSignal(b))) => {
            assert_eq!(a.symbol, "AAPL");
            assert_eq!(b.symbol, "MSFT");
        }
        other => panic!("unexpected events: {:?}", other),
    }

    let stats = conn.stats();
    assert_eq!(stats.messages_received, 6);
    assert_eq!(stats.malformed_dropped, 2);
    assert_eq!(stats.unknown_dropped, 1);
    // 坏消息不会断开连接
    assert_eq!(stats.connect_attempts, 1);
    assert!(conn.connected());
}

#[tokio::test(start_paused = true)]
async fn test_filtered_subscriptions_and_release() {
    let connector = ScriptedConnector::new(vec![Script::Session(vec![
        text(r#"{"type":"risk_alert","payload":{"severity":"WARNING","message":"exposure high"}}"#),
        text(r#"{"type":"circuit_breaker","payload":{"level":"RED","reason":"daily loss"}}"#),
    ])]);
    let conn = StreamConnection::open(connector, &stream_config(), SessionGate::new(None));
    let mut breakers = conn.subscribe(EventFilter::kinds(&[EventKind::CircuitBreaker]));
    let alerts = conn.subscribe(EventFilter::kinds(&[EventKind::RiskAlert]));
    assert_eq!(conn.subscriber_count(), 2);

    alerts.release();
    assert_eq!(conn.subscriber_count(), 1);

    match breakers.recv().await {
        Some(StreamEvent::CircuitBreaker(status)) => assert!(status.level.is_halting()),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(breakers.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_pings_while_open() {
    let connector = ScriptedConnector::new(vec![]);
    let config = StreamConfig { keepalive_interval_secs: 30, ..stream_config() };
    let _conn = StreamConnection::open(connector.clone(), &config, SessionGate::new(None));

    sleep(Duration::from_secs(61)).await;
    assert_eq!(connector.sent(), vec!["ping".to_string(), "ping".to_string()]);
}

//=============================================================================
// 凭证
//=============================================================================

#[tokio::test(start_paused = true)]
async fn test_token_rejection_requires_login_and_keeps_reconnecting() {
    let connector = ScriptedConnector::new(vec![Script::Session(vec![Step::Frame(SocketMessage::Close(Some(4001)))])]);
    let session = SessionGate::new(Some("secret".into()));
    let conn = StreamConnection::open(connector.clone(), &stream_config(), session.clone());

    sleep(Duration::from_millis(3_100)).await;
    assert_eq!(session.state(), SessionState::LoginRequired);
    assert_eq!(conn.stats().connect_attempts, 2);

    let urls = connector.urls();
    assert_eq!(urls[0], "ws://console.test/ws?token=secret");
    assert_eq!(urls[1], "ws://console.test/ws");
}

//=============================================================================
// 真实传输
//=============================================================================

mod real_socket {
    use super::*;
    use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
    use axum::extract::{Query, State};
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;

    type SeenTokens = Arc<Mutex<Vec<Option<String>>>>;

    async fn ws_handler(
        State(seen): State<SeenTokens>,
        Query(params): Query<HashMap<String, String>>,
        ws: WebSocketUpgrade,
    ) -> Response {
        seen.lock().unwrap().push(params.get("token").cloned());
        ws.on_upgrade(serve_socket)
    }

    /// 推一条组合更新，然后以凭证无效关闭
    async fn serve_socket(mut socket: WebSocket) {
        let event = r#"{"type":"portfolio_update","payload":{"daily_pnl":95.0,"open_positions_count":2}}"#;
        if socket.send(Message::Text(event.to_string())).await.is_err() {
            return;
        }
        let _ = socket
            .send(Message::Close(Some(CloseFrame { code: 4001, reason: "invalid token".into() })))
            .await;
    }

    #[tokio::test]
    async fn test_real_websocket_round_trip() {
        let seen: SeenTokens = Arc::default();
        let app = Router::new().route("/ws", get(ws_handler)).with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = StreamConfig {
            url: format!("ws://{}/ws", addr),
            reconnect_delay_ms: 200,
            keepalive_interval_secs: 0,
            connect_timeout_secs: 5,
        };
        let session = SessionGate::new(Some("secret".into()));
        let mut conn = StreamConnection::open(TungsteniteConnector, &config, session.clone());
        let mut sub = conn.subscribe(EventFilter::kinds(&[EventKind::PortfolioUpdate]));

        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap();
        match event {
            Some(StreamEvent::PortfolioUpdate(p)) => {
                assert_eq!(p.daily_pnl_display(), "+$95.00");
                assert_eq!(p.open_positions, 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // 被拒之后继续以匿名身份重连
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().len() < 2 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(session.state(), SessionState::LoginRequired);
        let tokens = seen.lock().unwrap().clone();
        assert_eq!(tokens[0].as_deref(), Some("secret"));
        assert_eq!(tokens[1], None);

        conn.shutdown().await;
        assert_eq!(conn.status(), ConnectionStatus::Closed);
    }
}
