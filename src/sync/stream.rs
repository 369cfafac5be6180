// 文件: src/sync/stream.rs
// 推送连接模块 - 维护唯一一条到 /ws 的持久连接，断开后按固定间隔无限重连
use crate::common::{
    config::StreamConfig,
    models::{CircuitBreakerStatus, PortfolioSummary, RiskAlert, SignalRecord, TradeRecord},
    AppError, Result, SessionGate,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};
use url::Url;

//=============================================================================
// 常量
//=============================================================================

/// 推送连接日志目标
pub const STREAM_CONNECTION_TARGET: &str = "推送连接";

/// 服务端拒绝凭证时使用的关闭码
pub const CLOSE_CODE_INVALID_TOKEN: u16 = 4001;

/// 应用层心跳
const KEEPALIVE_PING: &str = "ping";
const KEEPALIVE_PONG: &str = "pong";

/// 主动关闭时等待对端确认的上限
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

//=============================================================================
// 状态与事件
//=============================================================================

/// 连接状态，整个会话只有一份
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
}

/// 推送事件类别，对应信封里的 `type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// 整体替换组合切片
    PortfolioUpdate,
    /// 插入信号缓冲区
    NewSignal,
    /// 插入成交缓冲区
    TradeExecuted,
    /// 插入告警缓冲区
    RiskAlert,
    /// 替换熔断级别
    CircuitBreaker,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::PortfolioUpdate,
        EventKind::NewSignal,
        EventKind::TradeExecuted,
        EventKind::RiskAlert,
        EventKind::CircuitBreaker,
    ];

    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "portfolio_update" => Some(EventKind::PortfolioUpdate),
            "new_signal" => Some(EventKind::NewSignal),
            "trade_executed" => Some(EventKind::TradeExecuted),
            "risk_alert" => Some(EventKind::RiskAlert),
            "circuit_breaker" => Some(EventKind::CircuitBreaker),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            EventKind::PortfolioUpdate => "portfolio_update",
            EventKind::NewSignal => "new_signal",
            EventKind::TradeExecuted => "trade_executed",
            EventKind::RiskAlert => "risk_alert",
            EventKind::CircuitBreaker => "circuit_breaker",
        }
    }
}

/// 解析后的推送事件
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    PortfolioUpdate(PortfolioSummary),
    NewSignal(SignalRecord),
    TradeExecuted(TradeRecord),
    RiskAlert(RiskAlert),
    CircuitBreaker(CircuitBreakerStatus),
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::PortfolioUpdate(_) => EventKind::PortfolioUpdate,
            StreamEvent::NewSignal(_) => EventKind::NewSignal,
            StreamEvent::TradeExecuted(_) => EventKind::TradeExecuted,
            StreamEvent::RiskAlert(_) => EventKind::RiskAlert,
            StreamEvent::CircuitBreaker(_) => EventKind::CircuitBreaker,
        }
    }
}

/// 线上信封 `{ type, payload }`
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// 单条消息的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Event(StreamEvent),
    /// 合法信封但类别未知，忽略
    Unknown(String),
    /// 无法解析，丢弃
    Malformed(String),
}

/// 解析一条文本消息；任何失败都不会影响连接
pub fn parse_envelope(text: &str) -> ParseOutcome {
    let envelope = match serde_json::from_str::<RawEnvelope>(text) {
        Ok(env) => env,
        Err(e) => return ParseOutcome::Malformed(e.to_string()),
    };

    let Some(kind) = EventKind::from_wire(&envelope.kind) else {
        return ParseOutcome::Unknown(envelope.kind);
    };

    let payload = envelope.payload;
    let parsed = match kind {
        EventKind::PortfolioUpdate => serde_json::from_value(payload).map(StreamEvent::PortfolioUpdate),
        EventKind::NewSignal => serde_json::from_value(payload).map(StreamEvent::NewSignal),
        EventKind::TradeExecuted => serde_json::from_value(payload).map(StreamEvent::TradeExecuted),
        EventKind::RiskAlert => serde_json::from_value(payload).map(StreamEvent::RiskAlert),
        EventKind::CircuitBreaker => serde_json::from_value(payload).map(StreamEvent::CircuitBreaker),
    };

    match parsed {
        Ok(event) => ParseOutcome::Event(event),
        Err(e) => ParseOutcome::Malformed(format!("{} 载荷无效: {}", kind.as_wire(), e)),
    }
}

//=============================================================================
// 发布/订阅
//=============================================================================

/// 订阅过滤
#[derive(Debug, Clone)]
pub enum EventFilter {
    All,
    Kinds(HashSet<EventKind>),
}

impl EventFilter {
    pub fn kinds(kinds: &[EventKind]) -> Self {
        EventFilter::Kinds(kinds.iter().copied().collect())
    }

    fn accepts(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

/// 事件总线：每个订阅者一条无界队列，按到达顺序投递，发布方从不阻塞
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 订阅；返回的句柄需要显式释放，drop 时也会释放
    pub fn subscribe(self: &Arc<Self>, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = match self.inner.lock() {
            Ok(mut inner) => {
                inner.next_id += 1;
                let id = inner.next_id;
                inner.subscribers.insert(id, Subscriber { filter, tx });
                id
            }
            // 锁中毒时返回一个立即结束的订阅
            Err(_) => 0,
        };
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(self),
            released: false,
        }
    }

    /// 投递给所有匹配的订阅者，返回投递数量
    pub fn publish(&self, event: StreamEvent) -> usize {
        let kind = event.kind();
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let mut delivered = 0;
        inner.subscribers.retain(|_, sub| {
            if !sub.filter.accepts(kind) {
                return true;
            }
            match sub.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // 接收端已经不在了
                Err(_) => false,
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.subscribers.len()).unwrap_or(0)
    }

    fn release(&self, id: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.remove(&id);
        }
    }

    /// 移除全部订阅者，它们的 `recv()` 会返回 `None`
    fn close_all(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.clear();
        }
    }
}

/// 订阅句柄
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    bus: Weak<EventBus>,
    released: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 等待下一条事件；连接拆除或句柄释放后返回 `None`
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }

    /// 显式释放
    pub fn release(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(bus) = self.bus.upgrade() {
            bus.release(self.id);
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

//=============================================================================
// 传输层接口
//=============================================================================

/// 传输层收到的一帧
#[derive(Debug, Clone, PartialEq)]
pub enum SocketMessage {
    Text(String),
    /// 对端关闭，附带关闭码
    Close(Option<u16>),
    /// 二进制等不关心的帧
    Other,
}

/// 一条已建立的双工连接
pub trait StreamSocket: Send + 'static {
    /// 读下一帧；`None` 表示流已结束
    fn recv(&mut self) -> impl Future<Output = Option<Result<SocketMessage>>> + Send;

    fn send_text(&mut self, text: String) -> impl Future<Output = Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// 建立连接的工厂
pub trait StreamConnector: Send + Sync + 'static {
    type Socket: StreamSocket;

    fn connect(&self, url: &Url) -> impl Future<Output = Result<Self::Socket>> + Send;
}

/// 基于 tokio-tungstenite 的生产实现
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

pub struct TungsteniteSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl StreamConnector for TungsteniteConnector {
    type Socket = TungsteniteSocket;

    fn connect(&self, url: &Url) -> impl Future<Output = Result<Self::Socket>> + Send {
        let url = url.to_string();
        async move {
            let (ws, response) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| AppError::WebSocketError(format!("WebSocket握手失败: {}", e)))?;
            debug!(target: STREAM_CONNECTION_TARGET, status = %response.status(), "WebSocket握手成功");
            Ok(TungsteniteSocket { inner: ws })
        }
    }
}

impl StreamSocket for TungsteniteSocket {
    fn recv(&mut self) -> impl Future<Output = Option<Result<SocketMessage>>> + Send {
        async move {
            loop {
                let msg = match self.inner.next().await? {
                    Ok(msg) => msg,
                    Err(e) => return Some(Err(AppError::WebSocketError(e.to_string()))),
                };
                match msg {
                    Message::Text(text) => return Some(Ok(SocketMessage::Text(text))),
                    Message::Close(frame) => {
                        return Some(Ok(SocketMessage::Close(frame.map(|f| u16::from(f.code)))));
                    }
                    Message::Ping(data) => {
                        if let Err(e) = self.inner.send(Message::Pong(data)).await {
                            return Some(Err(AppError::WebSocketError(format!("发送Pong失败: {}", e))));
                        }
                    }
                    _ => return Some(Ok(SocketMessage::Other)),
                }
            }
        }
    }

    fn send_text(&mut self, text: String) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.inner
                .send(Message::Text(text))
                .await
                .map_err(|e| AppError::WebSocketError(e.to_string()))
        }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(e) = self.inner.close(None).await {
                debug!(target: STREAM_CONNECTION_TARGET, "关闭WebSocket时出错: {}", e);
            }
        }
    }
}

/// 构建连接URL，凭证作为 `token` 查询参数
pub fn build_stream_url(base: &str, token: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(base)?;
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

//=============================================================================
// 连接统计
//=============================================================================

#[derive(Debug, Default)]
struct StatsCounters {
    connect_attempts: AtomicU64,
    reconnects_scheduled: AtomicU64,
    messages_received: AtomicU64,
    malformed_dropped: AtomicU64,
    unknown_dropped: AtomicU64,
}

/// 连接统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub connect_attempts: u64,
    pub reconnects_scheduled: u64,
    pub messages_received: u64,
    pub malformed_dropped: u64,
    pub unknown_dropped: u64,
}

impl StatsCounters {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            unknown_dropped: self.unknown_dropped.load(Ordering::Relaxed),
        }
    }
}

//=============================================================================
// 推送连接
//=============================================================================

/// 唯一的推送连接
///
/// 由顶层应用上下文显式创建并持有，所有消费者通过 [`StreamConnection::subscribe`]
/// 订阅，不各自建连。`shutdown()` 取消挂起的重连定时器并关闭连接，之后不会再重连。
pub struct StreamConnection {
    status_rx: watch::Receiver<ConnectionStatus>,
    bus: Arc<EventBus>,
    stats: Arc<StatsCounters>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    /// 立即开始连接，必须在 tokio 运行时内调用
    #[instrument(skip_all)]
    pub fn open<C: StreamConnector>(connector: C, config: &StreamConfig, session: Arc<SessionGate>) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let bus = EventBus::new();
        let stats = Arc::new(StatsCounters::default());
        let cancel = CancellationToken::new();

        info!(
            target: STREAM_CONNECTION_TARGET,
            log_type = "low_freq",
            url = %config.url,
            reconnect_delay_ms = config.reconnect_delay_ms,
            "🚀 启动推送连接"
        );

        let supervisor = Supervisor {
            connector,
            config: config.clone(),
            session,
            status_tx,
            bus: bus.clone(),
            stats: stats.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run().instrument(tracing::info_span!("stream_connection")));

        Self {
            status_rx,
            bus,
            stats,
            cancel,
            task: Some(task),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn connected(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.bus.subscribe(filter)
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    /// 拆除：取消重连定时器、关闭连接并等待后台任务结束
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(target: STREAM_CONNECTION_TARGET, "推送连接任务异常退出: {}", e);
            }
        }
        self.bus.close_all();
        info!(target: STREAM_CONNECTION_TARGET, log_type = "low_freq", "✅ 推送连接已拆除");
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 一次会话的结束原因
enum SessionEnd {
    Teardown,
    Terminated(String),
}

struct Supervisor<C> {
    connector: C,
    config: StreamConfig,
    session: Arc<SessionGate>,
    status_tx: watch::Sender<ConnectionStatus>,
    bus: Arc<EventBus>,
    stats: Arc<StatsCounters>,
    cancel: CancellationToken,
}

impl<C: StreamConnector> Supervisor<C> {
    /// 重连主循环：connecting → open → closed → (固定延迟) → connecting
    async fn run(self) {
        let reconnect_delay = self.config.reconnect_delay();

        'reconnect_loop: loop {
            self.status_tx.send_replace(ConnectionStatus::Connecting);
            let attempt = self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;

            let token = self.session.token();
            let connect_result = match build_stream_url(&self.config.url, token.as_deref()) {
                Ok(url) => {
                    debug!(target: STREAM_CONNECTION_TARGET, attempt, "🔄 推送连接尝试");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break 'reconnect_loop,
                        r = tokio::time::timeout(self.config.connect_timeout(), self.connector.connect(&url)) => match r {
                            Ok(result) => result,
                            Err(_) => Err(AppError::WebSocketError(format!(
                                "连接尝试超过 {} 秒未响应，已超时",
                                self.config.connect_timeout().as_secs()
                            ))),
                        },
                    }
                }
                Err(e) => Err(e),
            };

            match connect_result {
                Ok(mut socket) => {
                    self.status_tx.send_replace(ConnectionStatus::Open);
                    info!(target: STREAM_CONNECTION_TARGET, log_type = "low_freq", attempt, "✅ 推送连接已建立");

                    let end = self.run_session(&mut socket).await;
                    self.status_tx.send_replace(ConnectionStatus::Closed);

                    match end {
                        SessionEnd::Teardown => {
                            let _ = tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, socket.close()).await;
                            break 'reconnect_loop;
                        }
                        SessionEnd::Terminated(reason) => {
                            warn!(target: STREAM_CONNECTION_TARGET, log_type = "low_freq", %reason, "❌ 推送连接已断开");
                        }
                    }
                }
                Err(e) => {
                    self.status_tx.send_replace(ConnectionStatus::Closed);
                    warn!(
                        target: STREAM_CONNECTION_TARGET,
                        attempt,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "推送连接失败"
                    );
                }
            }

            // 固定延迟，没有指数退避，也没有次数上限
            self.stats.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
            info!(
                target: STREAM_CONNECTION_TARGET,
                delay_ms = reconnect_delay.as_millis() as u64,
                "⏳ 已安排重连"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break 'reconnect_loop,
                _ = sleep(reconnect_delay) => {}
            }
        }

        self.status_tx.send_replace(ConnectionStatus::Closed);
        debug!(target: STREAM_CONNECTION_TARGET, "推送连接监督任务已退出");
    }

    /// 单条连接上的消息循环
    async fn run_session(&self, socket: &mut C::Socket) -> SessionEnd {
        let mut keepalive = self.config.keepalive_interval().map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return SessionEnd::Teardown,

                msg = socket.recv() => match msg {
                    None => return SessionEnd::Terminated("远端结束了数据流".to_string()),
                    Some(Err(e)) => return SessionEnd::Terminated(e.to_string()),
                    Some(Ok(SocketMessage::Text(text))) => self.dispatch_text(&text),
                    Some(Ok(SocketMessage::Close(code))) => {
                        if code == Some(CLOSE_CODE_INVALID_TOKEN) {
                            warn!(
                                target: STREAM_CONNECTION_TARGET,
                                log_type = "low_freq",
                                error.summary = "session_unauthorized",
                                "🔒 服务端拒绝了推送连接凭证"
                            );
                            self.session.invalidate("推送连接凭证被拒绝");
                        }
                        return SessionEnd::Terminated(format!("收到关闭帧: {:?}", code));
                    }
                    Some(Ok(SocketMessage::Other)) => {}
                },

                _ = tick_optional(&mut keepalive) => {
                    if let Err(e) = socket.send_text(KEEPALIVE_PING.to_string()).await {
                        return SessionEnd::Terminated(format!("发送心跳失败: {}", e));
                    }
                    trace!(target: STREAM_CONNECTION_TARGET, "已发送心跳");
                }
            }
        }
    }

    /// 解析并按到达顺序分发；坏消息直接丢弃
    fn dispatch_text(&self, text: &str) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        if text == KEEPALIVE_PONG {
            return;
        }

        match parse_envelope(text) {
            ParseOutcome::Event(event) => {
                let kind = event.kind();
                let delivered = self.bus.publish(event);
                trace!(target: STREAM_CONNECTION_TARGET, kind = kind.as_wire(), delivered, "事件已分发");
            }
            ParseOutcome::Unknown(kind) => {
                self.stats.unknown_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(target: STREAM_CONNECTION_TARGET, %kind, "忽略未知类别的事件");
            }
            ParseOutcome::Malformed(reason) => {
                self.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(target: STREAM_CONNECTION_TARGET, %reason, "丢弃无法解析的消息");
            }
        }
    }
}

async fn tick_optional(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
