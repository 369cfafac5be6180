//! 合并视图
//!
//! 把最近一次仪表盘快照和实时推送合成一份一致的视图。展示层只读这里。
//!
//! 优先级：
//! - 两边都能提供的字段（组合、熔断级别），自上次快照以来推送送达过同类更新时用推送值，
//!   否则用快照值。新快照到达会让推送切片重新让位给快照。
//! - 信号、成交、告警这类只追加的列表，推送缓冲区非空时只显示缓冲区，
//!   否则退回快照里内嵌的列表，两者从不拼接。
//! - 连接指示直接反映推送连接状态，不做去抖。

use crate::common::{
    config::BufferConfig,
    models::{CircuitBreakerLevel, CircuitBreakerStatus, DashboardSnapshot, PortfolioSummary, RiskAlert, SignalRecord, TradeRecord},
};
use crate::sync::poller::PollState;
use crate::sync::rolling_buffer::RollingBuffer;
use crate::sync::stream::{ConnectionStatus, StreamEvent, Subscription};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, Instrument};

/// 视图模型日志目标
pub const VIEW_MODEL_TARGET: &str = "视图模型";

/// 字段值的来源
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValueSource {
    #[default]
    Snapshot,
    Stream,
}

/// 发布给展示层的视图，总是可以由快照和缓冲区重新算出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedView {
    pub portfolio: Option<PortfolioSummary>,
    pub portfolio_source: ValueSource,
    /// 例如 `+$95.00`
    pub daily_pnl_display: Option<String>,
    pub circuit_breaker: CircuitBreakerLevel,
    pub circuit_breaker_reason: Option<String>,
    pub circuit_breaker_source: ValueSource,
    pub system_status: Option<String>,
    pub signals_today: u64,
    pub active_trades: u64,
    /// 从新到旧
    pub signals: Vec<SignalRecord>,
    pub trades: Vec<TradeRecord>,
    pub alerts: Vec<RiskAlert>,
    pub connected: bool,
    pub snapshot_loading: bool,
    pub snapshot_error: Option<String>,
    pub snapshot_fetched_at: Option<DateTime<Utc>>,
}

/// 合并规则本身，纯状态机，不涉及任何任务
#[derive(Debug)]
pub struct MergedViewModel {
    snapshot: Option<Arc<DashboardSnapshot>>,
    snapshot_loading: bool,
    snapshot_error: Option<String>,
    // 自上次快照以来推送送达的值
    stream_portfolio: Option<PortfolioSummary>,
    stream_circuit_breaker: Option<CircuitBreakerStatus>,
    signals: RollingBuffer<SignalRecord>,
    trades: RollingBuffer<TradeRecord>,
    alerts: RollingBuffer<RiskAlert>,
    connected: bool,
}

impl MergedViewModel {
    pub fn new(buffers: &BufferConfig) -> Self {
        Self {
            snapshot: None,
            snapshot_loading: false,
            snapshot_error: None,
            stream_portfolio: None,
            stream_circuit_breaker: None,
            signals: RollingBuffer::new(buffers.signals),
            trades: RollingBuffer::new(buffers.trades),
            alerts: RollingBuffer::new(buffers.alerts),
            connected: false,
        }
    }

    /// 整体替换快照；推送切片让位给新快照
    pub fn apply_snapshot(&mut self, snapshot: Arc<DashboardSnapshot>) {
        self.snapshot = Some(snapshot);
        self.stream_portfolio = None;
        self.stream_circuit_breaker = None;
    }

    /// 同步轮询器读模型；只有数据本身换了才算新快照
    pub fn apply_poll_state(&mut self, state: &PollState<DashboardSnapshot>) {
        self.snapshot_loading = state.loading;
        self.snapshot_error = state.error.clone();

        match &state.data {
            Some(data) => {
                let is_new = self.snapshot.as_ref().map_or(true, |current| !Arc::ptr_eq(current, data));
                if is_new {
                    self.apply_snapshot(data.clone());
                }
            }
            None => self.snapshot = None,
        }
    }

    /// 按到达顺序应用一条推送事件
    pub fn apply_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::PortfolioUpdate(portfolio) => self.stream_portfolio = Some(portfolio),
            StreamEvent::CircuitBreaker(status) => self.stream_circuit_breaker = Some(status),
            StreamEvent::NewSignal(signal) => {
                self.signals.push(signal);
            }
            StreamEvent::TradeExecuted(trade) => {
                self.trades.push(trade);
            }
            StreamEvent::RiskAlert(alert) => {
                self.alerts.push(alert);
            }
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn view(&self) -> MergedView {
        let snapshot = self.snapshot.as_deref();

        let (portfolio, portfolio_source) = match (&self.stream_portfolio, snapshot) {
            (Some(p), _) => (Some(p.clone()), ValueSource::Stream),
            (None, Some(s)) => (Some(s.portfolio.clone()), ValueSource::Snapshot),
            (None, None) => (None, ValueSource::Snapshot),
        };

        let (circuit_breaker, circuit_breaker_reason, circuit_breaker_source) =
            match (&self.stream_circuit_breaker, snapshot) {
                (Some(status), _) => (status.level, status.reason.clone(), ValueSource::Stream),
                (None, Some(s)) => (s.circuit_breaker, None, ValueSource::Snapshot),
                (None, None) => (CircuitBreakerLevel::default(), None, ValueSource::Snapshot),
            };

        MergedView {
            daily_pnl_display: portfolio.as_ref().map(|p| p.daily_pnl_display()),
            portfolio,
            portfolio_source,
            circuit_breaker,
            circuit_breaker_reason,
            circuit_breaker_source,
            system_status: snapshot.map(|s| s.system_status.clone()),
            signals_today: snapshot.map_or(0, |s| s.signals_today),
            active_trades: snapshot.map_or(0, |s| s.active_trades),
            signals: feed_or_snapshot(&self.signals, snapshot.map(|s| s.recent_signals.as_slice())),
            trades: feed_or_snapshot(&self.trades, snapshot.map(|s| s.recent_trades.as_slice())),
            alerts: feed_or_snapshot(&self.alerts, snapshot.map(|s| s.recent_alerts.as_slice())),
            connected: self.connected,
            snapshot_loading: self.snapshot_loading,
            snapshot_error: self.snapshot_error.clone(),
            snapshot_fetched_at: snapshot.and_then(|s| s.fetched_at),
        }
    }
}

/// 缓冲区非空时只用缓冲区
fn feed_or_snapshot<T: Clone>(buffer: &RollingBuffer<T>, snapshot_list: Option<&[T]>) -> Vec<T> {
    if !buffer.is_empty() {
        buffer.to_vec()
    } else {
        snapshot_list.map(|list| list.to_vec()).unwrap_or_default()
    }
}

/// 驱动任务：订阅快照、推送和连接状态，视图有变化时重新发布
pub struct ViewModelDriver {
    view_rx: watch::Receiver<MergedView>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ViewModelDriver {
    pub fn spawn(
        buffers: &BufferConfig,
        snapshots: watch::Receiver<PollState<DashboardSnapshot>>,
        events: Subscription,
        status: watch::Receiver<ConnectionStatus>,
    ) -> Self {
        let model = MergedViewModel::new(buffers);
        let (view_tx, view_rx) = watch::channel(model.view());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            run_driver(model, view_tx, snapshots, events, status, cancel.clone())
                .instrument(tracing::info_span!("view_model_driver")),
        );

        Self {
            view_rx,
            cancel,
            task: Some(task),
        }
    }

    pub fn watch(&self) -> watch::Receiver<MergedView> {
        self.view_rx.clone()
    }

    pub fn current(&self) -> MergedView {
        self.view_rx.borrow().clone()
    }

    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(target: VIEW_MODEL_TARGET, "视图驱动任务异常退出: {}", e);
            }
        }
    }
}

impl Drop for ViewModelDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_driver(
    mut model: MergedViewModel,
    view_tx: watch::Sender<MergedView>,
    mut snapshots: watch::Receiver<PollState<DashboardSnapshot>>,
    mut events: Subscription,
    mut status: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
) {
    model.apply_poll_state(&snapshots.borrow_and_update());
    model.set_connected(*status.borrow_and_update() == ConnectionStatus::Open);
    publish(&view_tx, &model);

    let mut snapshots_open = true;
    let mut events_open = true;
    let mut status_open = true;

    while snapshots_open || events_open || status_open {
        tokio::select! {
            _ = cancel.cancelled() => break,

            changed = snapshots.changed(), if snapshots_open => match changed {
                Ok(()) => model.apply_poll_state(&snapshots.borrow_and_update()),
                Err(_) => {
                    debug!(target: VIEW_MODEL_TARGET, "快照来源已关闭");
                    snapshots_open = false;
                    continue;
                }
            },

            event = events.recv(), if events_open => match event {
                Some(event) => {
                    trace!(target: VIEW_MODEL_TARGET, kind = event.kind().as_wire(), "应用推送事件");
                    model.apply_event(event);
                }
                None => {
                    debug!(target: VIEW_MODEL_TARGET, "推送订阅已结束");
                    events_open = false;
                    continue;
                }
            },

            changed = status.changed(), if status_open => match changed {
                Ok(()) => model.set_connected(*status.borrow_and_update() == ConnectionStatus::Open),
                Err(_) => {
                    status_open = false;
                    model.set_connected(false);
                }
            },
        }

        publish(&view_tx, &model);
    }

    events.release();
    debug!(target: VIEW_MODEL_TARGET, "视图驱动任务已退出");
}

fn publish(view_tx: &watch::Sender<MergedView>, model: &MergedViewModel) {
    let next = model.view();
    view_tx.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}
