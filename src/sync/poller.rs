//! 快照轮询器
//!
//! 按固定间隔拉取一个命名资源，对外发布 `{ data, loading, error }` 读模型。
//!
//! ## 身份与过期结果
//! - 每次身份键变化（例如过滤条件变化）都会取消旧的轮询任务并立即发起新的获取。
//! - 读模型里带有代数 `generation`，写回结果前在 watch 的写锁内比较代数，
//!   旧身份的迟到响应一律丢弃，不依赖到达顺序。
//! - 定时器是轮询器显式持有的 `JoinHandle`，`shutdown()` 或 drop 时一并取消。

use crate::common::Result;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

/// 快照轮询日志目标
pub const SNAPSHOT_POLLER_TARGET: &str = "快照轮询";

pub type FetchFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// 无参数的异步获取函数
pub type FetchFn<T> = Arc<dyn Fn() -> FetchFuture<T> + Send + Sync>;

/// 把普通的 async 闭包包装成 [`FetchFn`]
pub fn fetch_fn<T, F, Fut>(f: F) -> FetchFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// 轮询配置
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// 刷新间隔，为零时只在身份变化或手动刷新时获取
    pub refresh_interval: Duration,
    pub enabled: bool,
    pub identity_key: Vec<String>,
}

impl PollerConfig {
    pub fn every_ms(refresh_interval_ms: u64) -> Self {
        Self {
            refresh_interval: Duration::from_millis(refresh_interval_ms),
            enabled: true,
            identity_key: Vec::new(),
        }
    }

    pub fn with_identity(mut self, identity_key: Vec<String>) -> Self {
        self.identity_key = identity_key;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// 轮询读模型
#[derive(Debug)]
pub struct PollState<T> {
    /// 最近一次成功的结果；失败时保留旧值
    pub data: Option<Arc<T>>,
    /// 当前是否有获取在进行
    pub loading: bool,
    /// 最近一次失败的可读描述，成功后清空
    pub error: Option<String>,
    /// 当前身份键
    pub identity: Vec<String>,
    /// 身份代数，每次重启加一
    pub generation: u64,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl<T> Clone for PollState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            loading: self.loading,
            error: self.error.clone(),
            identity: self.identity.clone(),
            generation: self.generation,
            last_success_at: self.last_success_at,
        }
    }
}

impl<T> Default for PollState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            identity: Vec::new(),
            generation: 0,
            last_success_at: None,
        }
    }
}

/// 快照轮询器
pub struct SnapshotPoller<T> {
    name: String,
    fetch: FetchFn<T>,
    config: PollerConfig,
    state_tx: watch::Sender<PollState<T>>,
    refresh: Arc<Notify>,
    /// 当前身份的轮询任务，即定时器句柄
    task: Option<JoinHandle<()>>,
}

impl<T: Send + Sync + 'static> SnapshotPoller<T> {
    /// 创建并立即启动，必须在 tokio 运行时内调用
    pub fn start(name: impl Into<String>, fetch: FetchFn<T>, config: PollerConfig) -> Self {
        let (state_tx, _) = watch::channel(PollState::default());
        let mut poller = Self {
            name: name.into(),
            fetch,
            config,
            state_tx,
            refresh: Arc::new(Notify::new()),
            task: None,
        };
        poller.restart(true);
        poller
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn watch(&self) -> watch::Receiver<PollState<T>> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> PollState<T> {
        self.state_tx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// 切换身份；键不变时不做任何事，返回是否重启
    pub fn set_identity(&mut self, identity_key: Vec<String>, fetch: FetchFn<T>) -> bool {
        if identity_key == self.config.identity_key {
            return false;
        }
        info!(
            target: SNAPSHOT_POLLER_TARGET,
            poller = %self.name,
            old = ?self.config.identity_key,
            new = ?identity_key,
            "身份变化，重启轮询"
        );
        self.config.identity_key = identity_key;
        self.fetch = fetch;
        self.restart(true);
        true
    }

    /// 启用或停用；停用会取消定时器，保留已有数据
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled == self.config.enabled {
            return;
        }
        self.config.enabled = enabled;
        self.restart(false);
    }

    /// 修改刷新间隔并按新间隔重新开始
    pub fn set_refresh_interval(&mut self, refresh_interval: Duration) {
        if refresh_interval == self.config.refresh_interval {
            return;
        }
        self.config.refresh_interval = refresh_interval;
        self.restart(false);
    }

    /// 立即为当前身份追加一次获取，不改变定时节奏
    pub fn refresh_now(&self) {
        if self.is_running() {
            self.refresh.notify_one();
        }
    }

    /// 取消所有挂起的获取和定时器
    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // 代数加一，保证被中止任务的任何写回都会被丢弃
        self.state_tx.send_modify(|s| {
            s.generation += 1;
            s.loading = false;
        });
        debug!(target: SNAPSHOT_POLLER_TARGET, poller = %self.name, "轮询器已关闭");
    }

    fn restart(&mut self, identity_changed: bool) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let enabled = self.config.enabled;
        let identity = self.config.identity_key.clone();
        let mut generation = 0;
        self.state_tx.send_modify(|s| {
            s.generation += 1;
            generation = s.generation;
            if identity_changed {
                // 旧身份的数据不能冒充新身份的结果
                s.data = None;
                s.error = None;
                s.last_success_at = None;
                s.identity = identity;
            }
            s.loading = enabled;
        });

        if !enabled {
            debug!(target: SNAPSHOT_POLLER_TARGET, poller = %self.name, "轮询已停用");
            return;
        }

        let name = self.name.clone();
        let span = tracing::info_span!("snapshot_poller", poller = %name, generation);
        self.task = Some(tokio::spawn(
            run_poll_loop(
                name,
                self.fetch.clone(),
                self.state_tx.clone(),
                generation,
                self.config.refresh_interval,
                self.refresh.clone(),
            )
            .instrument(span),
        ));
    }
}

impl<T> Drop for SnapshotPoller<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// 一个身份代数的完整轮询循环
async fn run_poll_loop<T: Send + Sync + 'static>(
    name: String,
    fetch: FetchFn<T>,
    state_tx: watch::Sender<PollState<T>>,
    generation: u64,
    refresh_interval: Duration,
    refresh: Arc<Notify>,
) {
    let mut ticker = (!refresh_interval.is_zero()).then(|| {
        let mut ticker = tokio::time::interval_at(Instant::now() + refresh_interval, refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        if let Err(e) = fetch_once(&name, &fetch, &state_tx, generation).await {
            if e.is_auth_failure() {
                // 授权失败需要重新登录，不再按计划重试
                warn!(target: SNAPSHOT_POLLER_TARGET, poller = %name, "授权失败，停止轮询");
                return;
            }
        }

        match ticker.as_mut() {
            Some(ticker) => {
                tokio::select! {
                    _ = ticker.tick() => {},
                    _ = refresh.notified() => {},
                }
            }
            None => refresh.notified().await,
        }
    }
}

/// 执行一次获取并在代数匹配时写回；返回获取本身的错误以便调用方决定是否继续
async fn fetch_once<T: Send + Sync + 'static>(
    name: &str,
    fetch: &FetchFn<T>,
    state_tx: &watch::Sender<PollState<T>>,
    generation: u64,
) -> Result<()> {
    state_tx.send_if_modified(|s| {
        if s.generation != generation || s.loading {
            return false;
        }
        s.loading = true;
        true
    });

    let result = (fetch)().await;

    let (outcome, error_message) = match result {
        Ok(value) => (Ok(Some(Arc::new(value))), None),
        Err(e) => {
            let message = e.operator_message();
            warn!(
                target: SNAPSHOT_POLLER_TARGET,
                poller = %name,
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "快照获取失败，保留上一次的数据"
            );
            (Err(e), Some(message))
        }
    };

    let data = match &outcome {
        Ok(data) => data.clone(),
        Err(_) => None,
    };

    let applied = state_tx.send_if_modified(|s| {
        if s.generation != generation {
            return false;
        }
        s.loading = false;
        match data {
            Some(data) => {
                s.data = Some(data);
                s.error = None;
                s.last_success_at = Some(Utc::now());
            }
            None => s.error = error_message,
        }
        true
    });

    if !applied {
        debug!(target: SNAPSHOT_POLLER_TARGET, poller = %name, generation, "丢弃过期身份的结果");
    }

    outcome.map(|_| ())
}
