// 文件: src/command/confirm.rs
// 二次确认门：第一次调用只布防，窗口内第二次调用才真正下发远程命令
use crate::common::{models::CommandReceipt, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

/// 确认门日志目标
pub const CONFIRM_GATE_TARGET: &str = "确认门";

/// 确认门状态；Idle 不会直接进入 Executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmState {
    Idle,
    Armed,
    Executing,
}

/// 单次 `invoke()` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// 已布防，等待确认
    Armed,
    /// 已确认并下发
    Dispatched,
    /// 命令执行中，本次调用被忽略
    Ignored,
}

/// 最近一次命令的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Succeeded(CommandReceipt),
    Failed(String),
}

/// 远程命令
pub trait RemoteCommand: Send + Sync + 'static {
    /// 用于日志
    fn name(&self) -> &'static str;

    fn execute(&self) -> impl Future<Output = Result<CommandReceipt>> + Send;
}

struct GateInner {
    state: ConfirmState,
    /// 每次布防加一，过期任务只撤销自己那一轮
    arm_epoch: u64,
    expiry: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<GateInner>,
    state_tx: watch::Sender<ConfirmState>,
    outcome_tx: watch::Sender<Option<CommandOutcome>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, GateInner> {
        // 临界区内没有会 panic 的操作，中毒后直接沿用内部状态
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 必须在持锁时调用，保证 watch 与内部状态一致
    fn set_state(&self, inner: &mut GateInner, state: ConfirmState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }
}

/// 二次确认门
///
/// 每个实例独立持有自己的状态和过期定时器；两个不同的危险操作互不影响。
pub struct ConfirmationGatedAction<C> {
    command: Arc<C>,
    window: Duration,
    shared: Arc<Shared>,
}

impl<C: RemoteCommand> ConfirmationGatedAction<C> {
    pub fn new(command: C, window: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConfirmState::Idle);
        let (outcome_tx, _) = watch::channel(None);
        Self {
            command: Arc::new(command),
            window,
            shared: Arc::new(Shared {
                inner: Mutex::new(GateInner {
                    state: ConfirmState::Idle,
                    arm_epoch: 0,
                    expiry: None,
                }),
                state_tx,
                outcome_tx,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.command.name()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn state(&self) -> ConfirmState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConfirmState> {
        self.shared.state_tx.subscribe()
    }

    /// 最近一次命令结果，状态回到 Idle 之前写入
    pub fn watch_outcome(&self) -> watch::Receiver<Option<CommandOutcome>> {
        self.shared.outcome_tx.subscribe()
    }

    pub fn last_outcome(&self) -> Option<CommandOutcome> {
        self.shared.outcome_tx.borrow().clone()
    }

    /// 操作员点击一次；从不等待远程调用
    pub fn invoke(&self) -> InvokeOutcome {
        let mut inner = self.shared.lock();
        match inner.state {
            ConfirmState::Idle => {
                inner.arm_epoch += 1;
                let epoch = inner.arm_epoch;
                self.shared.set_state(&mut inner, ConfirmState::Armed);

                let shared = self.shared.clone();
                let window = self.window;
                let name = self.command.name();
                inner.expiry = Some(tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    let mut inner = shared.lock();
                    if inner.state == ConfirmState::Armed && inner.arm_epoch == epoch {
                        inner.expiry = None;
                        shared.set_state(&mut inner, ConfirmState::Idle);
                        info!(target: CONFIRM_GATE_TARGET, command = name, "确认窗口已过期，撤销布防");
                    }
                }));

                info!(
                    target: CONFIRM_GATE_TARGET,
                    command = self.command.name(),
                    window_ms = self.window.as_millis() as u64,
                    "⚠️ 已布防，窗口内再次确认将下发命令"
                );
                InvokeOutcome::Armed
            }
            ConfirmState::Armed => {
                if let Some(expiry) = inner.expiry.take() {
                    expiry.abort();
                }
                self.shared.set_state(&mut inner, ConfirmState::Executing);
                drop(inner);

                self.dispatch();
                InvokeOutcome::Dispatched
            }
            ConfirmState::Executing => InvokeOutcome::Ignored,
        }
    }

    fn dispatch(&self) {
        let command = self.command.clone();
        let shared = self.shared.clone();
        let name = command.name();
        info!(target: CONFIRM_GATE_TARGET, log_type = "low_freq", command = name, "🚀 下发远程命令");

        tokio::spawn(
            async move {
                let outcome = match command.execute().await {
                    Ok(receipt) => {
                        info!(
                            target: CONFIRM_GATE_TARGET,
                            log_type = "low_freq",
                            command = name,
                            status = %receipt.status,
                            "✅ 远程命令完成"
                        );
                        CommandOutcome::Succeeded(receipt)
                    }
                    Err(e) => {
                        warn!(
                            target: CONFIRM_GATE_TARGET,
                            log_type = "low_freq",
                            command = name,
                            error.summary = e.get_error_type_summary(),
                            error.details = %e,
                            "❌ 远程命令失败"
                        );
                        CommandOutcome::Failed(e.operator_message())
                    }
                };

                shared.outcome_tx.send_replace(Some(outcome));
                // 无论成败都回到 Idle
                let mut inner = shared.lock();
                shared.set_state(&mut inner, ConfirmState::Idle);
            }
            .instrument(tracing::info_span!("remote_command", command = name)),
        );
    }

    /// 拆除：取消过期定时器；已经下发的命令不会被中止
    pub fn shutdown(&self) {
        let mut inner = self.shared.lock();
        if let Some(expiry) = inner.expiry.take() {
            expiry.abort();
        }
        if inner.state == ConfirmState::Armed {
            self.shared.set_state(&mut inner, ConfirmState::Idle);
        }
    }
}

impl<C> Drop for ConfirmationGatedAction<C> {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(expiry) = inner.expiry.take() {
            expiry.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop(Arc<AtomicUsize>);

    impl RemoteCommand for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        fn execute(&self) -> impl Future<Output = Result<CommandReceipt>> + Send {
            self.0.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::CommandError("boom".into())) }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_never_goes_straight_to_executing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = ConfirmationGatedAction::new(Noop(calls.clone()), Duration::from_millis(3000));
        let mut states = gate.watch();

        assert_eq!(gate.invoke(), InvokeOutcome::Armed);
        assert_eq!(*states.borrow_and_update(), ConfirmState::Armed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disarms() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = ConfirmationGatedAction::new(Noop(calls.clone()), Duration::from_millis(3000));
        gate.invoke();
        gate.shutdown();
        assert_eq!(gate.state(), ConfirmState::Idle);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(gate.state(), ConfirmState::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
