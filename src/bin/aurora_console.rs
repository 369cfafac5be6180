// AURORA 操作台主程序
use anyhow::Result;
use aurora_console::command::{
    CommandOutcome, ConfirmationGatedAction, EmergencyStop, InvokeOutcome, RemoteCommand, ResumeTrading,
};
use aurora_console::common::{
    config::resolve_token,
    logging_setup::init_logging,
    ApiClient, ConsoleConfig, SessionGate, SessionState,
};
use aurora_console::sync::{
    fetch_fn, EventFilter, MergedView, PollerConfig, SnapshotPoller, StreamConnection, TungsteniteConnector,
    ValueSource, ViewModelDriver,
};
use clap::Parser;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const APP_TARGET: &str = "操作台";
const DEFAULT_CONFIG_PATH: &str = "config/ConsoleConfig.toml";

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "aurora_console", about = "AURORA 交易系统操作台")]
struct Cli {
    /// 配置文件路径，不存在时使用默认配置
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// API 凭证，未提供时读取 AURORA_TOKEN 环境变量
    #[arg(long)]
    token: Option<String>,

    /// 覆盖配置中的日志级别
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, used_defaults) = load_config(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.logging.log_level = level;
    }

    // guard 必须活到 main 结束
    let _log_guard = init_logging(&config.logging)?;
    if used_defaults {
        warn!(target: APP_TARGET, path = %cli.config, "配置文件不存在，使用默认配置");
    }

    let session = SessionGate::new(resolve_token(cli.token));
    let api = ApiClient::new(&config.api, session.clone())?;

    info!(
        target: APP_TARGET,
        log_type = "low_freq",
        api = %config.api.base_url,
        stream = %config.stream.url,
        session = ?session.state(),
        "🚀 操作台启动"
    );

    let mut stream = StreamConnection::open(TungsteniteConnector, &config.stream, session.clone());

    let dashboard_api = api.clone();
    let mut dashboard = SnapshotPoller::start(
        "dashboard",
        fetch_fn(move || {
            let api = dashboard_api.clone();
            async move { api.dashboard().await }
        }),
        PollerConfig::every_ms(config.polling.dashboard_refresh_ms),
    );

    let mut driver = ViewModelDriver::spawn(
        &config.buffers,
        dashboard.watch(),
        stream.subscribe(EventFilter::All),
        stream.watch_status(),
    );

    let stop_gate = ConfirmationGatedAction::new(EmergencyStop::new(api.clone()), config.confirm.window());
    let resume_gate = ConfirmationGatedAction::new(ResumeTrading::new(api.clone()), config.confirm.window());

    let mut views = driver.watch();
    let mut session_rx = session.watch();
    let mut stop_outcomes = stop_gate.watch_outcome();
    let mut resume_outcomes = resume_gate.watch_outcome();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("命令: stop | resume | refresh | quit");
    print_status(&views.borrow_and_update());

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                print_status(&views.borrow_and_update());
            }

            changed = session_rx.changed() => {
                if changed.is_err() || *session_rx.borrow_and_update() == SessionState::LoginRequired {
                    eprintln!("会话已失效，请重新登录后再启动操作台");
                    break;
                }
            }

            Ok(()) = stop_outcomes.changed() => {
                print_outcome(stop_gate.name(), stop_outcomes.borrow_and_update().as_ref());
            }

            Ok(()) = resume_outcomes.changed() => {
                print_outcome(resume_gate.name(), resume_outcomes.borrow_and_update().as_ref());
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "stop" => report_invoke(&stop_gate, stop_gate.invoke()),
                    "resume" => report_invoke(&resume_gate, resume_gate.invoke()),
                    "refresh" => {
                        dashboard.refresh_now();
                        println!("已请求刷新快照");
                    }
                    "quit" | "exit" => break,
                    "" => {}
                    other => println!("未知命令: {}", other),
                },
                Ok(None) => break,
                Err(e) => {
                    error!(target: APP_TARGET, "读取标准输入失败: {}", e);
                    break;
                }
            },

            _ = tokio::signal::ctrl_c() => {
                info!(target: APP_TARGET, "收到中断信号");
                break;
            }
        }
    }

    stop_gate.shutdown();
    resume_gate.shutdown();
    driver.shutdown().await;
    dashboard.shutdown();
    stream.shutdown().await;

    info!(target: APP_TARGET, log_type = "low_freq", "✅ 操作台已退出");
    Ok(())
}

/// 日志尚未初始化，返回是否回退到默认配置，由调用方在日志就绪后记录
fn load_config(path: &str) -> Result<(ConsoleConfig, bool)> {
    if Path::new(path).exists() {
        Ok((ConsoleConfig::from_file(path)?, false))
    } else {
        Ok((ConsoleConfig::default(), true))
    }
}

fn print_status(view: &MergedView) {
    let source = |s: ValueSource| match s {
        ValueSource::Snapshot => "快照",
        ValueSource::Stream => "推送",
    };

    let pnl = view.daily_pnl_display.as_deref().unwrap_or("--");
    let equity = view
        .portfolio
        .as_ref()
        .map(|p| format!("{:.2}", p.total_equity))
        .unwrap_or_else(|| "--".to_string());
    let link = if view.connected { "在线" } else { "离线" };
    let loading = if view.snapshot_loading { " (刷新中)" } else { "" };

    println!(
        "[{}] 权益 {} | 当日盈亏 {} ({}) | 熔断 {} ({}) | 信号 {} 成交 {} 告警 {}{}",
        link,
        equity,
        pnl,
        source(view.portfolio_source),
        view.circuit_breaker,
        source(view.circuit_breaker_source),
        view.signals.len(),
        view.trades.len(),
        view.alerts.len(),
        loading,
    );

    if let Some(err) = &view.snapshot_error {
        println!("  快照错误: {}", err);
    }
}

fn report_invoke<C: RemoteCommand>(gate: &ConfirmationGatedAction<C>, outcome: InvokeOutcome) {
    match outcome {
        InvokeOutcome::Armed => println!(
            "{}: 已布防，{} 毫秒内再次输入以确认",
            gate.name(),
            gate.window().as_millis()
        ),
        InvokeOutcome::Dispatched => println!("{}: 已下发", gate.name()),
        InvokeOutcome::Ignored => println!("{}: 命令执行中，已忽略", gate.name()),
    }
}

fn print_outcome(name: &str, outcome: Option<&CommandOutcome>) {
    match outcome {
        Some(CommandOutcome::Succeeded(receipt)) => println!("{}: 完成 {} {}", name, receipt.status, receipt.message),
        Some(CommandOutcome::Failed(message)) => println!("{}: 失败 {}", name, message),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_reports_default_fallback() {
        let (config, used_defaults) = load_config("config/does_not_exist.toml").unwrap();
        assert!(used_defaults);
        assert_eq!(config.api.base_url, ConsoleConfig::default().api.base_url);
    }

    #[test]
    fn test_existing_config_is_not_a_fallback() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/ConsoleConfig.toml");
        let (_, used_defaults) = load_config(path).unwrap();
        assert!(!used_defaults);
    }
}
