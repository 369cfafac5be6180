// 文件: src/command/remote.rs
// 后端控制命令：紧急停止与恢复交易，都是无请求体的 POST
use crate::command::confirm::RemoteCommand;
use crate::common::{models::CommandReceipt, ApiClient, Result};
use std::future::Future;

/// 撤销全部挂单并平掉全部持仓
#[derive(Debug, Clone)]
pub struct EmergencyStop {
    api: ApiClient,
}

impl EmergencyStop {
    pub const PATH: &'static str = "/emergency-stop";

    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

impl RemoteCommand for EmergencyStop {
    fn name(&self) -> &'static str {
        "emergency_stop"
    }

    fn execute(&self) -> impl Future<Output = Result<CommandReceipt>> + Send {
        self.api.post_command(Self::PATH)
    }
}

/// 紧急停止之后恢复交易
#[derive(Debug, Clone)]
pub struct ResumeTrading {
    api: ApiClient,
}

impl ResumeTrading {
    pub const PATH: &'static str = "/resume";

    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

impl RemoteCommand for ResumeTrading {
    fn name(&self) -> &'static str {
        "resume_trading"
    }

    fn execute(&self) -> impl Future<Output = Result<CommandReceipt>> + Send {
        self.api.post_command(Self::PATH)
    }
}
